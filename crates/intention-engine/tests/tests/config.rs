use std::io::Write;
use std::sync::Arc;

use intention_engine::compensation::CompensationStatus;
use intention_engine::testing::{ScriptedPlanner, ScriptedTools};
use intention_engine::tools::ToolError;
use intention_engine::{EngineConfig, ExecutionRequest, ExecutionStatus, Orchestrator, Plan, PlanStep};
use serde_json::json;

const CONFIG: &str = r#"
orchestratorVersion: "3.1.0"
defaultStepTimeoutMs: 2000
breaker:
  failureThreshold: 3
cost:
  maxDailyCostPerUser: 20.0
logging:
  level: debug
  format: json
tools:
  - name: reserve_hotel
    schemaVersion: "4"
    estimatedCost: 0.5
    parameters:
      - name: hotel_id
        kind: string
        required: true
      - name: nights
        kind: integer
        required: true
    outputFields: [reservation_id]
  - name: charge_card
    parameters:
      - name: amount
        kind: number
        required: true
    outputFields: [charge_id]
compensations:
  - toolName: reserve_hotel
    undoTool: cancel_reservation
    mapping:
      strategy: output_field
      source: reservation_id
      target: reservation_id
  - toolName: charge_card
    undoTool: refund_charge
    mapping:
      strategy: full_output
"#;

#[tokio::test]
async fn test_engine_from_config_file() -> anyhow::Result<()> {
	let mut file = tempfile::NamedTempFile::new()?;
	file.write_all(CONFIG.as_bytes())?;
	let config = EngineConfig::from_file(file.path()).await?;

	assert_eq!(config.orchestrator_version, "3.1.0");
	assert_eq!(config.breaker.failure_threshold, 3);
	assert_eq!(config.tools.len(), 2);
	let registry = config.tool_registry();
	let hotel = registry.get("reserve_hotel").expect("tool from config");
	assert_eq!(hotel.schema_version, "4");
	assert_eq!(hotel.estimated_cost, 0.5);

	let tools = Arc::new(
		ScriptedTools::new()
			.with_output("reserve_hotel", json!({"reservation_id": "H-9"}))
			.with_output("charge_card", json!({"charge_id": "C-1", "amount": 240.0})),
	);
	tools.fail_next("send_comm", ToolError::server("mailer down"));
	let orchestrator = Orchestrator::builder(tools.clone(), Arc::new(ScriptedPlanner::new()))
		.with_config(config)
		.build();

	let plan = Plan::new(
		"trip",
		vec![
			PlanStep::new("hotel", "reserve_hotel")
				.with_param("hotel_id", "h-1")
				.with_param("nights", 2),
			PlanStep::new("pay", "charge_card")
				.with_param("amount", 240.0)
				.depends_on("hotel"),
			PlanStep::new("notify", "send_comm").depends_on("pay"),
		],
	);
	let result = orchestrator
		.execute_plan(ExecutionRequest::new("book a weekend away"), plan)
		.await?;

	assert_eq!(result.state, ExecutionStatus::Failed);
	let report = result.compensation.expect("compensation ran");
	let undone: Vec<_> = report
		.entries
		.iter()
		.map(|e| (e.undo_tool.as_deref(), e.status))
		.collect();
	assert_eq!(
		undone,
		vec![
			(Some("refund_charge"), CompensationStatus::Compensated),
			(Some("cancel_reservation"), CompensationStatus::Compensated),
		]
	);
	assert_eq!(tools.calls_for("refund_charge")[0].parameters["charge_id"], "C-1");
	assert_eq!(tools.calls_for("cancel_reservation")[0].parameters["reservation_id"], "H-9");
	Ok(())
}

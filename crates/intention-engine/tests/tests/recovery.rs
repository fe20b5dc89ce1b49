use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use intention_engine::breaker::{BreakerConfig, BreakerState, CircuitBreakerRegistry};
use intention_engine::compensation::CompensationStatus;
use intention_engine::plan::PlanConstraints;
use intention_engine::planner::PlannerError;
use intention_engine::tools::ToolError;
use intention_engine::{ErrorCode, ExecutionRequest, ExecutionStatus, ParamValue, Plan, PlanStep};

use crate::common::*;

fn booking_plan() -> Plan {
	Plan::new(
		"date-night",
		vec![
			PlanStep::new("book", "book_restaurant_table")
				.with_param("restaurant_id", "r-7")
				.with_param("party_size", 2),
			PlanStep::new("calendar", "add_calendar_event")
				.with_param("title", "Date night")
				.depends_on("book"),
			PlanStep::new("notify", "send_comm")
				.with_param("message", "See you at 8")
				.depends_on("calendar"),
		],
	)
}

#[tokio::test]
async fn test_failure_compensates_in_reverse_order() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	engine.tools.fail_next("send_comm", ToolError::server("smtp relay down"));
	engine
		.tools
		.fail_next("delete_calendar_event", ToolError::server("calendar api down"));

	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("date night"), booking_plan())
		.await?;

	assert_eq!(result.state, ExecutionStatus::Failed);
	assert_matches!(
		&result.error,
		Some(f) if f.code == ErrorCode::ToolExecutionFailed && f.step_id.as_deref() == Some("notify")
	);

	let order = engine.tools.call_order();
	assert_eq!(
		order[order.len() - 2..],
		["delete_calendar_event", "cancel_booking"]
	);
	assert_eq!(engine.tools.calls_for("cancel_booking")[0].parameters["booking_id"], "BK-1");
	assert_eq!(engine.tools.calls_for("delete_calendar_event")[0].parameters["event_id"], "EV-1");

	let report = result.compensation.expect("compensation ran");
	let steps: Vec<_> = report
		.entries
		.iter()
		.map(|e| (e.step_id.as_str(), e.status))
		.collect();
	assert_eq!(
		steps,
		vec![
			("calendar", CompensationStatus::Failed),
			("book", CompensationStatus::Compensated),
		]
	);
	Ok(())
}

#[tokio::test]
async fn test_invalid_parameters_are_regenerated_in_place() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	engine.tools.fail_next(
		"book_restaurant_table",
		ToolError::from_status(422, "restaurant r-42 does not take parties of 2 online"),
	);
	engine.planner.push_parameters(BTreeMap::from([
		("restaurant_id".to_string(), ParamValue::step_ref("search", Some("results.0.id"))),
		("party_size".to_string(), ParamValue::literal(2)),
		("contact_name".to_string(), ParamValue::literal("Sam")),
	]));

	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("thai dinner"), dinner_plan())
		.await?;

	assert_eq!(result.state, ExecutionStatus::Completed);
	assert_eq!(result.completed_steps, 3);
	assert_eq!(engine.planner.regenerated_steps(), vec!["book"]);
	assert!(engine.planner.feedback().is_empty());

	let bookings = engine.tools.calls_for("book_restaurant_table");
	assert_eq!(bookings.len(), 2);
	assert_eq!(bookings[1].parameters["contact_name"], "Sam");
	assert_eq!(bookings[1].parameters["restaurant_id"], "r-42");
	assert_eq!(engine.tools.call_count("search_restaurant"), 1);
	Ok(())
}

#[tokio::test]
async fn test_parameter_repair_gives_up_after_max_attempts() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	engine.tools.fail_times(
		"book_restaurant_table",
		ToolError::validation("party_size out of range"),
		3,
	);
	for _ in 0..2 {
		engine.planner.push_parameters(BTreeMap::from([
			("restaurant_id".to_string(), ParamValue::literal("r-42")),
			("party_size".to_string(), ParamValue::literal(2)),
		]));
	}

	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("thai dinner"), dinner_plan())
		.await?;

	assert_eq!(result.state, ExecutionStatus::Failed);
	assert_matches!(
		result.error,
		Some(f) if f.code == ErrorCode::ToolValidationFailed && f.step_id.as_deref() == Some("book")
	);
	assert_eq!(engine.tools.call_count("book_restaurant_table"), 3);
	assert_eq!(engine.tools.call_count("send_comm"), 0);
	Ok(())
}

#[tokio::test]
async fn test_execution_failure_replans_around_failed_step() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	engine.tools.fail_next(
		"book_restaurant_table",
		ToolError::from_status(409, "no tables left"),
	);
	engine.planner.push_repair(Plan::new(
		"dinner-alt",
		vec![
			search_step(),
			PlanStep::new("book_alt", "book_restaurant_table")
				.with_ref("restaurant_id", "search", Some("results.0.id"))
				.with_param("party_size", 2)
				.with_param("contact_name", "Sam")
				.depends_on("search"),
			PlanStep::new("notify", "send_comm")
				.with_param("message", "Booked an alternative")
				.depends_on("book_alt"),
		],
	));

	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("thai dinner"), dinner_plan())
		.await?;

	assert_eq!(result.state, ExecutionStatus::Completed);
	assert_eq!(result.completed_steps, 3);
	assert_eq!(result.total_steps, 3);
	assert_eq!(engine.tools.call_count("search_restaurant"), 1);
	assert_eq!(engine.tools.call_count("book_restaurant_table"), 2);

	let feedback = engine.planner.feedback();
	assert_eq!(feedback.len(), 1);
	assert_eq!(feedback[0].failed_step_id, "book");
	assert_eq!(feedback[0].error.code, ErrorCode::ToolExecutionFailed);
	assert_eq!(feedback[0].completed_step_ids, vec!["search"]);
	Ok(())
}

#[tokio::test]
async fn test_open_circuit_short_circuits_later_executions() -> anyhow::Result<()> {
	let breakers = Arc::new(CircuitBreakerRegistry::in_memory(BreakerConfig::default()).with_override(
		"send_comm",
		BreakerConfig {
			failure_threshold: 1,
			..Default::default()
		},
	));
	let engine = engine_with(dinner_scripted_tools(), |b| b.with_breakers(breakers.clone()));
	engine
		.tools
		.fail_next("send_comm", ToolError::from_status(503, "sms gateway unavailable"));

	let first = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("dinner"), dinner_plan())
		.await?;
	assert_eq!(first.state, ExecutionStatus::Failed);
	assert_matches!(first.error, Some(f) if f.code == ErrorCode::ToolExecutionFailed);

	let second = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("dinner again"), dinner_plan())
		.await?;
	assert_eq!(second.state, ExecutionStatus::Failed);
	assert_matches!(second.error, Some(f) if f.code == ErrorCode::CircuitBreakerOpen);
	assert_eq!(engine.tools.call_count("send_comm"), 1);
	assert_eq!(breakers.state("send_comm").await?.state, BreakerState::Open);
	assert_eq!(breakers.state("book_restaurant_table").await?.state, BreakerState::Closed);

	// Both bookings were undone
	assert_eq!(engine.tools.call_count("cancel_booking"), 2);
	Ok(())
}

#[tokio::test]
async fn test_concurrent_failures_in_one_batch_open_the_circuit() -> anyhow::Result<()> {
	let breakers = Arc::new(CircuitBreakerRegistry::in_memory(BreakerConfig::default()).with_override(
		"send_comm",
		BreakerConfig {
			failure_threshold: 3,
			..Default::default()
		},
	));
	let tools = dinner_scripted_tools().with_delay("send_comm", Duration::from_millis(10));
	let engine = engine_with(tools, |b| b.with_breakers(breakers.clone()));
	engine
		.tools
		.fail_times("send_comm", ToolError::server("sms gateway down"), 3);
	engine
		.planner
		.push_repair_error(PlannerError::Failed("no other channel".into()));
	let plan = Plan::new(
		"broadcast",
		["alice", "bob", "carol"]
			.into_iter()
			.map(|to| PlanStep::new(format!("notify-{to}"), "send_comm").with_param("message", format!("Hi {to}")))
			.collect(),
	);

	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("tell everyone"), plan)
		.await?;

	assert_eq!(result.state, ExecutionStatus::Failed);
	assert_eq!(engine.tools.call_count("send_comm"), 3);
	let circuit = breakers.state("send_comm").await?;
	assert_eq!(circuit.state, BreakerState::Open);
	assert_eq!(circuit.failure_count, 3);
	Ok(())
}

#[tokio::test]
async fn test_slow_step_times_out() -> anyhow::Result<()> {
	let tools = dinner_scripted_tools().with_delay("add_calendar_event", Duration::from_millis(500));
	let engine = engine(tools);
	engine
		.planner
		.push_repair_error(PlannerError::Failed("no alternative calendar".into()));
	let mut plan = booking_plan();
	plan.steps[1] = plan.steps[1].clone().with_timeout_ms(20);

	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("date night"), plan)
		.await?;

	assert_eq!(result.state, ExecutionStatus::Failed);
	assert_matches!(
		&result.error,
		Some(f) if f.code == ErrorCode::Timeout && f.step_id.as_deref() == Some("calendar")
	);
	assert_eq!(engine.tools.call_count("send_comm"), 0);
	let report = result.compensation.expect("booking compensated");
	assert_eq!(report.compensated(), 1);
	assert_eq!(engine.tools.call_count("cancel_booking"), 1);
	assert_eq!(engine.planner.feedback()[0].error.code, ErrorCode::Timeout);
	Ok(())
}

#[tokio::test]
async fn test_execution_deadline_times_out_and_compensates() -> anyhow::Result<()> {
	let tools = dinner_scripted_tools().with_delay("book_restaurant_table", Duration::from_millis(100));
	let engine = engine(tools);
	let plan = booking_plan().with_constraints(PlanConstraints {
		max_execution_time_ms: Some(50),
		..Default::default()
	});

	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("date night"), plan)
		.await?;

	assert_eq!(result.state, ExecutionStatus::Timeout);
	assert!(!result.success);
	assert_matches!(result.error, Some(f) if f.code == ErrorCode::Timeout);
	assert_eq!(engine.tools.call_count("add_calendar_event"), 0);
	assert_eq!(engine.tools.call_count("cancel_booking"), 1);
	Ok(())
}

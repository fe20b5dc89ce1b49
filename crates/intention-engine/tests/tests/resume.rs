use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use intention_engine::checkpoint::ResumeRecommendation;
use intention_engine::stateful::{MemoryStore, StateStore};
use intention_engine::testing::ScriptedTools;
use intention_engine::tools::{ParamKind, ToolDefinition, ToolParameter};
use intention_engine::{EngineConfig, ErrorCode, ExecutionRequest, ExecutionStatus};

use crate::common::*;

/// Config whose invocation budget is used up by one slow search.
fn short_invocation(version: &str) -> EngineConfig {
	EngineConfig {
		orchestrator_version: version.to_string(),
		execution_budget_ms: 300,
		checkpoint_margin_ms: 150,
		default_step_timeout_ms: 200,
		..Default::default()
	}
}

fn slow_search_tools() -> ScriptedTools {
	dinner_scripted_tools().with_delay("search_restaurant", Duration::from_millis(150))
}

async fn suspend(store: &Arc<MemoryStore>, execution_id: &str) -> anyhow::Result<Engine> {
	let store: Arc<dyn StateStore> = store.clone();
	let engine = engine_with(slow_search_tools(), |b| {
		b.with_config(short_invocation("1.0.0")).with_state_store(store)
	});
	let result = engine
		.orchestrator
		.execute_plan(
			ExecutionRequest::new("thai dinner").with_execution_id(execution_id),
			dinner_plan(),
		)
		.await?;

	assert_eq!(result.state, ExecutionStatus::Suspended);
	assert!(!result.success);
	assert!(result.error.is_none());
	assert_eq!(result.completed_steps, 1);
	assert_eq!(
		result.summary.as_deref(),
		Some("Thai dinner for two: 1/3 steps completed, suspended at checkpoint")
	);
	assert_eq!(engine.tools.call_order(), vec!["search_restaurant"]);
	Ok(engine)
}

#[tokio::test]
async fn test_suspend_and_resume_without_drift() -> anyhow::Result<()> {
	let store = Arc::new(MemoryStore::new());
	let engine = suspend(&store, "exec-resume").await?;

	let result = engine.orchestrator.resume("exec-resume").await?;

	assert_eq!(result.state, ExecutionStatus::Completed);
	assert_eq!(result.completed_steps, 3);
	let drift = result.drift.expect("drift evaluated on resume");
	assert!(!drift.drifted);
	assert_eq!(drift.recommendation, ResumeRecommendation::SafeToResume);
	assert_eq!(engine.tools.call_count("search_restaurant"), 1);
	assert_eq!(engine.tools.call_count("book_restaurant_table"), 1);
	Ok(())
}

#[tokio::test]
async fn test_compatible_upgrade_resumes_automatically() -> anyhow::Result<()> {
	let store = Arc::new(MemoryStore::new());
	suspend(&store, "exec-upgrade").await?;

	let shared: Arc<dyn StateStore> = store.clone();
	let upgraded = engine_with(dinner_scripted_tools(), |b| {
		b.with_config(short_invocation("1.1.0")).with_state_store(shared)
	});
	let result = upgraded.orchestrator.resume("exec-upgrade").await?;

	assert_eq!(result.state, ExecutionStatus::Completed);
	let drift = result.drift.expect("drift evaluated on resume");
	assert!(drift.drifted);
	assert!(drift.orchestrator_version_changed);
	assert_eq!(drift.simulated_steps, 2);
	assert!(drift.divergent_steps.is_empty());
	assert_eq!(drift.recommendation, ResumeRecommendation::SafeToResume);
	assert_eq!(upgraded.tools.call_count("search_restaurant"), 0);
	Ok(())
}

#[tokio::test]
async fn test_breaking_schema_blocks_resume_until_approved() -> anyhow::Result<()> {
	let store = Arc::new(MemoryStore::new());
	suspend(&store, "exec-drift").await?;

	let mut registry = dinner_tools();
	registry.register(
		ToolDefinition::new("book_restaurant_table")
			.with_schema_version("2")
			.with_parameter(ToolParameter::required("venue_id", ParamKind::String))
			.with_parameter(ToolParameter::required("party_size", ParamKind::Integer))
			.with_output_fields(["booking_id"]),
	);
	let shared: Arc<dyn StateStore> = store.clone();
	let upgraded = engine_with(dinner_scripted_tools(), |b| {
		b.with_config(short_invocation("2.0.0"))
			.with_tool_registry(registry)
			.with_state_store(shared)
	});

	let blocked = upgraded.orchestrator.resume("exec-drift").await?;
	assert_eq!(blocked.state, ExecutionStatus::Reflecting);
	assert!(upgraded.tools.calls().is_empty());

	let drift = blocked.drift.expect("drift report");
	assert_eq!(drift.changed_tools, vec!["book_restaurant_table"]);
	assert_eq!(drift.recommendation, ResumeRecommendation::BlockResume);
	assert_eq!(drift.divergence_pct, 100.0);
	let divergent: Vec<_> = drift
		.divergent_steps
		.iter()
		.map(|d| d.step_id.as_str())
		.collect();
	assert_eq!(divergent, vec!["book", "notify"]);

	// Resuming again does not bypass the review
	let again = upgraded.orchestrator.resume("exec-drift").await?;
	assert_eq!(again.state, ExecutionStatus::Reflecting);

	let approved = upgraded.orchestrator.approve_resume("exec-drift").await?;
	assert_eq!(approved.state, ExecutionStatus::Completed);
	assert_eq!(approved.completed_steps, 3);
	assert_eq!(
		upgraded.tools.call_order(),
		vec!["book_restaurant_table", "send_comm"]
	);
	Ok(())
}

#[tokio::test]
async fn test_approve_requires_blocked_resume() -> anyhow::Result<()> {
	let store = Arc::new(MemoryStore::new());
	let engine = suspend(&store, "exec-approve").await?;

	let err = engine
		.orchestrator
		.approve_resume("exec-approve")
		.await
		.unwrap_err();
	assert_eq!(err.code, ErrorCode::StateTransitionInvalid);

	let result = engine.orchestrator.get_result("exec-approve").await?;
	assert_eq!(result.state, ExecutionStatus::Suspended);
	Ok(())
}

#[tokio::test]
async fn test_resume_of_finished_execution_is_a_no_op() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	let first = engine
		.orchestrator
		.execute_plan(
			ExecutionRequest::new("dinner").with_execution_id("exec-done"),
			dinner_plan(),
		)
		.await?;
	assert_eq!(first.state, ExecutionStatus::Completed);

	let again = engine.orchestrator.resume("exec-done").await?;
	assert_eq!(again.state, ExecutionStatus::Completed);
	assert_matches!(again.drift, None);
	assert_eq!(engine.tools.calls().len(), 3);
	Ok(())
}

#[tokio::test]
async fn test_batch_that_could_outlast_budget_is_checkpointed() -> anyhow::Result<()> {
	let engine = engine_with(dinner_scripted_tools(), |b| b.with_config(short_invocation("1.0.0")));
	let mut plan = dinner_plan();
	plan.steps[1] = plan.steps[1].clone().with_timeout_ms(1_000);

	let suspended = engine
		.orchestrator
		.execute_plan(
			ExecutionRequest::new("thai dinner").with_execution_id("exec-long-step"),
			plan,
		)
		.await?;

	// Search was quick, but the booking may take longer than what is left
	assert_eq!(suspended.state, ExecutionStatus::Suspended);
	assert_eq!(suspended.completed_steps, 1);
	assert_eq!(engine.tools.call_order(), vec!["search_restaurant"]);

	// A fresh invocation always gets to run its first batch
	let resumed = engine.orchestrator.resume("exec-long-step").await?;
	assert_eq!(resumed.state, ExecutionStatus::Completed);
	assert_eq!(resumed.completed_steps, 3);
	assert_eq!(
		engine.tools.call_order(),
		vec!["search_restaurant", "book_restaurant_table", "send_comm"]
	);
	Ok(())
}

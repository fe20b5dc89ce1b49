use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use chrono::Utc;
use intention_engine::breaker::cost::{CostCircuitBreaker, CostConfig};
use intention_engine::idempotency::{IdempotencyService, StoreIdempotencyService};
use intention_engine::plan::PlanConstraints;
use intention_engine::planner::{LocationContext, PlannerError};
use intention_engine::state::TokenUsage;
use intention_engine::stateful::{ExecutionStore, KvExecutionStore, MemoryStore, StateStore};
use intention_engine::tools::{ToolDefinition, ToolError};
use intention_engine::{
	ErrorCode, ExecutionRequest, ExecutionStatus, ParamValue, Plan, PlanStep, StepStatus,
};
use serde_json::json;

use crate::common::*;

#[tokio::test]
async fn test_dinner_plan_runs_to_completion() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());

	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("book thai dinner for two"), dinner_plan())
		.await?;

	assert_eq!(result.state, ExecutionStatus::Completed);
	assert!(result.success);
	assert_eq!(result.completed_steps, 3);
	assert_eq!(result.failed_steps, 0);
	assert_eq!(result.total_steps, 3);
	assert!(result.error.is_none());
	assert!(result.compensation.is_none());
	assert_eq!(
		result.summary.as_deref(),
		Some("Thai dinner for two: 3/3 steps completed (COMPLETED)")
	);

	assert_eq!(
		engine.tools.call_order(),
		vec!["search_restaurant", "book_restaurant_table", "send_comm"]
	);
	let booking = &engine.tools.calls_for("book_restaurant_table")[0];
	assert_eq!(booking.parameters["restaurant_id"], "r-42");
	assert_eq!(booking.parameters["party_size"], 2);
	Ok(())
}

#[tokio::test]
async fn test_dependents_wait_for_every_dependency() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	let plan = Plan::new(
		"evening",
		vec![
			search_step(),
			PlanStep::new("calendar", "add_calendar_event")
				.with_param("title", "Dinner")
				.depends_on("search"),
			book_step(),
			PlanStep::new("notify", "send_comm")
				.depends_on("book")
				.depends_on("calendar"),
		],
	);

	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("plan my evening"), plan)
		.await?;

	assert_eq!(result.state, ExecutionStatus::Completed);
	let order = engine.tools.call_order();
	assert_eq!(order.len(), 4);
	assert_eq!(order[0], "search_restaurant");
	assert_eq!(order[3], "send_comm");
	Ok(())
}

#[tokio::test]
async fn test_confirmation_gate_then_confirm() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	let mut plan = dinner_plan();
	plan.steps[1].requires_confirmation = true;

	let paused = engine
		.orchestrator
		.execute_plan(
			ExecutionRequest::new("book thai dinner").with_execution_id("exec-confirm"),
			plan,
		)
		.await?;

	assert_eq!(paused.state, ExecutionStatus::AwaitingConfirmation);
	assert!(!paused.success);
	assert!(paused.error.is_none());
	assert_eq!(paused.awaiting_steps, vec!["book"]);
	assert_eq!(paused.completed_steps, 1);
	assert_eq!(engine.tools.call_count("book_restaurant_table"), 0);

	let done = engine.orchestrator.confirm("exec-confirm", &["book"]).await?;
	assert_eq!(done.state, ExecutionStatus::Completed);
	assert_eq!(done.completed_steps, 3);
	assert_eq!(engine.tools.call_count("search_restaurant"), 1);
	assert_eq!(engine.tools.call_count("book_restaurant_table"), 1);
	Ok(())
}

fn confirmed_booking_plan() -> Plan {
	Plan::new(
		"booking",
		vec![
			PlanStep::new("book", "book_restaurant_table")
				.with_param("restaurant_id", "r-7")
				.with_param("party_size", 2)
				.with_confirmation(),
		],
	)
}

fn booked_restaurants(engine: &Engine) -> Vec<String> {
	engine
		.tools
		.calls_for("book_restaurant_table")
		.iter()
		.map(|c| c.parameters["restaurant_id"].as_str().unwrap_or_default().to_string())
		.collect()
}

#[tokio::test]
async fn test_replanned_step_needs_fresh_confirmation() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	engine
		.tools
		.fail_next("book_restaurant_table", ToolError::server("booking api down"));
	engine.planner.push_repair(Plan::new(
		"pricier",
		vec![
			PlanStep::new("book", "book_restaurant_table")
				.with_param("restaurant_id", "r-99")
				.with_param("party_size", 2)
				.with_confirmation(),
		],
	));

	let paused = engine
		.orchestrator
		.execute_plan(
			ExecutionRequest::new("book r-7").with_execution_id("exec-replan-confirm"),
			confirmed_booking_plan(),
		)
		.await?;
	assert_eq!(paused.state, ExecutionStatus::AwaitingConfirmation);

	// The replacement booking was never shown to the user
	let repaired = engine
		.orchestrator
		.confirm("exec-replan-confirm", &["book"])
		.await?;
	assert_eq!(repaired.state, ExecutionStatus::AwaitingConfirmation);
	assert_eq!(repaired.awaiting_steps, vec!["book"]);
	assert_eq!(booked_restaurants(&engine), vec!["r-7"]);

	let done = engine
		.orchestrator
		.confirm("exec-replan-confirm", &["book"])
		.await?;
	assert_eq!(done.state, ExecutionStatus::Completed);
	assert_eq!(booked_restaurants(&engine), vec!["r-7", "r-99"]);
	Ok(())
}

#[tokio::test]
async fn test_regenerated_parameters_need_fresh_confirmation() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	engine.tools.fail_next(
		"book_restaurant_table",
		ToolError::from_status(422, "r-7 only takes parties of 4"),
	);
	engine.planner.push_parameters(BTreeMap::from([
		("restaurant_id".to_string(), ParamValue::literal("r-99")),
		("party_size".to_string(), ParamValue::literal(2)),
	]));

	engine
		.orchestrator
		.execute_plan(
			ExecutionRequest::new("book r-7").with_execution_id("exec-regen-confirm"),
			confirmed_booking_plan(),
		)
		.await?;

	let repaired = engine
		.orchestrator
		.confirm("exec-regen-confirm", &["book"])
		.await?;
	assert_eq!(repaired.state, ExecutionStatus::AwaitingConfirmation);
	assert_eq!(engine.planner.regenerated_steps(), vec!["book"]);
	assert_eq!(booked_restaurants(&engine), vec!["r-7"]);

	let done = engine
		.orchestrator
		.confirm("exec-regen-confirm", &["book"])
		.await?;
	assert_eq!(done.state, ExecutionStatus::Completed);
	assert_eq!(booked_restaurants(&engine), vec!["r-7", "r-99"]);
	Ok(())
}

#[tokio::test]
async fn test_failed_step_does_not_cancel_batch_siblings() -> anyhow::Result<()> {
	let executions = Arc::new(KvExecutionStore::new(Arc::new(MemoryStore::new())));
	let tools = dinner_scripted_tools()
		.with_delay("search_restaurant", Duration::from_millis(150))
		.with_delay("send_comm", Duration::from_millis(100));
	let engine = engine_with(tools, |b| b.with_execution_store(executions.clone()));
	engine
		.tools
		.fail_next("send_comm", ToolError::server("sms gateway down"));
	engine
		.planner
		.push_repair_error(PlannerError::Failed("no alternative".into()));
	let plan = Plan::new(
		"independent",
		vec![
			search_step(),
			PlanStep::new("notify", "send_comm").with_param("message", "On my way"),
		],
	);

	let started = Instant::now();
	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("dinner").with_execution_id("exec-siblings"), plan)
		.await?;
	let elapsed = started.elapsed();

	assert_eq!(result.state, ExecutionStatus::Failed);
	assert_matches!(&result.error, Some(f) if f.step_id.as_deref() == Some("notify"));
	// Both steps ran side by side rather than one after the other
	assert!(elapsed < Duration::from_millis(240), "batch took {elapsed:?}");

	let state = executions
		.get_execution_state("exec-siblings")
		.await?
		.expect("state persisted");
	assert_eq!(state.step_status("search"), StepStatus::Completed);
	assert_eq!(state.step_status("notify"), StepStatus::Failed);

	// Repair only ran once the whole batch had finished
	let feedback = engine.planner.feedback();
	assert_eq!(feedback.len(), 1);
	assert_eq!(feedback[0].completed_step_ids, vec!["search"]);
	Ok(())
}

#[tokio::test]
async fn test_confirm_rejects_steps_not_awaiting() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	let mut plan = dinner_plan();
	plan.steps[1].requires_confirmation = true;
	engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("dinner").with_execution_id("exec-1"), plan)
		.await?;

	let err = engine
		.orchestrator
		.confirm("exec-1", &["notify"])
		.await
		.unwrap_err();
	assert_eq!(err.code, ErrorCode::ValidationFailed);

	let still = engine.orchestrator.get_result("exec-1").await?;
	assert_eq!(still.state, ExecutionStatus::AwaitingConfirmation);
	Ok(())
}

#[tokio::test]
async fn test_guardrail_pauses_expensive_booking() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	let plan = Plan::new(
		"cheap-eats",
		vec![
			search_step(),
			book_step().with_param("price_level", 4),
		],
	);

	let paused = engine
		.orchestrator
		.execute_plan(
			ExecutionRequest::new("cheap dinner")
				.with_execution_id("exec-budget")
				.with_context(json!({"intent_constraints": ["budget"]})),
			plan,
		)
		.await?;

	assert_eq!(paused.state, ExecutionStatus::AwaitingConfirmation);
	assert_eq!(paused.awaiting_steps, vec!["book"]);
	assert!(paused.error.is_none());
	assert_eq!(engine.tools.call_count("book_restaurant_table"), 0);

	// Confirming overrides the guardrail
	let done = engine.orchestrator.confirm("exec-budget", &["book"]).await?;
	assert_eq!(done.state, ExecutionStatus::Completed);
	assert_eq!(engine.tools.calls_for("book_restaurant_table")[0].parameters["price_level"], 4);
	Ok(())
}

#[tokio::test]
async fn test_reject_skips_awaiting_steps() -> anyhow::Result<()> {
	let executions = Arc::new(KvExecutionStore::new(Arc::new(MemoryStore::new())));
	let engine = engine_with(dinner_scripted_tools(), |b| {
		b.with_execution_store(executions.clone())
	});
	let mut plan = dinner_plan();
	plan.steps[1].requires_confirmation = true;
	engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("dinner").with_execution_id("exec-reject"), plan)
		.await?;

	let rejected = engine.orchestrator.reject("exec-reject").await?;
	assert_eq!(rejected.state, ExecutionStatus::Rejected);
	assert!(!rejected.success);
	assert!(rejected.compensation.is_none());

	let state = executions
		.get_execution_state("exec-reject")
		.await?
		.expect("state persisted");
	assert_eq!(state.step_status("book"), StepStatus::Skipped);
	assert_eq!(state.step_status("notify"), StepStatus::Pending);
	assert_eq!(engine.tools.call_count("cancel_booking"), 0);
	Ok(())
}

#[tokio::test]
async fn test_cancel_is_final() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	let mut plan = dinner_plan();
	plan.steps[1].requires_confirmation = true;
	engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("dinner").with_execution_id("exec-cancel"), plan)
		.await?;

	let cancelled = engine.orchestrator.cancel("exec-cancel").await?;
	assert_eq!(cancelled.state, ExecutionStatus::Cancelled);

	let err = engine.orchestrator.cancel("exec-cancel").await.unwrap_err();
	assert_eq!(err.code, ErrorCode::StateTransitionInvalid);
	let err = engine
		.orchestrator
		.confirm("exec-cancel", &["book"])
		.await
		.unwrap_err();
	assert_eq!(err.code, ErrorCode::StateTransitionInvalid);
	Ok(())
}

#[tokio::test]
async fn test_dependency_cycle_fails_execution() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	let plan = Plan::new(
		"cyclic",
		vec![
			search_step(),
			PlanStep::new("a", "add_calendar_event").depends_on("b"),
			PlanStep::new("b", "send_comm").depends_on("a"),
		],
	);

	let err = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("loop").with_execution_id("exec-cycle"), plan)
		.await
		.unwrap_err();
	assert_eq!(err.code, ErrorCode::PlanCircularDependency);

	let stored = engine.orchestrator.get_result("exec-cycle").await?;
	assert_eq!(stored.state, ExecutionStatus::Failed);
	assert_matches!(stored.error, Some(f) if f.code == ErrorCode::PlanCircularDependency);
	assert_eq!(engine.tools.call_order(), vec!["search_restaurant"]);
	Ok(())
}

#[tokio::test]
async fn test_plan_over_step_limit_is_rejected() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	let plan = dinner_plan().with_constraints(PlanConstraints {
		max_steps: Some(2),
		..Default::default()
	});

	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("dinner"), plan)
		.await?;

	assert_eq!(result.state, ExecutionStatus::Rejected);
	assert_matches!(result.error, Some(f) if f.code == ErrorCode::ValidationFailed);
	assert!(engine.tools.calls().is_empty());
	Ok(())
}

#[tokio::test]
async fn test_daily_budget_blocks_costly_step() -> anyhow::Result<()> {
	let cost = Arc::new(CostCircuitBreaker::in_memory(CostConfig::default()));
	cost.charge(Some("alice"), "earlier-execution", 4.5, Utc::now()).await?;

	let mut registry = dinner_tools();
	registry.register(
		ToolDefinition::new("book_restaurant_table")
			.with_output_fields(["booking_id"])
			.with_cost(1.0),
	);
	let engine = engine_with(dinner_scripted_tools(), |b| {
		b.with_tool_registry(registry).with_cost_breaker(cost.clone())
	});

	let result = engine
		.orchestrator
		.execute_plan(ExecutionRequest::new("dinner").with_user("alice"), dinner_plan())
		.await?;

	assert_eq!(result.state, ExecutionStatus::Failed);
	assert_matches!(
		result.error,
		Some(f) if f.code == ErrorCode::BudgetExceeded && f.step_id.as_deref() == Some("book")
	);
	assert_eq!(engine.tools.call_count("book_restaurant_table"), 0);
	assert_eq!(engine.tools.call_count("send_comm"), 0);
	assert!(cost.is_blacklisted("alice", Utc::now()).await?);
	// Budget failures are never sent back to the planner
	assert!(engine.planner.feedback().is_empty());
	Ok(())
}

#[tokio::test]
async fn test_daily_budget_holds_across_invocations() -> anyhow::Result<()> {
	let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
	let costly = || {
		let mut registry = dinner_tools();
		registry.register(
			ToolDefinition::new("book_restaurant_table")
				.with_output_fields(["booking_id"])
				.with_cost(3.0),
		);
		registry
	};

	let first = engine_with(dinner_scripted_tools(), |b| {
		b.with_tool_registry(costly()).with_state_store(store.clone())
	});
	let lunch = first
		.orchestrator
		.execute_plan(ExecutionRequest::new("lunch").with_user("alice"), dinner_plan())
		.await?;
	assert_eq!(lunch.state, ExecutionStatus::Completed);

	// A fresh orchestrator on the same store, as in a later invocation
	let second = engine_with(dinner_scripted_tools(), |b| {
		b.with_tool_registry(costly()).with_state_store(store.clone())
	});
	let dinner = second
		.orchestrator
		.execute_plan(ExecutionRequest::new("dinner").with_user("alice"), dinner_plan())
		.await?;

	assert_eq!(dinner.state, ExecutionStatus::Failed);
	assert_matches!(dinner.error, Some(f) if f.code == ErrorCode::BudgetExceeded);
	assert_eq!(second.tools.call_count("book_restaurant_table"), 0);
	assert!(store.exists("blacklist:alice").await?);
	Ok(())
}

#[tokio::test]
async fn test_plan_and_execute_with_location() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	engine.planner.push_plan(dinner_plan(), Some(TokenUsage::new(120, 80)));

	let result = engine
		.orchestrator
		.plan_and_execute(
			ExecutionRequest::new("thai dinner near me")
				.with_user("bob")
				.with_location(LocationContext::new(40.7, -74.0)),
		)
		.await?;

	assert_eq!(result.state, ExecutionStatus::Completed);
	assert_matches!(result.usage, Some(usage) if usage.total_tokens == 200);

	let requests = engine.planner.requests();
	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].intent, "thai dinner near me");
	assert_eq!(requests[0].user_location, Some(LocationContext::new(40.7, -74.0)));
	assert_eq!(requests[0].user_id.as_deref(), Some("bob"));

	// Declared but unset coordinates come from the user's location
	let search = &engine.tools.calls_for("search_restaurant")[0];
	assert_eq!(search.parameters["lat"], 40.7);
	assert_eq!(search.parameters["lng"], -74.0);
	Ok(())
}

#[tokio::test]
async fn test_planner_failure_fails_execution() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	engine
		.planner
		.push_plan_error(PlannerError::Failed("model overloaded".into()));

	let result = engine
		.orchestrator
		.plan_and_execute(ExecutionRequest::new("something impossible"))
		.await?;

	assert_eq!(result.state, ExecutionStatus::Failed);
	assert_matches!(result.error, Some(f) if f.code == ErrorCode::UnknownError);
	assert!(engine.tools.calls().is_empty());
	Ok(())
}

#[tokio::test]
async fn test_planner_timeout_is_reported_as_timeout() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	engine
		.planner
		.push_plan_error(PlannerError::Timeout(Duration::from_secs(30)));

	let result = engine
		.orchestrator
		.plan_and_execute(ExecutionRequest::new("dinner"))
		.await?;

	assert_eq!(result.state, ExecutionStatus::Failed);
	assert_matches!(result.error, Some(f) if f.code == ErrorCode::Timeout);
	Ok(())
}

#[tokio::test]
async fn test_completed_steps_survive_lost_execution_state() -> anyhow::Result<()> {
	let idempotency: Arc<dyn IdempotencyService> = Arc::new(StoreIdempotencyService::new(
		Arc::new(MemoryStore::new()),
		Duration::from_secs(3600),
	));
	let mut plan = dinner_plan();
	plan.steps[2].requires_confirmation = true;

	let first = engine_with(dinner_scripted_tools(), |b| {
		b.with_idempotency(idempotency.clone())
	});
	let paused = first
		.orchestrator
		.execute_plan(ExecutionRequest::new("dinner").with_execution_id("exec-lost"), plan.clone())
		.await?;
	assert_eq!(paused.state, ExecutionStatus::AwaitingConfirmation);
	assert_eq!(first.tools.calls().len(), 2);

	// A second worker with no record of the execution replays the plan
	let second = engine_with(dinner_scripted_tools(), |b| {
		b.with_idempotency(idempotency.clone())
	});
	let replayed = second
		.orchestrator
		.execute_plan(ExecutionRequest::new("dinner").with_execution_id("exec-lost"), plan)
		.await?;

	assert_eq!(replayed.state, ExecutionStatus::AwaitingConfirmation);
	assert_eq!(replayed.completed_steps, 2);
	assert!(second.tools.calls().is_empty());
	Ok(())
}

#[tokio::test]
async fn test_redelivered_request_does_not_rerun_steps() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	let request = ExecutionRequest::new("dinner").with_execution_id("exec-dup");

	let first = engine
		.orchestrator
		.execute_plan(request.clone(), dinner_plan())
		.await?;
	let second = engine
		.orchestrator
		.execute_plan(request, dinner_plan())
		.await?;

	assert_eq!(first.state, ExecutionStatus::Completed);
	assert_eq!(second.state, ExecutionStatus::Completed);
	assert_eq!(second.execution_id, "exec-dup");
	assert_eq!(engine.tools.calls().len(), 3);
	Ok(())
}

#[tokio::test]
async fn test_unknown_execution() -> anyhow::Result<()> {
	let engine = engine(dinner_scripted_tools());
	let err = engine.orchestrator.resume("missing").await.unwrap_err();
	assert_eq!(err.code, ErrorCode::UnknownError);
	assert!(engine.orchestrator.get_result("missing").await.is_err());
	Ok(())
}

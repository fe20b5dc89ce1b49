//! Step executor.
//!
//! Runs one plan step through a fixed sequence of checks: idempotency,
//! parameter resolution, guardrails, the confirmation gate, pre-flight
//! validation, the budget guard, and finally invocation under the tool's
//! circuit breaker with a timeout. Every outcome, including panics inside a
//! tool executor, comes back as a [`StepExecutionState`] value.

mod correction;
mod guardrail;
pub mod params;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub use correction::correct_parameters;
pub use guardrail::GuardrailConfig;

use crate::breaker::cost::{BudgetError, CostCircuitBreaker};
use crate::breaker::{BreakerError, CircuitBreakerRegistry};
use crate::error::{ErrorCode, StepError};
use crate::idempotency::{IdempotencyKey, IdempotencyService};
use crate::plan::PlanStep;
use crate::state::{ExecutionState, StepExecutionState, StepStatus};
use crate::tools::{ToolDefinition, ToolError, ToolExecutor, ToolRegistry};

/// Outcome of one step run.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
	Completed { output: Value },
	Failed(StepError),
	TimedOut(StepError),
	/// Paused for a human; `reason` is set when a guardrail tripped
	AwaitingConfirmation { reason: Option<StepError> },
}

impl StepOutcome {
	fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
		StepOutcome::Failed(StepError::new(code, message))
	}

	pub fn status(&self) -> StepStatus {
		match self {
			StepOutcome::Completed { .. } => StepStatus::Completed,
			StepOutcome::Failed(_) => StepStatus::Failed,
			StepOutcome::TimedOut(_) => StepStatus::Timeout,
			StepOutcome::AwaitingConfirmation { .. } => StepStatus::AwaitingConfirmation,
		}
	}
}

/// Shared collaborators of the step executor.
#[derive(Clone)]
pub struct StepExecutor {
	tools: Arc<dyn ToolExecutor>,
	registry: Arc<ToolRegistry>,
	breakers: Arc<CircuitBreakerRegistry>,
	cost: Arc<CostCircuitBreaker>,
	idempotency: Arc<dyn IdempotencyService>,
	guardrails: GuardrailConfig,
	default_timeout: Duration,
}

struct Invocation {
	outcome: StepOutcome,
	input: Value,
	latency_ms: Option<u64>,
}

impl StepExecutor {
	pub fn new(
		tools: Arc<dyn ToolExecutor>,
		registry: Arc<ToolRegistry>,
		breakers: Arc<CircuitBreakerRegistry>,
		cost: Arc<CostCircuitBreaker>,
		idempotency: Arc<dyn IdempotencyService>,
	) -> Self {
		Self {
			tools,
			registry,
			breakers,
			cost,
			idempotency,
			guardrails: GuardrailConfig::default(),
			default_timeout: Duration::from_secs(30),
		}
	}

	pub fn with_guardrails(mut self, guardrails: GuardrailConfig) -> Self {
		self.guardrails = guardrails;
		self
	}

	pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
		self.default_timeout = timeout;
		self
	}

	/// Time a single invocation of `step` may take.
	pub fn timeout_for(&self, step: &PlanStep) -> Duration {
		step
			.timeout_ms
			.map(Duration::from_millis)
			.unwrap_or(self.default_timeout)
	}

	/// Run `step`, found at `index` in the current plan, against a snapshot of
	/// the execution state. Never panics and never returns an error.
	///
	/// The returned record carries the step's incremented attempt count and
	/// a status reachable from `in_progress`.
	pub async fn run(&self, step: &PlanStep, index: usize, state: &ExecutionState) -> StepExecutionState {
		let previous = state.step_state(&step.id);
		let mut record = StepExecutionState::pending(&step.id);
		record.attempts = previous.map(|p| p.attempts).unwrap_or(0) + 1;
		record.started_at = previous.and_then(|p| p.started_at).or_else(|| Some(Utc::now()));

		let invocation = match AssertUnwindSafe(self.evaluate(step, index, state))
			.catch_unwind()
			.await
		{
			Ok(invocation) => invocation,
			Err(_) => {
				warn!(
					execution_id = %state.execution_id,
					step_id = %step.id,
					"step execution panicked"
				);
				Invocation {
					outcome: StepOutcome::failed(
						ErrorCode::StepExecutionFailed,
						"unexpected panic while executing step",
					),
					input: Value::Null,
					latency_ms: None,
				}
			},
		};

		record.status = invocation.outcome.status();
		if !invocation.input.is_null() {
			record.input = Some(invocation.input);
		}
		record.latency_ms = invocation.latency_ms;
		match invocation.outcome {
			StepOutcome::Completed { output } => {
				record.output = Some(output);
				record.completed_at = Some(Utc::now());
			},
			StepOutcome::Failed(err) | StepOutcome::TimedOut(err) => {
				record.error = Some(err);
				record.completed_at = Some(Utc::now());
			},
			StepOutcome::AwaitingConfirmation { reason } => record.error = reason,
		}
		record
	}

	async fn evaluate(&self, step: &PlanStep, index: usize, state: &ExecutionState) -> Invocation {
		let key = IdempotencyKey::new(&state.execution_id, index, &step.id);

		match self.idempotency.completion(&key).await {
			Ok(Some(record)) => {
				info!(
					execution_id = %state.execution_id,
					step_id = %step.id,
					"step already completed, returning recorded output"
				);
				return Invocation {
					outcome: StepOutcome::Completed {
						output: record.output,
					},
					input: Value::Null,
					latency_ms: Some(0),
				};
			},
			Ok(None) => {},
			Err(e) => {
				return Invocation {
					outcome: StepOutcome::failed(
						ErrorCode::StepExecutionFailed,
						format!("idempotency lookup failed: {e}"),
					),
					input: Value::Null,
					latency_ms: None,
				};
			},
		}

		let definition = self.registry.get(&step.tool_name);
		let params = params::resolve_parameters(step, state, definition);
		let input = Value::Object(params.clone());
		let confirmed = state.is_confirmed(&step.id);

		let outcome = self
			.gate(step, definition, &params, state, confirmed)
			.await;
		if let Some(outcome) = outcome {
			return Invocation {
				outcome,
				input,
				latency_ms: None,
			};
		}

		let timeout = self.timeout_for(step);
		let started = Instant::now();
		let outcome = self
			.invoke(step, definition, params, timeout, state)
			.await;
		let latency_ms = started.elapsed().as_millis() as u64;

		if let StepOutcome::Completed { output } = &outcome
			&& let Err(e) = self.idempotency.mark_complete(&key, output).await
		{
			warn!(
				execution_id = %state.execution_id,
				step_id = %step.id,
				error = %e,
				"failed to record step completion"
			);
		}

		Invocation {
			outcome,
			input,
			latency_ms: Some(latency_ms),
		}
	}

	/// Checks that may stop a step before any side effect happens.
	async fn gate(
		&self,
		step: &PlanStep,
		definition: Option<&ToolDefinition>,
		params: &Map<String, Value>,
		state: &ExecutionState,
		confirmed: bool,
	) -> Option<StepOutcome> {
		// A human confirmation overrides the guardrail that asked for it
		if !confirmed
			&& let Err(reason) = guardrail::check(&self.guardrails, &step.tool_name, params, &state.context)
		{
			info!(
				execution_id = %state.execution_id,
				step_id = %step.id,
				reason = %reason,
				"guardrail violation, awaiting confirmation"
			);
			return Some(StepOutcome::AwaitingConfirmation {
				reason: Some(StepError::new(ErrorCode::GuardrailViolation, reason)),
			});
		}

		let needs_confirmation =
			step.requires_confirmation || definition.is_some_and(|d| d.requires_confirmation);
		if needs_confirmation && !confirmed {
			debug!(step_id = %step.id, "step requires confirmation");
			return Some(StepOutcome::AwaitingConfirmation { reason: None });
		}

		let input = Value::Object(params.clone());
		if let Err(e) = self.tools.validate(&step.tool_name, &input).await {
			debug!(step_id = %step.id, error = %e, "pre-flight validation failed");
			return Some(StepOutcome::failed(ErrorCode::ValidationFailed, e.message));
		}

		let cost = definition.map(|d| d.estimated_cost).unwrap_or(0.0);
		if cost > 0.0
			&& let Err(e) = self
				.cost
				.charge(state.user_id.as_deref(), &state.execution_id, cost, Utc::now())
				.await
		{
			let code = match e {
				BudgetError::State(_) => ErrorCode::StepExecutionFailed,
				_ => ErrorCode::BudgetExceeded,
			};
			return Some(StepOutcome::failed(code, e.to_string()));
		}

		None
	}

	/// Call the tool under its breaker, with one inline correction for
	/// client/server errors.
	async fn invoke(
		&self,
		step: &PlanStep,
		definition: Option<&ToolDefinition>,
		params: Map<String, Value>,
		timeout: Duration,
		state: &ExecutionState,
	) -> StepOutcome {
		let first = self.call(&step.tool_name, &params, timeout).await;
		let err = match first {
			Err(BreakerError::Inner(err)) if err.is_client_or_server() => err,
			other => return self.classify(other),
		};

		let Some(corrected) = correct_parameters(&params, definition) else {
			return self.classify(Err(BreakerError::Inner(err)));
		};
		info!(
			execution_id = %state.execution_id,
			step_id = %step.id,
			error = %err,
			"retrying step once with corrected parameters"
		);
		let second = self.call(&step.tool_name, &corrected, timeout).await;
		self.classify(second)
	}

	async fn call(
		&self,
		tool_name: &str,
		params: &Map<String, Value>,
		timeout: Duration,
	) -> Result<Value, BreakerError<ToolError>> {
		let input = Value::Object(params.clone());
		self
			.breakers
			.call(tool_name, timeout, async {
				self.tools.execute(tool_name, &input, timeout).await.into_result()
			})
			.await
	}

	fn classify(&self, result: Result<Value, BreakerError<ToolError>>) -> StepOutcome {
		match result {
			Ok(output) => StepOutcome::Completed { output },
			Err(BreakerError::Open { name, .. }) => StepOutcome::failed(
				ErrorCode::CircuitBreakerOpen,
				format!("circuit for '{name}' is open"),
			),
			Err(BreakerError::Timeout { timeout, .. }) => StepOutcome::TimedOut(StepError::new(
				ErrorCode::Timeout,
				format!("step timed out after {}ms", timeout.as_millis()),
			)),
			Err(BreakerError::Inner(err)) if err.error_code() == ErrorCode::Timeout => {
				StepOutcome::TimedOut(StepError::new(ErrorCode::Timeout, err.message))
			},
			Err(BreakerError::Inner(err)) => StepOutcome::failed(err.error_code(), err.message),
			Err(BreakerError::State(e)) => StepOutcome::failed(
				ErrorCode::StepExecutionFailed,
				format!("circuit state unavailable: {e}"),
			),
		}
	}
}

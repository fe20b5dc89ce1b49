//! Self-repair loop.
//!
//! Invoked by the coordinator after a batch produced failures. Parameter
//! problems are retried in place with regenerated parameters; anything else
//! asks the planner for a replacement plan that keeps completed work.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ErrorCode, StepError};
use crate::plan::PlanStep;
use crate::planner::{PlanRequest, Planner, PlannerError, RepairFeedback, StepOutcomeSummary};
use crate::state::{ExecutionFailure, ExecutionState, StepExecutionState, StepStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepairConfig {
	/// Attempts after which a parameter failure is no longer retried in place
	pub max_attempts: u32,
	/// Replacement plans allowed per execution
	pub max_replans: u32,
	pub planner_timeout_ms: u64,
	/// Number of recent step outcomes sent to the planner
	pub history_window: usize,
}

impl Default for RepairConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			max_replans: 3,
			planner_timeout_ms: 30_000,
			history_window: 5,
		}
	}
}

impl RepairConfig {
	pub fn planner_timeout(&self) -> Duration {
		Duration::from_millis(self.planner_timeout_ms)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
	/// Failed steps were reset to pending with regenerated parameters
	RetriedInPlace { step_ids: Vec<String> },
	/// The unfinished part of the plan was replaced
	Replanned { version: u32 },
	GaveUp(ExecutionFailure),
}

pub struct SelfRepairLoop {
	planner: Arc<dyn Planner>,
	config: RepairConfig,
}

struct Failure {
	step: PlanStep,
	error: StepError,
	attempts: u32,
	input: Option<serde_json::Value>,
}

impl Failure {
	fn give_up(&self, message: impl Into<String>) -> RepairOutcome {
		RepairOutcome::GaveUp(ExecutionFailure {
			code: self.error.code,
			message: message.into(),
			step_id: Some(self.step.id.clone()),
		})
	}
}

impl SelfRepairLoop {
	pub fn new(planner: Arc<dyn Planner>, config: RepairConfig) -> Self {
		Self { planner, config }
	}

	pub fn config(&self) -> &RepairConfig {
		&self.config
	}

	/// Try to make the execution runnable again after `failed` steps.
	///
	/// On success `state.plan` and the step records are updated; the caller
	/// owns the REFLECTING -> EXECUTING transition.
	pub async fn repair(&self, state: &mut ExecutionState, failed: &[String]) -> RepairOutcome {
		let failures = Self::failures(state, failed);
		let Some(first) = failures.first() else {
			return RepairOutcome::GaveUp(ExecutionFailure {
				code: ErrorCode::UnknownError,
				message: "repair requested without failed steps".into(),
				step_id: None,
			});
		};

		if let Some(f) = failures.iter().find(|f| f.error.code == ErrorCode::BudgetExceeded) {
			return f.give_up(format!("step '{}' exceeded the budget: {}", f.step.id, f.error.message));
		}

		if failures.iter().all(|f| f.error.code.is_parameter_problem()) {
			if let Some(f) = failures.iter().find(|f| f.attempts >= self.config.max_attempts) {
				warn!(
					execution_id = %state.execution_id,
					step_id = %f.step.id,
					attempts = f.attempts,
					"parameter repair attempts exhausted"
				);
				return f.give_up(format!(
					"step '{}' still invalid after {} attempts: {}",
					f.step.id, f.attempts, f.error.message
				));
			}
			return self.retry_in_place(state, &failures).await;
		}

		if state.replan_count >= self.config.max_replans {
			return first.give_up(format!(
				"step '{}' failed and the replan limit of {} was reached: {}",
				first.step.id, self.config.max_replans, first.error.message
			));
		}
		self.replan(state, first).await
	}

	fn failures(state: &ExecutionState, failed: &[String]) -> Vec<Failure> {
		state
			.plan
			.steps
			.iter()
			.filter(|step| failed.contains(&step.id))
			.filter_map(|step| {
				let record = state.step_state(&step.id)?;
				record.status.is_failure().then(|| Failure {
					step: step.clone(),
					error: record.error.clone().unwrap_or_else(|| {
						StepError::new(ErrorCode::UnknownError, format!("step {}", record.status))
					}),
					attempts: record.attempts,
					input: record.input.clone(),
				})
			})
			.collect()
	}

	async fn with_timeout<T>(
		&self,
		call: impl Future<Output = Result<T, PlannerError>>,
	) -> Result<T, PlannerError> {
		let timeout = self.config.planner_timeout();
		tokio::time::timeout(timeout, call)
			.await
			.unwrap_or(Err(PlannerError::Timeout(timeout)))
	}

	async fn retry_in_place(&self, state: &mut ExecutionState, failures: &[Failure]) -> RepairOutcome {
		let mut steps = state.plan.steps.clone();
		for f in failures {
			let regenerated = self.with_timeout(self.planner.regenerate_parameters(
				&f.step,
				f.input.as_ref(),
				&f.error,
			));
			let parameters = match regenerated.await {
				Ok(parameters) => parameters,
				Err(e) => {
					warn!(execution_id = %state.execution_id, step_id = %f.step.id, error = %e, "parameter regeneration failed");
					return f.give_up(format!("could not regenerate parameters for '{}': {e}", f.step.id));
				},
			};
			if let Some(step) = steps.iter_mut().find(|s| s.id == f.step.id)
				&& step.parameters != parameters
			{
				// A confirmation covers the parameters the user saw
				state.confirmed_steps.remove(&step.id);
				step.parameters = parameters;
			}
		}

		let mut step_ids = Vec::with_capacity(failures.len());
		for f in failures {
			if let Some(record) = state.step_state_mut(&f.step.id) {
				if let Err(e) = record.transition(StepStatus::Pending) {
					return f.give_up(e.message);
				}
				record.error = None;
				record.completed_at = None;
			}
			step_ids.push(f.step.id.clone());
		}
		state.plan = state.plan.next_version(steps);
		state.touch();
		info!(
			execution_id = %state.execution_id,
			plan_version = state.plan.version,
			steps = ?step_ids,
			"retrying steps in place with regenerated parameters"
		);
		RepairOutcome::RetriedInPlace { step_ids }
	}

	fn feedback(&self, state: &ExecutionState, failure: &Failure) -> RepairFeedback {
		let mut finished: Vec<&StepExecutionState> = state
			.step_states
			.iter()
			.filter(|r| r.status.is_finished())
			.collect();
		finished.sort_by_key(|r| r.completed_at);
		let skip = finished.len().saturating_sub(self.config.history_window);
		let recent_outcomes = finished
			.into_iter()
			.skip(skip)
			.map(|r| StepOutcomeSummary {
				step_id: r.step_id.clone(),
				tool_name: state
					.plan
					.step(&r.step_id)
					.map(|s| s.tool_name.clone())
					.unwrap_or_default(),
				status: r.status,
				error: r.error.clone(),
			})
			.collect();

		RepairFeedback {
			failed_step_id: failure.step.id.clone(),
			error: failure.error.clone(),
			recent_outcomes,
			completed_step_ids: state
				.steps_with_status(StepStatus::Completed)
				.into_iter()
				.map(|r| r.step_id.clone())
				.collect(),
			plan_version: state.plan.version,
		}
	}

	async fn replan(&self, state: &mut ExecutionState, failure: &Failure) -> RepairOutcome {
		let feedback = self.feedback(state, failure);
		let request = PlanRequest::for_execution(state);
		info!(
			execution_id = %state.execution_id,
			step_id = %failure.step.id,
			code = %failure.error.code,
			"requesting replacement plan"
		);

		let response = match self
			.with_timeout(self.planner.repair_plan(&request, &feedback))
			.await
		{
			Ok(response) if response.plan.is_empty() => {
				return failure.give_up(format!(
					"step '{}' failed and {}",
					failure.step.id,
					PlannerError::EmptyPlan
				));
			},
			Ok(response) => response,
			Err(e) => {
				warn!(execution_id = %state.execution_id, error = %e, "plan repair failed");
				return failure.give_up(format!(
					"step '{}' failed and repair failed: {e}",
					failure.step.id
				));
			},
		};

		let completed: HashSet<String> = feedback.completed_step_ids.into_iter().collect();
		let mut steps: Vec<PlanStep> = state
			.plan
			.steps
			.iter()
			.filter(|s| completed.contains(&s.id))
			.cloned()
			.collect();
		steps.extend(
			response
				.plan
				.steps
				.into_iter()
				.filter(|s| !completed.contains(&s.id)),
		);
		let plan = state.plan.next_version(steps);
		if let Err(e) = plan.validate() {
			return failure.give_up(format!("repaired plan rejected: {e}"));
		}

		let (kept, replaced): (Vec<_>, Vec<_>) = std::mem::take(&mut state.step_states)
			.into_iter()
			.partition(|r| completed.contains(&r.step_id));
		state.step_states = kept;
		for record in &replaced {
			state.confirmed_steps.remove(&record.step_id);
		}
		state.superseded_steps.extend(replaced);
		state.plan = plan;
		state.replan_count += 1;
		if let Some(usage) = response.usage {
			state.token_usage.add(usage);
		}
		state.touch();

		info!(
			execution_id = %state.execution_id,
			plan_version = state.plan.version,
			steps = state.plan.len(),
			"replaced unfinished steps with repaired plan"
		);
		RepairOutcome::Replanned {
			version: state.plan.version,
		}
	}
}

use serde::{Deserialize, Serialize};

use crate::checkpoint::DriftReport;
use crate::compensation::CompensationReport;
use crate::state::{ExecutionFailure, ExecutionState, ExecutionStatus, StepStatus, TokenUsage};

/// Outcome of one coordinator invocation, as reported to callers.
///
/// `success` is only true for COMPLETED executions. An execution waiting
/// for confirmation reports `success: false` with no `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
	pub execution_id: String,
	pub state: ExecutionStatus,
	pub success: bool,
	pub completed_steps: usize,
	pub failed_steps: usize,
	pub total_steps: usize,
	pub execution_time_ms: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub summary: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<TokenUsage>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ExecutionFailure>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub compensation: Option<CompensationReport>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub drift: Option<DriftReport>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub awaiting_steps: Vec<String>,
}

impl ExecutionResult {
	pub fn from_state(state: &ExecutionState) -> Self {
		let completed_steps = state.completed_count();
		let total_steps = state.plan.len();
		let awaiting_steps: Vec<String> = state
			.steps_with_status(StepStatus::AwaitingConfirmation)
			.into_iter()
			.map(|r| r.step_id.clone())
			.collect();
		let execution_time_ms = (state.updated_at - state.created_at)
			.num_milliseconds()
			.max(0) as u64;

		Self {
			execution_id: state.execution_id.clone(),
			state: state.status,
			success: state.status == ExecutionStatus::Completed,
			completed_steps,
			failed_steps: state.failed_count(),
			total_steps,
			execution_time_ms,
			summary: Some(summarize(state, completed_steps, total_steps, &awaiting_steps)),
			usage: (state.token_usage.total_tokens > 0).then_some(state.token_usage),
			error: state.error.clone(),
			compensation: state.compensation.clone(),
			drift: state.drift.clone(),
			awaiting_steps,
		}
	}
}

fn summarize(state: &ExecutionState, completed: usize, total: usize, awaiting: &[String]) -> String {
	let progress = match state.status {
		ExecutionStatus::AwaitingConfirmation => format!(
			"{completed}/{total} steps completed, awaiting confirmation of {}",
			awaiting.join(", ")
		),
		ExecutionStatus::Suspended => format!("{completed}/{total} steps completed, suspended at checkpoint"),
		status => format!("{completed}/{total} steps completed ({status})"),
	};
	match &state.plan.summary {
		Some(summary) => format!("{summary}: {progress}"),
		None => progress,
	}
}

//! Execution state store.
//!
//! [`ExecutionState`] is the mutable root of one plan run. It is owned by the
//! orchestrator driving the execution and is persisted after every batch so
//! a fresh orchestrator can pick it up. Every status change goes through
//! [`ExecutionState::transition`], which checks the transition table before
//! mutating anything.

mod step;

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use step::{StepExecutionState, StepStatus};

use crate::checkpoint::{CheckpointMeta, DriftReport};
use crate::compensation::CompensationReport;
use crate::error::{EngineError, ErrorCode};
use crate::plan::Plan;

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
	#[default]
	Received,
	Parsing,
	Parsed,
	Planning,
	Planned,
	Executing,
	AwaitingConfirmation,
	Suspended,
	Reflecting,
	Completed,
	Failed,
	Rejected,
	Timeout,
	Cancelled,
}

impl ExecutionStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			ExecutionStatus::Completed
				| ExecutionStatus::Failed
				| ExecutionStatus::Rejected
				| ExecutionStatus::Timeout
				| ExecutionStatus::Cancelled
		)
	}

	/// Transition table.
	///
	/// ```text
	/// RECEIVED -> PARSING -> PARSED -> PLANNING -> PLANNED -> EXECUTING
	/// PLANNED -> REJECTED
	/// EXECUTING -> AWAITING_CONFIRMATION | SUSPENDED | REFLECTING
	///            | COMPLETED | FAILED | TIMEOUT
	/// AWAITING_CONFIRMATION -> EXECUTING | REJECTED | TIMEOUT
	/// SUSPENDED -> EXECUTING | REFLECTING | TIMEOUT
	/// REFLECTING -> EXECUTING | FAILED | REJECTED
	/// any non-terminal -> CANCELLED | FAILED
	/// ```
	pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
		use ExecutionStatus::*;
		if self.is_terminal() {
			return false;
		}
		if matches!(to, Cancelled | Failed) {
			return true;
		}
		matches!(
			(self, to),
			(Received, Parsing)
				| (Parsing, Parsed)
				| (Parsed, Planning)
				| (Planning, Planned)
				| (Planned, Executing)
				| (Planned, Rejected)
				| (Executing, AwaitingConfirmation)
				| (Executing, Suspended)
				| (Executing, Reflecting)
				| (Executing, Completed)
				| (Executing, Timeout)
				| (AwaitingConfirmation, Executing)
				| (AwaitingConfirmation, Rejected)
				| (AwaitingConfirmation, Timeout)
				| (Suspended, Executing)
				| (Suspended, Reflecting)
				| (Suspended, Timeout)
				| (Reflecting, Executing)
				| (Reflecting, Rejected)
		)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ExecutionStatus::Received => "RECEIVED",
			ExecutionStatus::Parsing => "PARSING",
			ExecutionStatus::Parsed => "PARSED",
			ExecutionStatus::Planning => "PLANNING",
			ExecutionStatus::Planned => "PLANNED",
			ExecutionStatus::Executing => "EXECUTING",
			ExecutionStatus::AwaitingConfirmation => "AWAITING_CONFIRMATION",
			ExecutionStatus::Suspended => "SUSPENDED",
			ExecutionStatus::Reflecting => "REFLECTING",
			ExecutionStatus::Completed => "COMPLETED",
			ExecutionStatus::Failed => "FAILED",
			ExecutionStatus::Rejected => "REJECTED",
			ExecutionStatus::Timeout => "TIMEOUT",
			ExecutionStatus::Cancelled => "CANCELLED",
		}
	}
}

impl fmt::Display for ExecutionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Token accounting for planner calls made on behalf of an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub total_tokens: u64,
}

impl TokenUsage {
	pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
		Self {
			prompt_tokens,
			completion_tokens,
			total_tokens: prompt_tokens + completion_tokens,
		}
	}

	pub fn add(&mut self, other: TokenUsage) {
		self.prompt_tokens += other.prompt_tokens;
		self.completion_tokens += other.completion_tokens;
		self.total_tokens += other.total_tokens;
	}
}

/// Terminal error of an execution as surfaced to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
	pub code: ErrorCode,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub step_id: Option<String>,
}

impl From<&EngineError> for ExecutionFailure {
	fn from(err: &EngineError) -> Self {
		Self {
			code: err.code,
			message: err.message.clone(),
			step_id: None,
		}
	}
}

/// The mutable root of one plan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
	pub execution_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub intent: Option<String>,
	pub status: ExecutionStatus,
	pub plan: Plan,
	pub step_states: Vec<StepExecutionState>,
	/// Records of steps that a repair replaced; kept for the audit trail
	#[serde(default)]
	pub superseded_steps: Vec<StepExecutionState>,
	#[serde(default)]
	pub confirmed_steps: BTreeSet<String>,
	/// Free-form cross-step scratch data (user preferences, constraints, location)
	#[serde(default = "empty_object")]
	pub context: serde_json::Value,
	#[serde(default)]
	pub token_usage: TokenUsage,
	#[serde(default)]
	pub replan_count: u32,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ExecutionFailure>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub checkpoint: Option<CheckpointMeta>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub compensation: Option<CompensationReport>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub drift: Option<DriftReport>,
}

fn empty_object() -> serde_json::Value {
	serde_json::Value::Object(Default::default())
}

impl ExecutionState {
	pub fn new(execution_id: impl Into<String>, plan: Plan) -> Self {
		let now = Utc::now();
		Self {
			execution_id: execution_id.into(),
			user_id: None,
			intent: None,
			status: ExecutionStatus::Received,
			plan,
			step_states: Vec::new(),
			superseded_steps: Vec::new(),
			confirmed_steps: BTreeSet::new(),
			context: empty_object(),
			token_usage: TokenUsage::default(),
			replan_count: 0,
			created_at: now,
			updated_at: now,
			error: None,
			checkpoint: None,
			compensation: None,
			drift: None,
		}
	}

	pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());
		self
	}

	pub fn with_context(mut self, context: serde_json::Value) -> Self {
		self.context = context;
		self
	}

	/// Change the execution status, validating against the transition table.
	/// On error the state is left untouched.
	pub fn transition(&mut self, to: ExecutionStatus) -> Result<(), EngineError> {
		if !self.status.can_transition_to(to) {
			return Err(EngineError::invalid_transition(self.status, to));
		}
		tracing::debug!(
			execution_id = %self.execution_id,
			from = %self.status,
			to = %to,
			"execution status transition"
		);
		self.status = to;
		self.touch();
		Ok(())
	}

	/// Transition through a sequence of statuses, stopping at the first error.
	pub fn transition_through(&mut self, path: &[ExecutionStatus]) -> Result<(), EngineError> {
		for status in path {
			self.transition(*status)?;
		}
		Ok(())
	}

	pub fn touch(&mut self) {
		self.updated_at = Utc::now();
	}

	pub fn step_state(&self, step_id: &str) -> Option<&StepExecutionState> {
		self.step_states.iter().find(|s| s.step_id == step_id)
	}

	pub fn step_state_mut(&mut self, step_id: &str) -> Option<&mut StepExecutionState> {
		self.step_states.iter_mut().find(|s| s.step_id == step_id)
	}

	/// Status of a step; steps without a record yet are pending.
	pub fn step_status(&self, step_id: &str) -> StepStatus {
		self
			.step_state(step_id)
			.map(|s| s.status)
			.unwrap_or(StepStatus::Pending)
	}

	/// Get the record for a step, creating it lazily on first scheduling.
	pub fn ensure_step_state(&mut self, step_id: &str) -> &mut StepExecutionState {
		let idx = match self.step_states.iter().position(|s| s.step_id == step_id) {
			Some(idx) => idx,
			None => {
				self.step_states.push(StepExecutionState::pending(step_id));
				self.step_states.len() - 1
			},
		};
		&mut self.step_states[idx]
	}

	/// Apply the result of a step run to the matching in-progress record.
	pub fn apply_step_result(&mut self, result: StepExecutionState) -> Result<(), EngineError> {
		let record = self.ensure_step_state(&result.step_id);
		record.transition(result.status)?;
		*record = result;
		self.touch();
		Ok(())
	}

	pub fn is_confirmed(&self, step_id: &str) -> bool {
		self.confirmed_steps.contains(step_id)
	}

	pub fn steps_with_status(&self, status: StepStatus) -> Vec<&StepExecutionState> {
		self
			.plan
			.steps
			.iter()
			.filter_map(|step| self.step_state(&step.id))
			.filter(|s| s.status == status)
			.collect()
	}

	pub fn completed_count(&self) -> usize {
		self.steps_with_status(StepStatus::Completed).len()
	}

	pub fn failed_count(&self) -> usize {
		self
			.plan
			.steps
			.iter()
			.filter(|step| self.step_status(&step.id).is_failure())
			.count()
	}

	/// Step ids of the current plan that are neither finished nor replaced.
	pub fn unfinished_steps(&self) -> Vec<String> {
		self
			.plan
			.steps
			.iter()
			.filter(|step| !self.step_status(&step.id).is_finished())
			.map(|step| step.id.clone())
			.collect()
	}

	pub fn fail(&mut self, failure: ExecutionFailure) -> Result<(), EngineError> {
		self.transition(ExecutionStatus::Failed)?;
		self.error = Some(failure);
		Ok(())
	}
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ErrorCode, StepError};

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
	#[default]
	Pending,
	InProgress,
	Completed,
	Failed,
	Skipped,
	Timeout,
	AwaitingConfirmation,
	Suspended,
}

impl StepStatus {
	/// Step status machine.
	///
	/// ```text
	/// pending -> in_progress -> completed | failed | timeout | awaiting_confirmation
	/// pending <-> suspended
	/// failed | timeout -> pending              (retry in place)
	/// awaiting_confirmation -> pending | skipped
	/// ```
	pub fn can_transition_to(&self, to: StepStatus) -> bool {
		use StepStatus::*;
		matches!(
			(self, to),
			(Pending, InProgress)
				| (Pending, Suspended)
				| (Pending, Skipped)
				| (Suspended, Pending)
				| (InProgress, Completed)
				| (InProgress, Failed)
				| (InProgress, Timeout)
				| (InProgress, AwaitingConfirmation)
				| (AwaitingConfirmation, Pending)
				| (AwaitingConfirmation, Skipped)
				| (Failed, Pending)
				| (Timeout, Pending)
		)
	}

	/// Failed for the purposes of batch classification.
	pub fn is_failure(&self) -> bool {
		matches!(self, StepStatus::Failed | StepStatus::Timeout)
	}

	/// No further progress will happen on this step without outside input.
	pub fn is_finished(&self) -> bool {
		matches!(
			self,
			StepStatus::Completed | StepStatus::Failed | StepStatus::Timeout | StepStatus::Skipped
		)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			StepStatus::Pending => "pending",
			StepStatus::InProgress => "in_progress",
			StepStatus::Completed => "completed",
			StepStatus::Failed => "failed",
			StepStatus::Skipped => "skipped",
			StepStatus::Timeout => "timeout",
			StepStatus::AwaitingConfirmation => "awaiting_confirmation",
			StepStatus::Suspended => "suspended",
		}
	}
}

impl std::fmt::Display for StepStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Execution record for one step. The list of these is the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionState {
	pub step_id: String,
	pub status: StepStatus,
	/// Parameters actually sent to the tool, after resolution
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub input: Option<serde_json::Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub output: Option<serde_json::Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<StepError>,
	pub attempts: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub started_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub latency_ms: Option<u64>,
}

impl StepExecutionState {
	pub fn pending(step_id: impl Into<String>) -> Self {
		Self {
			step_id: step_id.into(),
			status: StepStatus::Pending,
			input: None,
			output: None,
			error: None,
			attempts: 0,
			started_at: None,
			completed_at: None,
			latency_ms: None,
		}
	}

	/// Move to `to`, rejecting transitions outside the step status machine.
	pub fn transition(&mut self, to: StepStatus) -> Result<(), EngineError> {
		if !self.status.can_transition_to(to) {
			return Err(EngineError::new(
				ErrorCode::StateTransitionInvalid,
				format!(
					"step '{}' cannot move from {} to {}",
					self.step_id, self.status, to
				),
			));
		}
		self.status = to;
		if to == StepStatus::InProgress {
			self.started_at = Some(Utc::now());
		}
		Ok(())
	}

	pub fn error_code(&self) -> Option<ErrorCode> {
		self.error.as_ref().map(|e| e.code)
	}
}

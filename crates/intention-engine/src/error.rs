//! Error taxonomy for the execution engine.
//!
//! Two families live here. [`StepError`] is a recorded value: it sits in a
//! step's execution record and is handled by the coordinator (repair or
//! compensate). [`EngineError`] is the envelope for engine-level invariant
//! violations such as invalid state transitions or circular dependencies;
//! it terminates the current coordinator invocation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error codes shared by steps, results and envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	ValidationFailed,
	GuardrailViolation,
	ToolValidationFailed,
	ToolExecutionFailed,
	StepExecutionFailed,
	StateTransitionInvalid,
	PlanCircularDependency,
	CircuitBreakerOpen,
	Timeout,
	BudgetExceeded,
	UnknownError,
}

impl ErrorCode {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorCode::ValidationFailed => "VALIDATION_FAILED",
			ErrorCode::GuardrailViolation => "GUARDRAIL_VIOLATION",
			ErrorCode::ToolValidationFailed => "TOOL_VALIDATION_FAILED",
			ErrorCode::ToolExecutionFailed => "TOOL_EXECUTION_FAILED",
			ErrorCode::StepExecutionFailed => "STEP_EXECUTION_FAILED",
			ErrorCode::StateTransitionInvalid => "STATE_TRANSITION_INVALID",
			ErrorCode::PlanCircularDependency => "PLAN_CIRCULAR_DEPENDENCY",
			ErrorCode::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
			ErrorCode::Timeout => "TIMEOUT",
			ErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
			ErrorCode::UnknownError => "UNKNOWN_ERROR",
		}
	}

	/// Failures caused by the parameters sent to a tool rather than by the tool
	/// or the plan. These are retried in place with regenerated parameters.
	pub fn is_parameter_problem(&self) -> bool {
		matches!(
			self,
			ErrorCode::ValidationFailed | ErrorCode::ToolValidationFailed
		)
	}

	/// Whether an engine-level error of this kind can be recovered from by the
	/// caller without human involvement.
	pub fn recoverable(&self) -> bool {
		!matches!(
			self,
			ErrorCode::StateTransitionInvalid
				| ErrorCode::PlanCircularDependency
				| ErrorCode::BudgetExceeded
		)
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Error recorded on a single step's execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
	pub code: ErrorCode,
	pub message: String,
}

impl StepError {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
		}
	}
}

impl fmt::Display for StepError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: {}", self.code, self.message)
	}
}

/// Envelope for engine-level failures.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct EngineError {
	pub code: ErrorCode,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub details: Option<serde_json::Value>,
	pub recoverable: bool,
	pub timestamp: DateTime<Utc>,
}

impl EngineError {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
			details: None,
			recoverable: code.recoverable(),
			timestamp: Utc::now(),
		}
	}

	pub fn with_details(mut self, details: serde_json::Value) -> Self {
		self.details = Some(details);
		self
	}

	pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
		Self::new(
			ErrorCode::StateTransitionInvalid,
			format!("invalid state transition from {from} to {to}"),
		)
		.with_details(serde_json::json!({
			"from": from.to_string(),
			"to": to.to_string(),
		}))
	}

	pub fn circular_dependency(unfinished: &[String]) -> Self {
		Self::new(
			ErrorCode::PlanCircularDependency,
			format!(
				"no step is ready but {} step(s) remain unfinished: {}",
				unfinished.len(),
				unfinished.join(", ")
			),
		)
		.with_details(serde_json::json!({ "unfinished_steps": unfinished }))
	}

	pub fn persistence(message: impl Into<String>) -> Self {
		Self::new(ErrorCode::UnknownError, message)
	}

	pub fn not_found(execution_id: &str) -> Self {
		Self::new(
			ErrorCode::UnknownError,
			format!("execution '{execution_id}' not found"),
		)
		.with_details(serde_json::json!({ "execution_id": execution_id }))
	}
}

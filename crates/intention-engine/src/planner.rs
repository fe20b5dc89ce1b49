//! Planner collaborator interface.
//!
//! Plan generation itself lives outside the engine. The engine asks for an
//! initial plan, for a repaired plan after a failure, and for regenerated
//! parameters of a single step.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::StepError;
use crate::plan::{ParamValue, Plan, PlanStep};
use crate::state::{ExecutionState, StepStatus, TokenUsage};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlannerError {
	#[error("planner failed: {0}")]
	Failed(String),

	#[error("planner timed out after {0:?}")]
	Timeout(Duration),

	#[error("planner returned an empty plan")]
	EmptyPlan,
}

/// Geographic position of the user, forwarded to the planner and to
/// location-aware tools.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationContext {
	pub lat: f64,
	pub lng: f64,
}

impl LocationContext {
	pub fn new(lat: f64, lng: f64) -> Self {
		Self { lat, lng }
	}

	/// Read a location previously stored in an execution context.
	pub fn from_context(context: &Value) -> Option<Self> {
		let location = context.get("location")?;
		Some(Self {
			lat: location.get("lat")?.as_f64()?,
			lng: location.get("lng")?.as_f64()?,
		})
	}
}

/// Request sent to the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
	pub intent: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_location: Option<LocationContext>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
}

impl PlanRequest {
	pub fn new(intent: impl Into<String>) -> Self {
		Self {
			intent: intent.into(),
			user_location: None,
			user_id: None,
		}
	}

	pub fn with_location(mut self, location: LocationContext) -> Self {
		self.user_location = Some(location);
		self
	}

	/// Rebuild the request that produced an execution's plan.
	pub fn for_execution(state: &ExecutionState) -> Self {
		Self {
			intent: state.intent.clone().unwrap_or_default(),
			user_location: LocationContext::from_context(&state.context),
			user_id: state.user_id.clone(),
		}
	}
}

/// A plan plus the tokens spent producing it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanResponse {
	pub plan: Plan,
	pub usage: Option<TokenUsage>,
}

impl From<Plan> for PlanResponse {
	fn from(plan: Plan) -> Self {
		Self { plan, usage: None }
	}
}

/// Short record of one step outcome, fed back to the planner on repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcomeSummary {
	pub step_id: String,
	pub tool_name: String,
	pub status: StepStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<StepError>,
}

/// Context for a repair request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairFeedback {
	pub failed_step_id: String,
	pub error: StepError,
	/// Most recent step outcomes, oldest first
	pub recent_outcomes: Vec<StepOutcomeSummary>,
	/// Steps that will be kept regardless of the repaired plan
	pub completed_step_ids: Vec<String>,
	pub plan_version: u32,
}

#[async_trait]
pub trait Planner: Send + Sync {
	async fn generate_plan(&self, request: &PlanRequest) -> Result<PlanResponse, PlannerError>;

	/// Produce a replacement plan conditioned on a failure.
	async fn repair_plan(
		&self,
		request: &PlanRequest,
		feedback: &RepairFeedback,
	) -> Result<PlanResponse, PlannerError>;

	/// Produce corrected parameters for a single step.
	async fn regenerate_parameters(
		&self,
		step: &PlanStep,
		input: Option<&Value>,
		error: &StepError,
	) -> Result<BTreeMap<String, ParamValue>, PlannerError>;
}

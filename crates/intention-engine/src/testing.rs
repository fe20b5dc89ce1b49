//! Scripted collaborators for tests and local runs.
//!
//! [`ScriptedTools`] and [`ScriptedPlanner`] return queued responses and
//! record every call, so engine behaviour can be exercised without real
//! tools or a language model.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::error::StepError;
use crate::plan::{ParamValue, Plan, PlanStep};
use crate::planner::{PlanRequest, PlanResponse, Planner, PlannerError, RepairFeedback};
use crate::state::TokenUsage;
use crate::tools::{ToolError, ToolExecutor, ToolOutcome};

/// A recorded tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
	pub tool_name: String,
	pub parameters: Value,
}

/// Tool executor answering from per-tool queues.
///
/// When a tool's queue is empty the call succeeds with the tool's default
/// output, or `{"tool": <name>}` if none was set.
#[derive(Default)]
pub struct ScriptedTools {
	queued: Mutex<HashMap<String, VecDeque<ToolOutcome>>>,
	defaults: Mutex<HashMap<String, Value>>,
	delays: Mutex<HashMap<String, Duration>>,
	invalid: Mutex<HashMap<String, ToolError>>,
	calls: Mutex<Vec<ToolCall>>,
	validations: Mutex<Vec<ToolCall>>,
}

impl ScriptedTools {
	pub fn new() -> Self {
		Self::default()
	}

	/// Default successful output for a tool.
	pub fn with_output(self, tool_name: &str, output: Value) -> Self {
		self.defaults.lock().insert(tool_name.to_string(), output);
		self
	}

	/// Queue one outcome for the next call of a tool.
	pub fn push(&self, tool_name: &str, outcome: ToolOutcome) {
		self
			.queued
			.lock()
			.entry(tool_name.to_string())
			.or_default()
			.push_back(outcome);
	}

	pub fn fail_next(&self, tool_name: &str, error: ToolError) {
		self.push(tool_name, ToolOutcome::err(error));
	}

	pub fn fail_times(&self, tool_name: &str, error: ToolError, times: usize) {
		for _ in 0..times {
			self.fail_next(tool_name, error.clone());
		}
	}

	/// Delay every call of a tool.
	pub fn with_delay(self, tool_name: &str, delay: Duration) -> Self {
		self.delays.lock().insert(tool_name.to_string(), delay);
		self
	}

	/// Make pre-flight validation of a tool fail.
	pub fn reject_validation(&self, tool_name: &str, error: ToolError) {
		self.invalid.lock().insert(tool_name.to_string(), error);
	}

	pub fn calls(&self) -> Vec<ToolCall> {
		self.calls.lock().clone()
	}

	pub fn calls_for(&self, tool_name: &str) -> Vec<ToolCall> {
		self
			.calls
			.lock()
			.iter()
			.filter(|c| c.tool_name == tool_name)
			.cloned()
			.collect()
	}

	pub fn call_count(&self, tool_name: &str) -> usize {
		self.calls_for(tool_name).len()
	}

	/// Tool names in call order.
	pub fn call_order(&self) -> Vec<String> {
		self.calls.lock().iter().map(|c| c.tool_name.clone()).collect()
	}

	pub fn validation_count(&self) -> usize {
		self.validations.lock().len()
	}
}

#[async_trait]
impl ToolExecutor for ScriptedTools {
	async fn execute(&self, tool_name: &str, parameters: &Value, _timeout: Duration) -> ToolOutcome {
		self.calls.lock().push(ToolCall {
			tool_name: tool_name.to_string(),
			parameters: parameters.clone(),
		});

		let delay = self.delays.lock().get(tool_name).copied();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}

		let queued = self
			.queued
			.lock()
			.get_mut(tool_name)
			.and_then(VecDeque::pop_front);
		match queued {
			Some(outcome) => outcome,
			None => {
				let output = self
					.defaults
					.lock()
					.get(tool_name)
					.cloned()
					.unwrap_or_else(|| json!({ "tool": tool_name }));
				ToolOutcome::ok(output)
			},
		}
	}

	async fn validate(&self, tool_name: &str, parameters: &Value) -> Result<(), ToolError> {
		self.validations.lock().push(ToolCall {
			tool_name: tool_name.to_string(),
			parameters: parameters.clone(),
		});
		match self.invalid.lock().get(tool_name) {
			Some(err) => Err(err.clone()),
			None => Ok(()),
		}
	}
}

/// Planner answering from queues.
#[derive(Default)]
pub struct ScriptedPlanner {
	plans: Mutex<VecDeque<Result<PlanResponse, PlannerError>>>,
	repairs: Mutex<VecDeque<Result<PlanResponse, PlannerError>>>,
	parameters: Mutex<VecDeque<Result<BTreeMap<String, ParamValue>, PlannerError>>>,
	delay: Mutex<Option<Duration>>,
	requests: Mutex<Vec<PlanRequest>>,
	feedback: Mutex<Vec<RepairFeedback>>,
	regenerated_for: Mutex<Vec<String>>,
}

impl ScriptedPlanner {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push_plan(&self, plan: Plan, usage: Option<TokenUsage>) {
		self.plans.lock().push_back(Ok(PlanResponse { plan, usage }));
	}

	pub fn push_plan_error(&self, error: PlannerError) {
		self.plans.lock().push_back(Err(error));
	}

	pub fn push_repair(&self, plan: Plan) {
		self.repairs.lock().push_back(Ok(plan.into()));
	}

	pub fn push_repair_error(&self, error: PlannerError) {
		self.repairs.lock().push_back(Err(error));
	}

	pub fn push_parameters(&self, parameters: BTreeMap<String, ParamValue>) {
		self.parameters.lock().push_back(Ok(parameters));
	}

	/// Delay every planner call.
	pub fn set_delay(&self, delay: Duration) {
		*self.delay.lock() = Some(delay);
	}

	pub fn requests(&self) -> Vec<PlanRequest> {
		self.requests.lock().clone()
	}

	pub fn feedback(&self) -> Vec<RepairFeedback> {
		self.feedback.lock().clone()
	}

	pub fn regenerated_steps(&self) -> Vec<String> {
		self.regenerated_for.lock().clone()
	}

	async fn pause(&self) {
		let delay = *self.delay.lock();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
	}
}

#[async_trait]
impl Planner for ScriptedPlanner {
	async fn generate_plan(&self, request: &PlanRequest) -> Result<PlanResponse, PlannerError> {
		self.requests.lock().push(request.clone());
		self.pause().await;
		let next = self.plans.lock().pop_front();
		next.unwrap_or_else(|| Err(PlannerError::Failed("no plan scripted".into())))
	}

	async fn repair_plan(
		&self,
		request: &PlanRequest,
		feedback: &RepairFeedback,
	) -> Result<PlanResponse, PlannerError> {
		self.requests.lock().push(request.clone());
		self.feedback.lock().push(feedback.clone());
		self.pause().await;
		let next = self.repairs.lock().pop_front();
		next.unwrap_or_else(|| Err(PlannerError::Failed("no repair scripted".into())))
	}

	async fn regenerate_parameters(
		&self,
		step: &PlanStep,
		_input: Option<&Value>,
		_error: &StepError,
	) -> Result<BTreeMap<String, ParamValue>, PlannerError> {
		self.regenerated_for.lock().push(step.id.clone());
		self.pause().await;
		let next = self.parameters.lock().pop_front();
		next.unwrap_or_else(|| Err(PlannerError::Failed("no parameters scripted".into())))
	}
}

//! Saga compensation.
//!
//! When an execution fails for good, completed side effects are undone in
//! reverse completion order using the undo tool registered for each tool.
//! Compensation is best effort: a failing undo is logged and recorded, and
//! the remaining undos still run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::executor::params::lookup_path;
use crate::state::{ExecutionState, StepExecutionState, StepStatus};
use crate::tools::{ToolExecutor, ToolRegistry};

/// How the undo call's parameters are derived from the original step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ParameterMapping {
	/// Pass one field of the original output, e.g. the booking id
	OutputField { source: String, target: String },
	/// Re-send selected fields of the original input
	CopyInput { fields: Vec<String> },
	/// Pass the whole original output object
	FullOutput,
}

impl ParameterMapping {
	pub fn output_field(source: impl Into<String>, target: impl Into<String>) -> Self {
		ParameterMapping::OutputField {
			source: source.into(),
			target: target.into(),
		}
	}

	fn apply(&self, record: &StepExecutionState) -> Result<Value, String> {
		match self {
			ParameterMapping::OutputField { source, target } => {
				let value = record
					.output
					.as_ref()
					.and_then(|output| lookup_path(output, source))
					.filter(|v| !v.is_null())
					.ok_or_else(|| format!("output field '{source}' missing"))?;
				let mut params = Map::new();
				params.insert(target.clone(), value.clone());
				Ok(Value::Object(params))
			},
			ParameterMapping::CopyInput { fields } => {
				let input = record.input.as_ref().and_then(Value::as_object);
				let params: Map<String, Value> = fields
					.iter()
					.filter_map(|f| input.and_then(|i| i.get(f)).map(|v| (f.clone(), v.clone())))
					.collect();
				if params.len() != fields.len() {
					return Err("input fields missing for compensation".to_string());
				}
				Ok(Value::Object(params))
			},
			ParameterMapping::FullOutput => record
				.output
				.clone()
				.filter(Value::is_object)
				.ok_or_else(|| "original output is not an object".to_string()),
		}
	}
}

/// Undo action registered for a state-mutating tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationDefinition {
	pub tool_name: String,
	pub undo_tool: String,
	pub mapping: ParameterMapping,
	/// Undos that need a human are never run automatically
	#[serde(default)]
	pub requires_confirmation: bool,
}

impl CompensationDefinition {
	pub fn new(
		tool_name: impl Into<String>,
		undo_tool: impl Into<String>,
		mapping: ParameterMapping,
	) -> Self {
		Self {
			tool_name: tool_name.into(),
			undo_tool: undo_tool.into(),
			mapping,
			requires_confirmation: false,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct CompensationRegistry {
	definitions: HashMap<String, CompensationDefinition>,
}

impl CompensationRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with(mut self, definition: CompensationDefinition) -> Self {
		self.register(definition);
		self
	}

	pub fn register(&mut self, definition: CompensationDefinition) {
		self
			.definitions
			.insert(definition.tool_name.clone(), definition);
	}

	pub fn get(&self, tool_name: &str) -> Option<&CompensationDefinition> {
		self.definitions.get(tool_name)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
	Compensated,
	Failed,
	Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationEntry {
	pub step_id: String,
	pub tool_name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub undo_tool: Option<String>,
	pub status: CompensationStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

/// What compensation did for an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationReport {
	/// In the order the undos were attempted
	pub entries: Vec<CompensationEntry>,
	pub started_at: DateTime<Utc>,
	pub finished_at: DateTime<Utc>,
}

impl CompensationReport {
	fn count(&self, status: CompensationStatus) -> usize {
		self.entries.iter().filter(|e| e.status == status).count()
	}

	pub fn compensated(&self) -> usize {
		self.count(CompensationStatus::Compensated)
	}

	pub fn failed(&self) -> usize {
		self.count(CompensationStatus::Failed)
	}

	pub fn skipped(&self) -> usize {
		self.count(CompensationStatus::Skipped)
	}
}

pub struct CompensationEngine {
	definitions: Arc<CompensationRegistry>,
	tools: Arc<dyn ToolExecutor>,
	registry: Arc<ToolRegistry>,
	timeout: Duration,
}

impl CompensationEngine {
	pub fn new(
		definitions: Arc<CompensationRegistry>,
		tools: Arc<dyn ToolExecutor>,
		registry: Arc<ToolRegistry>,
		timeout: Duration,
	) -> Self {
		Self {
			definitions,
			tools,
			registry,
			timeout,
		}
	}

	/// Completed steps of the current plan, most recently completed first.
	fn targets<'a>(state: &'a ExecutionState) -> Vec<(&'a str, &'a StepExecutionState)> {
		let mut targets: Vec<(usize, &str, &StepExecutionState)> = state
			.plan
			.steps
			.iter()
			.enumerate()
			.filter_map(|(idx, step)| {
				state
					.step_state(&step.id)
					.filter(|r| r.status == StepStatus::Completed)
					.map(|r| (idx, step.tool_name.as_str(), r))
			})
			.collect();
		targets.sort_by(|a, b| {
			b.2
				.completed_at
				.cmp(&a.2.completed_at)
				.then_with(|| b.0.cmp(&a.0))
		});
		targets.into_iter().map(|(_, tool, r)| (tool, r)).collect()
	}

	/// Undo completed side effects of `state`.
	pub async fn compensate(&self, state: &ExecutionState) -> CompensationReport {
		let started_at = Utc::now();
		let targets = Self::targets(state);
		info!(
			execution_id = %state.execution_id,
			completed_steps = targets.len(),
			"starting compensation"
		);

		let mut entries = Vec::new();
		for (tool_name, record) in targets {
			let Some(definition) = self.definitions.get(tool_name) else {
				debug!(step_id = %record.step_id, "no compensation registered, skipping");
				continue;
			};
			let entry = |status, message: Option<String>| CompensationEntry {
				step_id: record.step_id.clone(),
				tool_name: tool_name.to_string(),
				undo_tool: Some(definition.undo_tool.clone()),
				status,
				message,
			};

			if self
				.registry
				.get(tool_name)
				.is_some_and(|d| d.read_only || d.idempotent)
			{
				debug!(step_id = %record.step_id, "tool is read-only or idempotent, skipping");
				entries.push(entry(
					CompensationStatus::Skipped,
					Some("read-only or idempotent tool".into()),
				));
				continue;
			}
			if definition.requires_confirmation {
				info!(step_id = %record.step_id, "undo requires confirmation, skipping");
				entries.push(entry(
					CompensationStatus::Skipped,
					Some("undo requires confirmation".into()),
				));
				continue;
			}

			let params = match definition.mapping.apply(record) {
				Ok(params) => params,
				Err(message) => {
					error!(step_id = %record.step_id, error = %message, "cannot map compensation parameters");
					entries.push(entry(CompensationStatus::Failed, Some(message)));
					continue;
				},
			};

			let outcome = self
				.tools
				.execute(&definition.undo_tool, &params, self.timeout);
			match tokio::time::timeout(self.timeout, outcome).await {
				Ok(outcome) if outcome.success => {
					info!(step_id = %record.step_id, undo_tool = %definition.undo_tool, "compensation succeeded");
					entries.push(entry(CompensationStatus::Compensated, None));
				},
				Ok(outcome) => {
					let message = outcome
						.error
						.map(|e| e.message)
						.unwrap_or_else(|| "undo tool reported failure".into());
					error!(
						step_id = %record.step_id,
						error = %message,
						"compensation failed (continuing with remaining compensations)"
					);
					entries.push(entry(CompensationStatus::Failed, Some(message)));
				},
				Err(_) => {
					error!(step_id = %record.step_id, "compensation timed out");
					entries.push(entry(
						CompensationStatus::Failed,
						Some(format!("undo timed out after {}ms", self.timeout.as_millis())),
					));
				},
			}
		}

		CompensationReport {
			entries,
			started_at,
			finished_at: Utc::now(),
		}
	}
}

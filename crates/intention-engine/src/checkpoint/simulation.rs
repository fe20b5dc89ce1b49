//! Sandboxed shadow execution used for drift analysis.
//!
//! Nothing here calls a [`ToolExecutor`](crate::tools::ToolExecutor). Each
//! step is checked against the current tool registry and, when it would be
//! accepted, given a synthetic output built from the tool's declared output
//! fields so later steps can resolve references to it.

use serde_json::{Map, Value};

use crate::executor::params::{self, lookup_path};
use crate::plan::{ParamValue, PlanStep};
use crate::state::{ExecutionState, StepStatus};
use crate::tools::ToolRegistry;

/// Result of simulating one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Simulated {
	Completed(Value),
	Diverged(String),
}

pub struct ShadowSimulator<'a> {
	registry: &'a ToolRegistry,
}

impl<'a> ShadowSimulator<'a> {
	pub fn new(registry: &'a ToolRegistry) -> Self {
		Self { registry }
	}

	/// Simulate `step` against `shadow`, a scratch copy of the execution
	/// state holding real outputs for completed steps and synthetic outputs
	/// for steps simulated earlier.
	pub fn simulate(&self, step: &PlanStep, shadow: &ExecutionState) -> Simulated {
		let Some(definition) = self.registry.get(&step.tool_name) else {
			return Simulated::Diverged(format!("tool '{}' is no longer registered", step.tool_name));
		};

		for (name, value) in &step.parameters {
			if let ParamValue::StepOutputRef { step_id, path } = value {
				let resolved = shadow
					.step_state(step_id)
					.filter(|r| r.status == StepStatus::Completed)
					.and_then(|r| r.output.as_ref())
					.is_some_and(|output| {
						lookup_path(output, path.as_deref().unwrap_or("")).is_some()
					});
				if !resolved {
					return Simulated::Diverged(format!(
						"parameter '{name}' references unavailable output {}",
						ParamValue::reference_string(step_id, path.as_deref())
					));
				}
			}
		}

		let resolved = params::resolve_parameters(step, shadow, Some(definition));
		if let Some(missing) = definition
			.parameters
			.iter()
			.find(|p| p.required && resolved.get(&p.name).is_none_or(Value::is_null))
		{
			return Simulated::Diverged(format!("required parameter '{}' is missing", missing.name));
		}
		if let Some(unknown) = resolved.keys().find(|k| {
			!definition.parameters.is_empty()
				&& !definition.declares(k)
				&& !definition.parameter_aliases.contains_key(k.as_str())
		}) {
			return Simulated::Diverged(format!("parameter '{unknown}' is not declared by the tool"));
		}

		let output: Map<String, Value> = definition
			.output_fields
			.iter()
			.map(|field| (field.clone(), Value::String(format!("shadow:{}:{field}", step.id))))
			.collect();
		Simulated::Completed(Value::Object(output))
	}
}

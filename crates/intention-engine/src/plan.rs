//! Plan intermediate representation.
//!
//! A plan is a DAG of steps produced by the planner. It is treated as an
//! immutable value: the self-repair loop never edits a plan in place, it
//! produces a new plan with a bumped version.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors found when validating a plan before execution.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanError {
	#[error("plan has no steps")]
	Empty,

	#[error("duplicate step id '{0}'")]
	DuplicateStepId(String),

	#[error("step '{step_id}' depends on itself")]
	SelfDependency { step_id: String },

	#[error("plan has {actual} steps, more than the allowed {max}")]
	TooManySteps { actual: usize, max: usize },
}

/// An executable plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
	pub id: String,

	/// Incremented every time the self-repair loop produces a replacement
	#[serde(default = "default_version")]
	pub version: u32,

	pub steps: Vec<PlanStep>,

	#[serde(default)]
	pub constraints: PlanConstraints,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub summary: Option<String>,
}

fn default_version() -> u32 {
	1
}

/// Global limits attached to a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanConstraints {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_steps: Option<usize>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,

	/// Wall-clock limit for the whole execution, measured from its creation
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_execution_time_ms: Option<u64>,
}

/// A single step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
	/// Unique within the plan; referenced by dependencies and parameter refs
	pub id: String,

	pub tool_name: String,

	#[serde(default)]
	pub parameters: BTreeMap<String, ParamValue>,

	/// Step ids that must be completed before this step may start
	#[serde(default)]
	pub dependencies: Vec<String>,

	#[serde(default)]
	pub requires_confirmation: bool,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timeout_ms: Option<u64>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
}

/// A parameter value: either a literal or a reference to another step's output.
///
/// References serialize as `{"$step": "search", "$path": "results.0.id"}` so
/// that planners can emit them as plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
	StepOutputRef {
		#[serde(rename = "$step")]
		step_id: String,
		#[serde(rename = "$path", default, skip_serializing_if = "Option::is_none")]
		path: Option<String>,
	},
	Literal(serde_json::Value),
}

impl ParamValue {
	pub fn literal(value: impl Into<serde_json::Value>) -> Self {
		ParamValue::Literal(value.into())
	}

	pub fn step_ref(step_id: impl Into<String>, path: Option<&str>) -> Self {
		ParamValue::StepOutputRef {
			step_id: step_id.into(),
			path: path.map(str::to_string),
		}
	}

	/// Textual form of a reference, used when it cannot be resolved.
	pub fn reference_string(step_id: &str, path: Option<&str>) -> String {
		match path {
			Some(p) if !p.is_empty() => format!("${step_id}.{p}"),
			_ => format!("${step_id}"),
		}
	}
}

impl From<serde_json::Value> for ParamValue {
	fn from(value: serde_json::Value) -> Self {
		ParamValue::Literal(value)
	}
}

impl PlanStep {
	pub fn new(id: impl Into<String>, tool_name: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			tool_name: tool_name.into(),
			parameters: BTreeMap::new(),
			dependencies: Vec::new(),
			requires_confirmation: false,
			timeout_ms: None,
			description: None,
		}
	}

	pub fn with_param(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
		self
			.parameters
			.insert(name.into(), ParamValue::Literal(value.into()));
		self
	}

	pub fn with_ref(
		mut self,
		name: impl Into<String>,
		step_id: impl Into<String>,
		path: Option<&str>,
	) -> Self {
		self
			.parameters
			.insert(name.into(), ParamValue::step_ref(step_id, path));
		self
	}

	pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
		self.dependencies.push(step_id.into());
		self
	}

	pub fn with_confirmation(mut self) -> Self {
		self.requires_confirmation = true;
		self
	}

	pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
		self.timeout_ms = Some(timeout_ms);
		self
	}

	pub fn with_description(mut self, description: impl Into<String>) -> Self {
		self.description = Some(description.into());
		self
	}
}

impl Plan {
	pub fn new(id: impl Into<String>, steps: Vec<PlanStep>) -> Self {
		Self {
			id: id.into(),
			version: default_version(),
			steps,
			constraints: PlanConstraints::default(),
			summary: None,
		}
	}

	pub fn with_constraints(mut self, constraints: PlanConstraints) -> Self {
		self.constraints = constraints;
		self
	}

	pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
		self.summary = Some(summary.into());
		self
	}

	pub fn step(&self, id: &str) -> Option<&PlanStep> {
		self.steps.iter().find(|s| s.id == id)
	}

	pub fn is_empty(&self) -> bool {
		self.steps.is_empty()
	}

	pub fn len(&self) -> usize {
		self.steps.len()
	}

	/// Distinct tool names used by this plan, in first-use order.
	pub fn tool_names(&self) -> Vec<&str> {
		let mut seen = HashSet::new();
		self
			.steps
			.iter()
			.filter(|s| seen.insert(s.tool_name.as_str()))
			.map(|s| s.tool_name.as_str())
			.collect()
	}

	/// Produce the next version of this plan with a replaced step list.
	pub fn next_version(&self, steps: Vec<PlanStep>) -> Plan {
		Plan {
			id: self.id.clone(),
			version: self.version + 1,
			steps,
			constraints: self.constraints.clone(),
			summary: self.summary.clone(),
		}
	}

	/// Structural checks performed before a plan is accepted for execution.
	///
	/// Dependencies on unknown step ids are not rejected here: they surface at
	/// run time as an unsatisfiable dependency.
	pub fn validate(&self) -> Result<(), PlanError> {
		if self.steps.is_empty() {
			return Err(PlanError::Empty);
		}
		if let Some(max) = self.constraints.max_steps
			&& self.steps.len() > max
		{
			return Err(PlanError::TooManySteps {
				actual: self.steps.len(),
				max,
			});
		}
		let mut ids = HashSet::new();
		for step in &self.steps {
			if !ids.insert(step.id.as_str()) {
				return Err(PlanError::DuplicateStepId(step.id.clone()));
			}
			if step.dependencies.iter().any(|d| d == &step.id) {
				return Err(PlanError::SelfDependency {
					step_id: step.id.clone(),
				});
			}
		}
		Ok(())
	}
}

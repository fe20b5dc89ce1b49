//! Tool layer: the `ToolExecutor` collaborator and the tool registry.
//!
//! The engine never assumes anything about tool internals. A tool is a name,
//! a declared parameter/output schema and a handful of policy flags, all held
//! in an explicit [`ToolRegistry`] value built once at start-up.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorCode;
use crate::plan::Plan;

/// Broad classification of a tool failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
	/// The tool rejected the parameters
	Validation,
	NotFound,
	/// Other 4xx-style errors
	Client,
	/// 5xx-style errors
	Server,
	Timeout,
	Unavailable,
	Unknown,
}

/// Error reported by a tool invocation.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{category:?} error from tool: {message}")]
pub struct ToolError {
	pub category: ErrorCategory,
	pub message: String,
	/// HTTP-style status code, when the tool surfaced one
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
}

impl ToolError {
	pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
		Self {
			category,
			message: message.into(),
			status: None,
		}
	}

	pub fn validation(message: impl Into<String>) -> Self {
		Self::new(ErrorCategory::Validation, message)
	}

	pub fn server(message: impl Into<String>) -> Self {
		Self::new(ErrorCategory::Server, message)
	}

	/// Build an error from an HTTP-style status code.
	pub fn from_status(status: u16, message: impl Into<String>) -> Self {
		let category = match status {
			400 | 422 => ErrorCategory::Validation,
			404 => ErrorCategory::NotFound,
			408 | 504 => ErrorCategory::Timeout,
			503 => ErrorCategory::Unavailable,
			400..=499 => ErrorCategory::Client,
			500..=599 => ErrorCategory::Server,
			_ => ErrorCategory::Unknown,
		};
		Self {
			category,
			message: message.into(),
			status: Some(status),
		}
	}

	/// 4xx/5xx-style failures are eligible for one inline correction.
	pub fn is_client_or_server(&self) -> bool {
		if let Some(status) = self.status {
			return (400..600).contains(&status);
		}
		matches!(
			self.category,
			ErrorCategory::Validation
				| ErrorCategory::NotFound
				| ErrorCategory::Client
				| ErrorCategory::Server
		)
	}

	/// Step-level error code for this failure.
	pub fn error_code(&self) -> ErrorCode {
		match self.category {
			ErrorCategory::Validation => ErrorCode::ToolValidationFailed,
			ErrorCategory::Timeout => ErrorCode::Timeout,
			_ => ErrorCode::ToolExecutionFailed,
		}
	}
}

/// Result of one tool invocation as reported by the tool layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
	pub success: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub output: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ToolError>,
	pub latency_ms: u64,
}

impl ToolOutcome {
	pub fn ok(output: Value) -> Self {
		Self {
			success: true,
			output: Some(output),
			error: None,
			latency_ms: 0,
		}
	}

	pub fn err(error: ToolError) -> Self {
		Self {
			success: false,
			output: None,
			error: Some(error),
			latency_ms: 0,
		}
	}

	pub fn into_result(self) -> Result<Value, ToolError> {
		if self.success {
			Ok(self.output.unwrap_or(Value::Null))
		} else {
			Err(self
				.error
				.unwrap_or_else(|| ToolError::new(ErrorCategory::Unknown, "tool reported failure")))
		}
	}
}

/// Trait for invoking external tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
	/// Invoke a tool by name.
	async fn execute(&self, tool_name: &str, parameters: &Value, timeout: Duration) -> ToolOutcome;

	/// Dry-run validation of parameters. Tools without a validation endpoint
	/// accept everything.
	async fn validate(&self, _tool_name: &str, _parameters: &Value) -> Result<(), ToolError> {
		Ok(())
	}
}

/// Declared type of a tool parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
	#[default]
	String,
	Integer,
	Number,
	Boolean,
	Object,
	Array,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolParameter {
	pub name: String,
	#[serde(default)]
	pub kind: ParamKind,
	#[serde(default)]
	pub required: bool,
}

impl ToolParameter {
	pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
		Self {
			name: name.into(),
			kind,
			required: true,
		}
	}

	pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
		Self {
			name: name.into(),
			kind,
			required: false,
		}
	}
}

/// Declared shape and policy of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
	pub name: String,

	#[serde(default = "default_schema_version")]
	pub schema_version: String,

	#[serde(default)]
	pub requires_confirmation: bool,

	#[serde(default)]
	pub parameters: Vec<ToolParameter>,

	/// alias -> canonical parameter name
	#[serde(default)]
	pub parameter_aliases: BTreeMap<String, String>,

	/// Top-level fields of the tool's output, used by shadow simulation
	#[serde(default)]
	pub output_fields: Vec<String>,

	/// Estimated cost of one call in dollars
	#[serde(default)]
	pub estimated_cost: f64,

	/// Read-only tools have no side effect to compensate
	#[serde(default)]
	pub read_only: bool,

	/// Idempotent tools can be re-run safely and are never compensated
	#[serde(default)]
	pub idempotent: bool,
}

fn default_schema_version() -> String {
	"1".to_string()
}

impl ToolDefinition {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			schema_version: default_schema_version(),
			requires_confirmation: false,
			parameters: Vec::new(),
			parameter_aliases: BTreeMap::new(),
			output_fields: Vec::new(),
			estimated_cost: 0.0,
			read_only: false,
			idempotent: false,
		}
	}

	pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
		self.parameters.push(parameter);
		self
	}

	pub fn with_alias(mut self, alias: impl Into<String>, canonical: impl Into<String>) -> Self {
		self.parameter_aliases.insert(alias.into(), canonical.into());
		self
	}

	pub fn with_output_fields<I, S>(mut self, fields: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.output_fields = fields.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
		self.schema_version = version.into();
		self
	}

	pub fn with_cost(mut self, cost: f64) -> Self {
		self.estimated_cost = cost;
		self
	}

	pub fn with_confirmation(mut self) -> Self {
		self.requires_confirmation = true;
		self
	}

	pub fn read_only(mut self) -> Self {
		self.read_only = true;
		self
	}

	pub fn idempotent(mut self) -> Self {
		self.idempotent = true;
		self
	}

	pub fn parameter(&self, name: &str) -> Option<&ToolParameter> {
		self.parameters.iter().find(|p| p.name == name)
	}

	pub fn declares(&self, name: &str) -> bool {
		self.parameter(name).is_some()
	}
}

/// Registry of known tools, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
	tools: HashMap<String, ToolDefinition>,
}

impl ToolRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_tool(mut self, definition: ToolDefinition) -> Self {
		self.register(definition);
		self
	}

	pub fn register(&mut self, definition: ToolDefinition) {
		self.tools.insert(definition.name.clone(), definition);
	}

	pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
		self.tools.get(name)
	}

	pub fn len(&self) -> usize {
		self.tools.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tools.is_empty()
	}

	/// Current schema versions of the tools a plan uses. Unknown tools are
	/// omitted.
	pub fn schema_versions(&self, plan: &Plan) -> BTreeMap<String, String> {
		plan
			.tool_names()
			.into_iter()
			.filter_map(|name| {
				self
					.get(name)
					.map(|def| (name.to_string(), def.schema_version.clone()))
			})
			.collect()
	}
}

impl FromIterator<ToolDefinition> for ToolRegistry {
	fn from_iter<T: IntoIterator<Item = ToolDefinition>>(iter: T) -> Self {
		let mut registry = ToolRegistry::new();
		for def in iter {
			registry.register(def);
		}
		registry
	}
}

impl fmt::Display for ErrorCategory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ErrorCategory::Validation => "validation",
			ErrorCategory::NotFound => "not_found",
			ErrorCategory::Client => "client",
			ErrorCategory::Server => "server",
			ErrorCategory::Timeout => "timeout",
			ErrorCategory::Unavailable => "unavailable",
			ErrorCategory::Unknown => "unknown",
		};
		f.write_str(s)
	}
}

//! Inline correction of parameters after a client/server tool error.
//!
//! Corrections are mechanical and schema-driven: trim strings, coerce values
//! to the declared kind, re-apply aliases and drop fields the tool does not
//! declare. A tool without a declared schema only gets trimming.

use serde_json::{Map, Number, Value};

use super::params::apply_aliases;
use crate::tools::{ParamKind, ToolDefinition};

fn coerce(value: &Value, kind: ParamKind) -> Option<Value> {
	match (kind, value) {
		(ParamKind::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
		(ParamKind::Integer, Value::Number(n)) if !n.is_i64() && !n.is_u64() => n
			.as_f64()
			.filter(|f| f.fract() == 0.0)
			.map(|f| Value::from(f as i64)),
		(ParamKind::Number, Value::String(s)) => s
			.trim()
			.parse::<f64>()
			.ok()
			.and_then(Number::from_f64)
			.map(Value::Number),
		(ParamKind::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
			"true" | "yes" | "1" => Some(Value::Bool(true)),
			"false" | "no" | "0" => Some(Value::Bool(false)),
			_ => None,
		},
		(ParamKind::String, Value::Number(n)) => Some(Value::String(n.to_string())),
		(ParamKind::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
		(ParamKind::Array, v @ (Value::String(_) | Value::Number(_) | Value::Object(_))) => {
			Some(Value::Array(vec![v.clone()]))
		},
		_ => None,
	}
}

fn trim(value: &Value) -> Option<Value> {
	match value {
		Value::String(s) if s.trim().len() != s.len() => Some(Value::String(s.trim().to_string())),
		_ => None,
	}
}

/// Attempt one correction pass. Returns `None` when nothing changed, in which
/// case retrying would send the same request again.
pub fn correct_parameters(
	params: &Map<String, Value>,
	definition: Option<&ToolDefinition>,
) -> Option<Map<String, Value>> {
	let mut corrected = params.clone();

	for value in corrected.values_mut() {
		if let Some(trimmed) = trim(value) {
			*value = trimmed;
		}
	}

	if let Some(def) = definition {
		apply_aliases(&mut corrected, def);
		for param in &def.parameters {
			if let Some(value) = corrected.get(&param.name)
				&& let Some(fixed) = coerce(value, param.kind)
			{
				corrected.insert(param.name.clone(), fixed);
			}
		}
		if !def.parameters.is_empty() {
			corrected.retain(|name, _| def.declares(name));
		}
	}

	(corrected != *params).then_some(corrected)
}

//! Parameter resolution for a step about to run.

use serde_json::{Map, Value};

use crate::plan::{ParamValue, PlanStep};
use crate::state::{ExecutionState, StepStatus};
use crate::tools::ToolDefinition;

/// Contact fields and the user preference keys that fill them.
const CONTACT_FIELDS: [(&str, &str); 3] = [
	("contact_name", "name"),
	("contact_phone", "phone"),
	("contact_email", "email"),
];

/// Follow a dot path into a JSON value. Numeric segments index arrays.
///
/// An empty path returns the value itself.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
	let path = path.strip_prefix("$.").unwrap_or(path);
	if path.is_empty() {
		return Some(value);
	}
	path.split('.').try_fold(value, |current, segment| match current {
		Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
		Value::Object(map) => map.get(segment),
		_ => None,
	})
}

/// Resolve a single parameter expression against completed step outputs.
///
/// Unresolved references evaluate to the textual reference so the failure
/// is visible to the tool and in the audit trail.
pub fn resolve_value(value: &ParamValue, state: &ExecutionState) -> Value {
	match value {
		ParamValue::Literal(v) => v.clone(),
		ParamValue::StepOutputRef { step_id, path } => state
			.step_state(step_id)
			.filter(|s| s.status == StepStatus::Completed)
			.and_then(|s| s.output.as_ref())
			.and_then(|output| lookup_path(output, path.as_deref().unwrap_or("")))
			.cloned()
			.unwrap_or_else(|| {
				Value::String(ParamValue::reference_string(step_id, path.as_deref()))
			}),
	}
}

/// Copy alias keys to their canonical names when the canonical key is absent.
pub fn apply_aliases(params: &mut Map<String, Value>, definition: &ToolDefinition) {
	for (alias, canonical) in &definition.parameter_aliases {
		if !params.contains_key(canonical)
			&& let Some(value) = params.get(alias).cloned()
		{
			params.insert(canonical.clone(), value);
		}
	}
}

fn is_missing(params: &Map<String, Value>, key: &str) -> bool {
	match params.get(key) {
		None | Some(Value::Null) => true,
		Some(Value::String(s)) => s.trim().is_empty(),
		_ => false,
	}
}

/// Fill contact fields from `context.user_preferences` and coordinates from
/// `context.location`, for fields the tool declares and the step left empty.
pub fn backfill_from_context(
	params: &mut Map<String, Value>,
	definition: &ToolDefinition,
	context: &Value,
) {
	if let Some(prefs) = context.get("user_preferences") {
		for (field, pref_key) in CONTACT_FIELDS {
			if definition.declares(field)
				&& is_missing(params, field)
				&& let Some(value) = prefs.get(pref_key).or_else(|| prefs.get(field))
				&& !value.is_null()
			{
				params.insert(field.to_string(), value.clone());
			}
		}
	}

	if let Some(location) = context.get("location") {
		for field in ["lat", "lng"] {
			if definition.declares(field)
				&& is_missing(params, field)
				&& let Some(value) = location.get(field)
			{
				params.insert(field.to_string(), value.clone());
			}
		}
	}
}

/// Produce the parameters actually sent to the tool.
pub fn resolve_parameters(
	step: &PlanStep,
	state: &ExecutionState,
	definition: Option<&ToolDefinition>,
) -> Map<String, Value> {
	let mut params: Map<String, Value> = step
		.parameters
		.iter()
		.map(|(name, value)| (name.clone(), resolve_value(value, state)))
		.collect();

	if let Some(def) = definition {
		apply_aliases(&mut params, def);
		backfill_from_context(&mut params, def, &state.context);
	}
	params
}

//! Intent guardrails for irreversible actions.
//!
//! Before a booking-like tool runs, its resolved parameters are checked
//! against the qualitative constraints the user expressed (listed under
//! `context.intent_constraints`). A mismatch pauses the step for human
//! confirmation instead of executing it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardrailConfig {
	/// Substrings of tool names that mark an action as irreversible
	pub irreversible_markers: Vec<String>,
	/// Highest acceptable price level (1-4) for budget constraints
	pub budget_max_price_level: u64,
	/// Largest party that still counts as romantic
	pub romantic_max_party_size: u64,
}

impl Default for GuardrailConfig {
	fn default() -> Self {
		Self {
			irreversible_markers: vec!["book".into(), "reserve".into(), "schedule".into()],
			budget_max_price_level: 2,
			romantic_max_party_size: 2,
		}
	}
}

impl GuardrailConfig {
	pub fn is_irreversible(&self, tool_name: &str) -> bool {
		let name = tool_name.to_ascii_lowercase();
		self
			.irreversible_markers
			.iter()
			.any(|marker| name.contains(marker.as_str()))
	}
}

/// Read `context.intent_constraints` as lower-cased strings.
pub fn intent_constraints(context: &Value) -> Vec<String> {
	match context.get("intent_constraints") {
		Some(Value::Array(items)) => items
			.iter()
			.filter_map(Value::as_str)
			.map(str::to_ascii_lowercase)
			.collect(),
		Some(Value::String(s)) => vec![s.to_ascii_lowercase()],
		_ => Vec::new(),
	}
}

/// Price level as a number, accepting `3` or `"$$$"`.
fn price_level(params: &Map<String, Value>) -> Option<u64> {
	match params.get("price_level").or_else(|| params.get("price"))? {
		Value::Number(n) => n.as_u64(),
		Value::String(s) if !s.is_empty() && s.chars().all(|c| c == '$') => Some(s.len() as u64),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	}
}

fn party_size(params: &Map<String, Value>) -> Option<u64> {
	match params.get("party_size")? {
		Value::Number(n) => n.as_u64(),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	}
}

fn text_field(params: &Map<String, Value>, keys: &[&str]) -> Option<String> {
	keys
		.iter()
		.find_map(|k| params.get(*k).and_then(Value::as_str))
		.map(str::to_ascii_lowercase)
}

/// Check an irreversible step's parameters against the intent constraints.
///
/// Returns an explanation of the first mismatch found.
pub fn check(
	config: &GuardrailConfig,
	tool_name: &str,
	params: &Map<String, Value>,
	context: &Value,
) -> Result<(), String> {
	if !config.is_irreversible(tool_name) {
		return Ok(());
	}
	for constraint in intent_constraints(context) {
		match constraint.as_str() {
			"budget" | "cheap" => {
				if let Some(level) = price_level(params)
					&& level > config.budget_max_price_level
				{
					return Err(format!(
						"price level {level} conflicts with the '{constraint}' constraint"
					));
				}
			},
			"romantic" => {
				if let Some(size) = party_size(params)
					&& size > config.romantic_max_party_size
				{
					return Err(format!(
						"party of {size} conflicts with the 'romantic' constraint"
					));
				}
			},
			"quiet" => {
				if let Some(ambience) = text_field(params, &["ambience", "noise_level"])
					&& matches!(ambience.as_str(), "loud" | "lively" | "noisy")
				{
					return Err(format!("'{ambience}' venue conflicts with the 'quiet' constraint"));
				}
			},
			"family" => {
				let adults_only = params.get("adults_only").and_then(Value::as_bool) == Some(true);
				let bar = text_field(params, &["venue_type"]).is_some_and(|v| v == "bar");
				if adults_only || bar {
					return Err("adults-only venue conflicts with the 'family' constraint".to_string());
				}
			},
			_ => {},
		}
	}
	Ok(())
}

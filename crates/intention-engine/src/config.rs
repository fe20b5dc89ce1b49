//! Engine configuration.
//!
//! Every section has defaults, so an empty document is a valid
//! configuration. Keys are camelCase.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::breaker::BreakerConfig;
use crate::breaker::cost::CostConfig;
use crate::checkpoint::DriftConfig;
use crate::compensation::{CompensationDefinition, CompensationRegistry};
use crate::executor::GuardrailConfig;
use crate::repair::RepairConfig;
use crate::telemetry::LoggingConfig;
use crate::tools::{ToolDefinition, ToolRegistry};

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config: {0}")]
	Io(#[from] std::io::Error),

	#[error("invalid config: {0}")]
	Parse(#[from] serde_yaml::Error),

	#[error("invalid config value for {field}: {message}")]
	Invalid { field: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
	/// Stamped into checkpoints and compared on resume
	pub orchestrator_version: String,
	/// Time one coordinator invocation may spend before checkpointing
	pub execution_budget_ms: u64,
	/// Safety margin kept free at the end of the invocation budget
	pub checkpoint_margin_ms: u64,
	pub default_step_timeout_ms: u64,
	pub compensation_timeout_ms: u64,
	pub breaker: BreakerConfig,
	pub cost: CostConfig,
	pub repair: RepairConfig,
	pub drift: DriftConfig,
	pub guardrails: GuardrailConfig,
	pub idempotency_ttl_secs: u64,
	pub logging: LoggingConfig,
	pub tools: Vec<ToolDefinition>,
	pub compensations: Vec<CompensationDefinition>,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			orchestrator_version: env!("CARGO_PKG_VERSION").to_string(),
			execution_budget_ms: 300_000,
			checkpoint_margin_ms: 10_000,
			default_step_timeout_ms: 30_000,
			compensation_timeout_ms: 10_000,
			breaker: BreakerConfig::default(),
			cost: CostConfig::default(),
			repair: RepairConfig::default(),
			drift: DriftConfig::default(),
			guardrails: GuardrailConfig::default(),
			idempotency_ttl_secs: 86_400,
			logging: LoggingConfig::default(),
			tools: Vec::new(),
			compensations: Vec::new(),
		}
	}
}

impl EngineConfig {
	pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
		let config: EngineConfig = if yaml.trim().is_empty() {
			EngineConfig::default()
		} else {
			serde_yaml::from_str(yaml)?
		};
		config.validate()?;
		Ok(config)
	}

	pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let content = fs_err::tokio::read_to_string(path).await?;
		let config = Self::from_yaml_str(&content)?;
		info!(path = %path.display(), tools = config.tools.len(), "loaded engine config");
		Ok(config)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.checkpoint_margin_ms >= self.execution_budget_ms {
			return Err(ConfigError::Invalid {
				field: "checkpointMarginMs",
				message: format!(
					"margin {}ms must be smaller than the execution budget {}ms",
					self.checkpoint_margin_ms, self.execution_budget_ms
				),
			});
		}
		if self.drift.review_threshold_pct > self.drift.block_threshold_pct {
			return Err(ConfigError::Invalid {
				field: "drift",
				message: "review threshold is above the block threshold".into(),
			});
		}
		if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
			return Err(ConfigError::Invalid {
				field: "breaker",
				message: "thresholds must be at least 1".into(),
			});
		}
		Ok(())
	}

	pub fn execution_budget(&self) -> Duration {
		Duration::from_millis(self.execution_budget_ms)
	}

	/// Invocation time after which the coordinator checkpoints and yields.
	pub fn checkpoint_after(&self) -> Duration {
		Duration::from_millis(self.execution_budget_ms.saturating_sub(self.checkpoint_margin_ms))
	}

	pub fn default_step_timeout(&self) -> Duration {
		Duration::from_millis(self.default_step_timeout_ms)
	}

	pub fn compensation_timeout(&self) -> Duration {
		Duration::from_millis(self.compensation_timeout_ms)
	}

	pub fn idempotency_ttl(&self) -> Duration {
		Duration::from_secs(self.idempotency_ttl_secs)
	}

	pub fn tool_registry(&self) -> ToolRegistry {
		self.tools.iter().cloned().collect()
	}

	pub fn compensation_registry(&self) -> CompensationRegistry {
		let mut registry = CompensationRegistry::new();
		for definition in &self.compensations {
			registry.register(definition.clone());
		}
		registry
	}
}

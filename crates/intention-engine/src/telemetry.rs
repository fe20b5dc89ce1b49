//! Log output setup for binaries and tests embedding the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Human,
	Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
	/// Filter directive used when `RUST_LOG` is not set
	pub level: String,
	pub format: LogFormat,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
			format: LogFormat::Human,
		}
	}
}

#[derive(Debug, Error)]
pub enum TelemetryError {
	#[error("invalid log filter '{directive}': {source}")]
	Filter {
		directive: String,
		#[source]
		source: tracing_subscriber::filter::ParseError,
	},

	#[error("a global subscriber is already installed")]
	AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
	match EnvFilter::try_from_default_env() {
		Ok(filter) => Ok(filter),
		Err(_) => EnvFilter::try_new(&config.level).map_err(|source| TelemetryError::Filter {
			directive: config.level.clone(),
			source,
		}),
	}
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TelemetryError> {
	let filter = env_filter(config)?;
	let output: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
		LogFormat::Human => fmt::layer().with_target(true).boxed(),
		LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
	};
	tracing_subscriber::registry()
		.with(output)
		.with(filter)
		.try_init()?;
	Ok(())
}

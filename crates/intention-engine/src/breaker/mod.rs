//! Circuit breakers guarding tool invocations.
//!
//! One breaker per tool name. State lives in a pluggable [`CircuitStore`] so
//! it can be shared between orchestrator instances, and breakers are reached
//! through an explicit [`CircuitBreakerRegistry`] value.

pub mod cost;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::stateful::{StateStore, StateStoreExt, StoreError};
use crate::tools::{ErrorCategory, ToolError};

/// Error returned by a call made through a breaker.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
	/// The circuit is open and the call was not attempted
	#[error("circuit '{name}' is open")]
	Open {
		name: String,
		retry_after: Option<Duration>,
	},

	#[error("call through circuit '{name}' timed out after {timeout:?}")]
	Timeout { name: String, timeout: Duration },

	#[error("circuit state error: {0}")]
	State(#[from] StoreError),

	/// The wrapped operation failed
	#[error("{0}")]
	Inner(E),
}

/// Errors that can tell the breaker what kind of failure they are.
pub trait FailureCategory {
	fn category(&self) -> ErrorCategory;
}

impl FailureCategory for ToolError {
	fn category(&self) -> ErrorCategory {
		self.category
	}
}

/// Breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
	#[default]
	Closed,
	Open,
	HalfOpen,
}

/// Persistent state of one circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitState {
	pub state: BreakerState,
	/// Consecutive counted failures while closed
	pub failure_count: u32,
	/// Consecutive successes while half-open
	pub success_count: u32,
	/// When the circuit last opened or went half-open (Unix ms)
	pub opened_at_ms: Option<u64>,
	/// Trial calls admitted while half-open and not yet finished
	#[serde(default)]
	pub trials_in_flight: u32,
}

impl CircuitState {
	fn now_ms() -> u64 {
		SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.map(|d| d.as_millis() as u64)
			.unwrap_or(0)
	}

	/// Earliest time a trial call is allowed (Unix ms), when open.
	pub fn next_attempt_ms(&self, reset_timeout: Duration) -> Option<u64> {
		if self.state != BreakerState::Open {
			return None;
		}
		self
			.opened_at_ms
			.map(|opened| opened + reset_timeout.as_millis() as u64)
	}

	fn time_since_opened(&self) -> Option<Duration> {
		let opened = self.opened_at_ms?;
		Some(Duration::from_millis(Self::now_ms().saturating_sub(opened)))
	}

	fn open(&mut self) {
		self.state = BreakerState::Open;
		self.opened_at_ms = Some(Self::now_ms());
		self.success_count = 0;
		self.trials_in_flight = 0;
	}

	fn half_open(&mut self) {
		self.state = BreakerState::HalfOpen;
		self.opened_at_ms = Some(Self::now_ms());
		self.success_count = 0;
		self.trials_in_flight = 0;
	}

	fn close(&mut self) {
		*self = CircuitState::default();
	}
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
	/// Consecutive counted failures before the circuit opens
	pub failure_threshold: u32,
	/// Consecutive half-open successes before the circuit closes
	pub success_threshold: u32,
	/// Time an open circuit waits before allowing a trial call
	pub reset_timeout_ms: u64,
	/// Trial calls allowed to run at once while half-open
	pub half_open_max_calls: u32,
	/// Failure categories that never count toward the threshold
	pub ignored_categories: Vec<ErrorCategory>,
}

impl Default for BreakerConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			success_threshold: 2,
			reset_timeout_ms: 30_000,
			half_open_max_calls: 1,
			ignored_categories: vec![
				ErrorCategory::Validation,
				ErrorCategory::NotFound,
				ErrorCategory::Client,
			],
		}
	}
}

impl BreakerConfig {
	pub fn reset_timeout(&self) -> Duration {
		Duration::from_millis(self.reset_timeout_ms)
	}

	fn ignores(&self, category: ErrorCategory) -> bool {
		self.ignored_categories.contains(&category)
	}
}

/// Storage for circuit state.
#[async_trait]
pub trait CircuitStore: Send + Sync {
	async fn load_circuit_state(&self, name: &str) -> Result<Option<CircuitState>, StoreError>;

	async fn save_circuit_state(&self, name: &str, state: &CircuitState) -> Result<(), StoreError>;
}

/// Process-local circuit store.
#[derive(Default)]
pub struct InMemoryCircuitStore {
	circuits: RwLock<HashMap<String, CircuitState>>,
}

impl InMemoryCircuitStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl CircuitStore for InMemoryCircuitStore {
	async fn load_circuit_state(&self, name: &str) -> Result<Option<CircuitState>, StoreError> {
		Ok(self.circuits.read().get(name).cloned())
	}

	async fn save_circuit_state(&self, name: &str, state: &CircuitState) -> Result<(), StoreError> {
		self.circuits.write().insert(name.to_string(), state.clone());
		Ok(())
	}
}

/// Circuit store on top of a shared key-value [`StateStore`].
pub struct KvCircuitStore<S: StateStore + ?Sized> {
	store: Arc<S>,
}

impl<S: StateStore + ?Sized> KvCircuitStore<S> {
	pub fn new(store: Arc<S>) -> Self {
		Self { store }
	}
}

#[async_trait]
impl<S: StateStore + ?Sized> CircuitStore for KvCircuitStore<S> {
	async fn load_circuit_state(&self, name: &str) -> Result<Option<CircuitState>, StoreError> {
		self.store.get_json(&format!("circuit:{name}")).await
	}

	async fn save_circuit_state(&self, name: &str, state: &CircuitState) -> Result<(), StoreError> {
		self
			.store
			.set_json(&format!("circuit:{name}"), state, None)
			.await
	}
}

/// Executes calls under a named circuit.
///
/// Every read-modify-write of a circuit happens under a per-name lock and
/// starts from freshly loaded state, so overlapping calls to one tool see
/// each other's outcomes.
pub struct CircuitBreaker {
	store: Arc<dyn CircuitStore>,
	locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// How a call was let through the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
	Normal,
	Trial,
}

impl CircuitBreaker {
	pub fn new(store: Arc<dyn CircuitStore>) -> Self {
		Self {
			store,
			locks: Mutex::new(HashMap::new()),
		}
	}

	fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
		self.locks.lock().entry(name.to_string()).or_default().clone()
	}

	/// Run `operation` through the circuit `name` with a per-call `timeout`.
	///
	/// ```text
	/// CLOSED --[failure_threshold consecutive failures]--> OPEN
	/// OPEN --[reset_timeout elapsed]--> HALF_OPEN
	/// HALF_OPEN --[success_threshold consecutive successes]--> CLOSED
	/// HALF_OPEN --[failure]--> OPEN
	/// ```
	///
	/// Timeouts count as failures. Failures in an ignored category pass
	/// through without touching the circuit. At most `half_open_max_calls`
	/// trial calls run at once while half-open.
	pub async fn call<F, T, E>(
		&self,
		name: &str,
		config: &BreakerConfig,
		timeout: Duration,
		operation: F,
	) -> Result<T, BreakerError<E>>
	where
		F: Future<Output = Result<T, E>>,
		E: FailureCategory,
	{
		let admission = self.admit::<E>(name, config).await?;

		match tokio::time::timeout(timeout, operation).await {
			Ok(Ok(value)) => {
				self.on_success(name, config, admission).await?;
				Ok(value)
			},
			Ok(Err(e)) if config.ignores(e.category()) => {
				if admission == Admission::Trial {
					self.release_trial(name).await?;
				}
				Err(BreakerError::Inner(e))
			},
			Ok(Err(e)) => {
				self.on_failure(name, config).await?;
				Err(BreakerError::Inner(e))
			},
			Err(_elapsed) => {
				self.on_failure(name, config).await?;
				Err(BreakerError::Timeout {
					name: name.to_string(),
					timeout,
				})
			},
		}
	}

	/// Current state of a circuit; unknown circuits are closed.
	pub async fn state(&self, name: &str) -> Result<CircuitState, StoreError> {
		Ok(self.store.load_circuit_state(name).await?.unwrap_or_default())
	}

	async fn admit<E>(&self, name: &str, config: &BreakerConfig) -> Result<Admission, BreakerError<E>> {
		let lock = self.lock_for(name);
		let _guard = lock.lock().await;
		let mut state = self.state(name).await?;
		let elapsed = state.time_since_opened().unwrap_or(Duration::MAX);

		match state.state {
			BreakerState::Closed => return Ok(Admission::Normal),
			BreakerState::Open if elapsed < config.reset_timeout() => {
				debug!(circuit = name, "circuit open, rejecting call");
				return Err(BreakerError::Open {
					name: name.to_string(),
					retry_after: Some(config.reset_timeout() - elapsed),
				});
			},
			BreakerState::Open => {
				info!(circuit = name, "circuit half-open, allowing trial call");
				state.half_open();
			},
			// A trial slot held longer than the reset timeout belongs to a call
			// that never reported back
			BreakerState::HalfOpen
				if state.trials_in_flight >= config.half_open_max_calls.max(1)
					&& elapsed < config.reset_timeout() =>
			{
				debug!(circuit = name, "half-open trial limit reached, rejecting call");
				return Err(BreakerError::Open {
					name: name.to_string(),
					retry_after: None,
				});
			},
			BreakerState::HalfOpen if state.trials_in_flight >= config.half_open_max_calls.max(1) => {
				warn!(circuit = name, "reclaiming stale half-open trial slots");
				state.trials_in_flight = 0;
			},
			BreakerState::HalfOpen => {},
		}
		state.trials_in_flight += 1;
		self.store.save_circuit_state(name, &state).await?;
		Ok(Admission::Trial)
	}

	async fn release_trial(&self, name: &str) -> Result<(), StoreError> {
		let lock = self.lock_for(name);
		let _guard = lock.lock().await;
		let mut state = self.state(name).await?;
		if state.state != BreakerState::HalfOpen || state.trials_in_flight == 0 {
			return Ok(());
		}
		state.trials_in_flight -= 1;
		self.store.save_circuit_state(name, &state).await
	}

	async fn on_success(
		&self,
		name: &str,
		config: &BreakerConfig,
		admission: Admission,
	) -> Result<(), StoreError> {
		let lock = self.lock_for(name);
		let _guard = lock.lock().await;
		let mut state = self.state(name).await?;
		match state.state {
			// Only trial calls count toward closing the circuit
			BreakerState::HalfOpen if admission == Admission::Normal => return Ok(()),
			BreakerState::HalfOpen => {
				state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
				state.success_count += 1;
				if state.success_count >= config.success_threshold {
					info!(circuit = name, "circuit closed");
					state.close();
				}
			},
			// A sibling call opened the circuit meanwhile
			BreakerState::Open => return Ok(()),
			// No write needed when nothing changed
			BreakerState::Closed if state.failure_count == 0 => return Ok(()),
			BreakerState::Closed => state.failure_count = 0,
		}
		self.store.save_circuit_state(name, &state).await
	}

	async fn on_failure(&self, name: &str, config: &BreakerConfig) -> Result<(), StoreError> {
		let lock = self.lock_for(name);
		let _guard = lock.lock().await;
		let mut state = self.state(name).await?;
		match state.state {
			BreakerState::HalfOpen => {
				warn!(circuit = name, "trial call failed, circuit re-opened");
				state.open();
			},
			BreakerState::Open => return Ok(()),
			BreakerState::Closed => {
				state.failure_count += 1;
				if state.failure_count >= config.failure_threshold {
					warn!(
						circuit = name,
						failures = state.failure_count,
						"failure threshold reached, circuit opened"
					);
					state.open();
				}
			},
		}
		self.store.save_circuit_state(name, &state).await
	}
}

/// Breakers for every tool, keyed by tool name.
pub struct CircuitBreakerRegistry {
	breaker: CircuitBreaker,
	defaults: BreakerConfig,
	overrides: HashMap<String, BreakerConfig>,
}

impl CircuitBreakerRegistry {
	pub fn new(store: Arc<dyn CircuitStore>, defaults: BreakerConfig) -> Self {
		Self {
			breaker: CircuitBreaker::new(store),
			defaults,
			overrides: HashMap::new(),
		}
	}

	pub fn in_memory(defaults: BreakerConfig) -> Self {
		Self::new(Arc::new(InMemoryCircuitStore::new()), defaults)
	}

	/// Use different thresholds for one tool.
	pub fn with_override(mut self, tool_name: impl Into<String>, config: BreakerConfig) -> Self {
		self.overrides.insert(tool_name.into(), config);
		self
	}

	pub fn config_for(&self, tool_name: &str) -> &BreakerConfig {
		self.overrides.get(tool_name).unwrap_or(&self.defaults)
	}

	pub async fn call<F, T, E>(
		&self,
		tool_name: &str,
		timeout: Duration,
		operation: F,
	) -> Result<T, BreakerError<E>>
	where
		F: Future<Output = Result<T, E>>,
		E: FailureCategory,
	{
		let config = self.config_for(tool_name);
		self
			.breaker
			.call(tool_name, config, timeout, operation)
			.await
	}

	pub async fn state(&self, tool_name: &str) -> Result<CircuitState, StoreError> {
		self.breaker.state(tool_name).await
	}
}

//! Idempotency of step execution.
//!
//! A successful step run is recorded under a key derived from the execution
//! id, the step's index and its id. A redelivered "run this step" trigger for
//! the same key short-circuits to the recorded output instead of invoking the
//! tool a second time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stateful::{StateStore, StateStoreExt, StoreError};

/// Stable identity of one step within one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
	pub execution_id: String,
	pub step_index: usize,
	pub step_id: String,
}

impl IdempotencyKey {
	pub fn new(execution_id: impl Into<String>, step_index: usize, step_id: impl Into<String>) -> Self {
		Self {
			execution_id: execution_id.into(),
			step_index,
			step_id: step_id.into(),
		}
	}
}

impl fmt::Display for IdempotencyKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"idempotency:{}:{}:{}",
			self.execution_id, self.step_index, self.step_id
		)
	}
}

/// Stored record of a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
	pub output: Value,
	pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait IdempotencyService: Send + Sync {
	async fn is_duplicate(&self, key: &IdempotencyKey) -> Result<bool, StoreError>;

	/// Record a successful run. The first recorded output wins.
	async fn mark_complete(&self, key: &IdempotencyKey, output: &Value) -> Result<(), StoreError>;

	async fn completion(&self, key: &IdempotencyKey) -> Result<Option<CompletionRecord>, StoreError>;
}

/// [`IdempotencyService`] on top of a key-value [`StateStore`].
pub struct StoreIdempotencyService<S: StateStore + ?Sized> {
	store: Arc<S>,
	ttl: Duration,
}

impl<S: StateStore + ?Sized> StoreIdempotencyService<S> {
	pub fn new(store: Arc<S>, ttl: Duration) -> Self {
		Self { store, ttl }
	}
}

#[async_trait]
impl<S: StateStore + ?Sized> IdempotencyService for StoreIdempotencyService<S> {
	async fn is_duplicate(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
		self.store.exists(&key.to_string()).await
	}

	async fn mark_complete(&self, key: &IdempotencyKey, output: &Value) -> Result<(), StoreError> {
		let record = CompletionRecord {
			output: output.clone(),
			completed_at: Utc::now(),
		};
		let bytes =
			serde_json::to_vec(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
		let written = self
			.store
			.set_if_absent(&key.to_string(), bytes, Some(self.ttl))
			.await?;
		if !written {
			tracing::debug!(key = %key, "step already marked complete");
		}
		Ok(())
	}

	async fn completion(&self, key: &IdempotencyKey) -> Result<Option<CompletionRecord>, StoreError> {
		self.store.get_json(&key.to_string()).await
	}
}

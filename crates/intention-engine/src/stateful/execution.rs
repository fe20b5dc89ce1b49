//! Persistence of execution state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::store::{StateStore, StateStoreExt, StoreError};
use crate::state::ExecutionState;

/// Persistence collaborator for [`ExecutionState`].
#[async_trait]
pub trait ExecutionStore: Send + Sync {
	async fn save_execution_state(&self, state: &ExecutionState) -> Result<(), StoreError>;

	async fn get_execution_state(
		&self,
		execution_id: &str,
	) -> Result<Option<ExecutionState>, StoreError>;
}

/// [`ExecutionStore`] backed by any key-value [`StateStore`].
pub struct KvExecutionStore<S: StateStore + ?Sized> {
	store: Arc<S>,
	ttl: Option<Duration>,
}

impl<S: StateStore + ?Sized> KvExecutionStore<S> {
	pub fn new(store: Arc<S>) -> Self {
		Self { store, ttl: None }
	}

	/// Expire persisted executions after `ttl`.
	pub fn with_ttl(mut self, ttl: Duration) -> Self {
		self.ttl = Some(ttl);
		self
	}

	fn key(execution_id: &str) -> String {
		format!("execution:{execution_id}")
	}
}

#[async_trait]
impl<S: StateStore + ?Sized> ExecutionStore for KvExecutionStore<S> {
	async fn save_execution_state(&self, state: &ExecutionState) -> Result<(), StoreError> {
		self
			.store
			.set_json(&Self::key(&state.execution_id), state, self.ttl)
			.await
	}

	async fn get_execution_state(
		&self,
		execution_id: &str,
	) -> Result<Option<ExecutionState>, StoreError> {
		self.store.get_json(&Self::key(execution_id)).await
	}
}

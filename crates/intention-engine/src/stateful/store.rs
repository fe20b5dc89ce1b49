use std::time::Duration;

use async_trait::async_trait;

/// Error type for state store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
	#[error("key not found")]
	NotFound,
	#[error("serialization error: {0}")]
	Serialization(String),
	#[error("storage error: {0}")]
	Storage(String),
}

/// Async key-value storage with TTL support.
///
/// Execution persistence, idempotency records and circuit state all sit on
/// top of this trait, so a single backend can serve every stateful concern.
#[async_trait]
pub trait StateStore: Send + Sync {
	/// Get a value by key.
	///
	/// Returns `Ok(None)` if the key doesn't exist or has expired.
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

	/// Set a value. `None` means the value never expires.
	async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

	/// Delete a key. Succeeds whether or not the key existed.
	async fn delete(&self, key: &str) -> Result<(), StoreError>;

	/// Check if a key exists and hasn't expired.
	async fn exists(&self, key: &str) -> Result<bool, StoreError> {
		Ok(self.get(key).await?.is_some())
	}

	/// Write only when the key is absent. Returns `true` when this call wrote
	/// the value. Backends with an atomic primitive should override this.
	async fn set_if_absent(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<bool, StoreError> {
		if self.exists(key).await? {
			return Ok(false);
		}
		self.set(key, value, ttl).await?;
		Ok(true)
	}
}

/// JSON helpers for any [`StateStore`].
#[async_trait]
pub trait StateStoreExt: StateStore {
	async fn get_json<T: serde::de::DeserializeOwned + Send>(
		&self,
		key: &str,
	) -> Result<Option<T>, StoreError> {
		match self.get(key).await? {
			Some(bytes) => serde_json::from_slice(&bytes)
				.map(Some)
				.map_err(|e| StoreError::Serialization(e.to_string())),
			None => Ok(None),
		}
	}

	async fn set_json<T: serde::Serialize + Send + Sync>(
		&self,
		key: &str,
		value: &T,
		ttl: Option<Duration>,
	) -> Result<(), StoreError> {
		let bytes =
			serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
		self.set(key, bytes, ttl).await
	}
}

impl<T: StateStore + ?Sized> StateStoreExt for T {}

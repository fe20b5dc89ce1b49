//! In-memory implementation of StateStore.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::store::{StateStore, StoreError};

struct MemoryEntry {
	value: Vec<u8>,
	expires_at: Option<Instant>,
}

impl MemoryEntry {
	fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
		Self {
			value,
			expires_at: ttl.map(|d| Instant::now() + d),
		}
	}

	fn is_expired(&self) -> bool {
		self.expires_at.is_some_and(|exp| Instant::now() > exp)
	}
}

/// In-memory [`StateStore`] for tests and single-instance deployments.
///
/// State does not survive the process, so resumption across invocations
/// needs a shared backend.
#[derive(Default)]
pub struct MemoryStore {
	data: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn clear(&self) {
		self.data.lock().clear();
	}

	/// Number of entries, including expired ones not yet evicted.
	pub fn len(&self) -> usize {
		self.data.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.lock().is_empty()
	}
}

#[async_trait]
impl StateStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		let mut data = self.data.lock();
		if let Some(entry) = data.get(key) {
			if entry.is_expired() {
				data.remove(key);
				return Ok(None);
			}
			return Ok(Some(entry.value.clone()));
		}
		Ok(None)
	}

	async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
		self
			.data
			.lock()
			.insert(key.to_string(), MemoryEntry::new(value, ttl));
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		self.data.lock().remove(key);
		Ok(())
	}

	async fn set_if_absent(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<bool, StoreError> {
		let mut data = self.data.lock();
		if let Some(entry) = data.get(key)
			&& !entry.is_expired()
		{
			return Ok(false);
		}
		data.insert(key.to_string(), MemoryEntry::new(value, ttl));
		Ok(true)
	}
}

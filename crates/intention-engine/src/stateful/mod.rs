//! Stateful storage for the engine.
//!
//! A small async key-value abstraction with TTLs, plus the execution
//! persistence built on it.

mod execution;
mod memory;
mod store;

pub use execution::{ExecutionStore, KvExecutionStore};
pub use memory::MemoryStore;
pub use store::{StateStore, StateStoreExt, StoreError};

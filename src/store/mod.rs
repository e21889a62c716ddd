//! Shared store access.
//!
//! The queue and the rate-limit log live entirely in a shared store. Every
//! component receives the store as an injected [`SharedStore`], so tests can
//! swap Redis for [`MemoryStore`] and simulate contention or outages.

mod backend;
mod memory;
mod redis_store;

pub use backend::{Attempt, LogEntry, LogSnapshot, LogWrite, SharedStore, StoreError};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub(crate) use redis_store::connection_info;

//! chainpipe-storage: backends for the [`TaskStore`](chainpipe_core::TaskStore)
//! persistence facade.
//!
//! Backends:
//! - [`memory`]: in-process (dev/testing, no persistence)
//! - `redis`: Redis via a multiplexed async connection

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "redis")]
pub use self::redis::{RedisStore, RedisStoreConfig};

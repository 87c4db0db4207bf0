//! Shared-tier store implementations.

pub mod memory;
pub mod noop;
#[cfg(feature = "cache-redis")]
pub mod redis;

pub use memory::MemoryStore;
pub use noop::NoOpStore;
#[cfg(feature = "cache-redis")]
pub use redis::RedisStore;

//! Storage implementations.

pub mod kv;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use kv::KvProvider;

#[cfg(feature = "memory")]
pub use memory::MemoryKv;

#[cfg(feature = "redis")]
pub use self::redis::RedisKv;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteProvider;

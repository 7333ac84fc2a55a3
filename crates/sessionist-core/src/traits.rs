//! Core traits for session backends and the storage they sit on.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{SessionId, SessionStore};

/// Key/value data held by one session.
pub type SessionData = HashMap<String, Value>;

/// Storage client error.
///
/// `NotFound` is kept apart from every other failure so callers can treat a
/// missing key as an ordinary outcome.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Storage error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Wrap any displayable storage failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    /// Whether this error only reports an absent key.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Session backend error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Backend initialization failed: {0}")]
    BackendInit(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session record is corrupt: {0}")]
    Record(#[from] serde_json::Error),
    #[error("Failed to generate session id: {0}")]
    IdGeneration(String),
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => Self::NotFound(SessionId::new(key)),
            StorageError::Backend(msg) => Self::Backend(msg),
        }
    }
}

/// Primitive operations a key-value store exposes to session backends.
#[async_trait]
pub trait KvClient: Send + Sync + 'static {
    /// Fetch the value stored under `key`.
    ///
    /// Returns `StorageError::NotFound` if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `value` under `key` without an expiry.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Store `value` under `key` and expire it after `ttl`.
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StorageError> {
        self.set(key, value).await?;
        self.expire(key, ttl).await
    }

    /// Delete `key`. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Set the time-to-live of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError>;

    /// Return one page of keys matching `pattern`, starting at `cursor`.
    ///
    /// The returned cursor is `0` once enumeration is complete.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StorageError>;

    /// Drop expired entries. Stores with native expiry leave this as a no-op.
    async fn sweep(&self) -> Result<usize, StorageError> {
        Ok(0)
    }
}

/// Persists the serialized data of a released session.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Write `record` for `id`, replacing any previous record, with `ttl` as
    /// its lifetime.
    async fn write_record(
        &self,
        id: &SessionId,
        record: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), SessionError>;
}

/// Trait for session backends.
///
/// One implementation exists per storage technology. The manager holds a
/// single instance, chosen at startup.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name the backend is registered under.
    fn name(&self) -> &'static str;

    /// Load the session for `id`.
    ///
    /// A session without a stored record comes back empty rather than as
    /// an error.
    async fn read(&self, id: &SessionId) -> Result<SessionStore, SessionError>;

    /// Check whether a live record exists for `id`.
    async fn exist(&self, id: &SessionId) -> Result<bool, SessionError>;

    /// Move the data stored under `old` to `new`.
    ///
    /// If `old` has no record, an empty record is created under `new`.
    async fn regenerate(&self, old: &SessionId, new: &SessionId)
    -> Result<SessionStore, SessionError>;

    /// Delete the record for `id`. Absent records are not an error.
    async fn destroy(&self, id: &SessionId) -> Result<(), SessionError>;

    /// Count live sessions.
    async fn all(&self) -> Result<usize, SessionError>;

    /// Remove expired sessions.
    async fn gc(&self) -> Result<(), SessionError>;
}

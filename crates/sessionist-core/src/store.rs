//! Live, lock-guarded view of one session's data.

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{RecordWriter, SessionData, SessionError, SessionId};

/// Decode a stored record into session data.
///
/// An empty record decodes to an empty map.
///
/// # Errors
/// Returns error if the record is not a serialized data map.
pub fn decode_record(record: &[u8]) -> Result<SessionData, SessionError> {
    if record.is_empty() {
        return Ok(SessionData::new());
    }
    Ok(serde_json::from_slice(record)?)
}

/// Encode session data into its stored form.
///
/// # Errors
/// Returns error if a value cannot be serialized.
pub fn encode_record(data: &SessionData) -> Result<Vec<u8>, SessionError> {
    Ok(serde_json::to_vec(data)?)
}

/// Session data for one identifier.
///
/// Reads share the lock, writes take it exclusively. Mutations stay in memory
/// until [`SessionStore::release`] hands them back to the backend that created
/// the store.
pub struct SessionStore {
    id: SessionId,
    max_age: Duration,
    data: RwLock<SessionData>,
    writer: Arc<dyn RecordWriter>,
}

impl SessionStore {
    /// Create a store bound to the backend writer that will persist it.
    #[must_use]
    pub fn new(
        id: SessionId,
        data: SessionData,
        max_age: Duration,
        writer: Arc<dyn RecordWriter>,
    ) -> Self {
        Self {
            id,
            max_age,
            data: RwLock::new(data),
            writer,
        }
    }

    // A panic while holding the lock cannot leave the map half-updated.
    fn read_data(&self) -> RwLockReadGuard<'_, SessionData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_data(&self) -> RwLockWriteGuard<'_, SessionData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Lifetime applied to the record on release.
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Get a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read_data().get(key).cloned()
    }

    /// Get a value deserialized into `T`.
    ///
    /// Returns `None` if the key is unset or holds a value of another shape.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        serde_json::from_value(value).ok()
    }

    /// Set a value, replacing any previous one.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write_data().insert(key.into(), value.into());
    }

    /// Delete a value. Absent keys are ignored.
    pub fn delete(&self, key: &str) {
        self.write_data().remove(key);
    }

    /// Remove every value, keeping the identifier and lifetime.
    pub fn flush(&self) {
        self.write_data().clear();
    }

    /// Whether `key` is set.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.read_data().contains_key(key)
    }

    /// Number of values held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_data().len()
    }

    /// Whether the session holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_data().is_empty()
    }

    /// Copy of the current data.
    #[must_use]
    pub fn snapshot(&self) -> SessionData {
        self.read_data().clone()
    }

    /// Persist the current data through the owning backend.
    ///
    /// The record is encoded under a single lock acquisition, so the write
    /// carries exactly the state observed at that moment.
    ///
    /// # Errors
    /// Returns error if encoding or the backend write fails.
    pub async fn persist(&self) -> Result<(), SessionError> {
        let record = {
            let data = self.read_data();
            encode_record(&data)?
        };
        self.writer.write_record(&self.id, record, self.max_age).await
    }

    /// Persist the session, logging instead of returning failures.
    ///
    /// Must be called before the store is dropped or mutations are lost.
    pub async fn release(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to persist session on release");
        } else {
            tracing::trace!(session_id = %self.id, "Session released");
        }
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("id", &self.id)
            .field("max_age", &self.max_age)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

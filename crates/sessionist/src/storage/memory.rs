//! In-memory key-value client.

use std::{
    collections::HashMap,
    sync::{
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use sessionist_core::{KvClient, StorageError};
use tokio::time::Instant;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    /// Insertion order, fixed for the life of the key. Scan cursors resume
    /// after it.
    seq: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Match `text` against a glob `pattern` with `*` and `?` wildcards.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// In-memory key-value client.
///
/// Useful for development, tests and single-process deployments.
/// Data is lost on restart. Expiry follows the tokio clock, so paused test
/// runtimes can fast-forward it.
///
/// `scan` walks keys in insertion order, so a key that stays live for a
/// whole scan is returned exactly once even while other keys come and go.
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
    next_seq: AtomicU64,
}

impl MemoryKv {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Number of live keys.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StorageError> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .values()
            .filter(|entry| entry.is_live(now))
            .count())
    }

    fn insert(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StorageError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        if let Some(entry) = entries.get_mut(key) {
            entry.value = value;
            entry.expires_at = expires_at;
        } else {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at,
                    seq,
                },
            );
        }
        Ok(())
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let now = Instant::now();
        self.entries
            .read()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.insert(key, value, None)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StorageError> {
        self.insert(key, value, Some(ttl))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries
            .write()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let entry = entries
            .get_mut(key)
            .filter(|entry| entry.is_live(now))
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        entry.expires_at = Some(now + ttl);

        Ok(())
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StorageError> {
        let now = Instant::now();
        let entries = self
            .entries
            .read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // Cursor 0 starts the scan; otherwise it is the first sequence number
        // not yet returned.
        let mut keys: Vec<(u64, &String)> = entries
            .iter()
            .filter(|(key, entry)| {
                entry.seq >= cursor
                    && entry.is_live(now)
                    && glob_match(pattern.as_bytes(), key.as_bytes())
            })
            .map(|(key, entry)| (entry.seq, key))
            .collect();
        keys.sort_unstable();

        let count = count.max(1);
        let next = if keys.len() > count {
            keys[count - 1].0 + 1
        } else {
            0
        };
        let page = keys
            .into_iter()
            .take(count)
            .map(|(_, key)| key.clone())
            .collect();

        Ok((next, page))
    }

    async fn sweep(&self) -> Result<usize, StorageError> {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));

        Ok(before - entries.len())
    }
}

//! Session backend over a key-value store.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use sessionist_core::{
    KvClient, Provider, RecordWriter, SessionData, SessionError, SessionId, SessionStore,
    StorageError, store::decode_record,
};

use crate::ProviderSettings;

/// Prefix placed in front of every session key.
pub const DEFAULT_KEY_PREFIX: &str = "sessionist:";

/// Keys requested per `SCAN` page.
pub const DEFAULT_SCAN_COUNT: usize = 1000;

struct KvWriter<C> {
    client: Arc<C>,
    prefix: String,
}

#[async_trait]
impl<C: KvClient> RecordWriter for KvWriter<C> {
    async fn write_record(
        &self,
        id: &SessionId,
        record: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let key = format!("{}{id}", self.prefix);
        self.client.set_ex(&key, record, ttl).await?;
        Ok(())
    }
}

/// Backend storing one serialized record per session under
/// `"{prefix}{session_id}"`, with the session lifetime as key expiry.
pub struct KvProvider<C: KvClient> {
    name: &'static str,
    client: Arc<C>,
    writer: Arc<KvWriter<C>>,
    prefix: String,
    scan_count: usize,
    max_age: Duration,
}

impl<C: KvClient> KvProvider<C> {
    /// Create a backend over `client`.
    #[must_use]
    pub fn new(name: &'static str, client: Arc<C>, max_age: Duration) -> Self {
        Self::with_options(name, client, max_age, DEFAULT_KEY_PREFIX, DEFAULT_SCAN_COUNT)
    }

    fn with_options(
        name: &'static str,
        client: Arc<C>,
        max_age: Duration,
        prefix: &str,
        scan_count: usize,
    ) -> Self {
        let writer = Arc::new(KvWriter {
            client: Arc::clone(&client),
            prefix: prefix.to_string(),
        });
        Self {
            name,
            client,
            writer,
            prefix: prefix.to_string(),
            scan_count,
            max_age,
        }
    }

    /// Bind to the client carried in `settings`.
    ///
    /// Reads the optional `prefix` and `scan_count` parameters.
    ///
    /// # Errors
    /// Returns error if the client is missing, is not a `C`, or a parameter
    /// is invalid.
    pub fn initiate(name: &'static str, settings: &ProviderSettings) -> Result<Self, SessionError> {
        let client = settings.client::<C>()?;
        let prefix = settings.param("prefix").unwrap_or(DEFAULT_KEY_PREFIX);
        let scan_count = settings
            .positive_param("scan_count")?
            .unwrap_or(DEFAULT_SCAN_COUNT);
        tracing::debug!(provider = name, prefix, scan_count, "Key-value session backend ready");
        Ok(Self::with_options(name, client, settings.max_age, prefix, scan_count))
    }

    /// Underlying client.
    #[must_use]
    pub const fn client(&self) -> &Arc<C> {
        &self.client
    }

    fn key(&self, id: &SessionId) -> String {
        format!("{}{id}", self.prefix)
    }

    fn store(&self, id: SessionId, data: SessionData) -> SessionStore {
        let writer: Arc<dyn RecordWriter> = Arc::clone(&self.writer) as Arc<dyn RecordWriter>;
        SessionStore::new(id, data, self.max_age, writer)
    }

    async fn fetch(&self, id: &SessionId) -> Result<Option<Vec<u8>>, SessionError> {
        match self.client.get(&self.key(id)).await {
            Ok(record) => Ok(Some(record)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<C: KvClient> Provider for KvProvider<C> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn read(&self, id: &SessionId) -> Result<SessionStore, SessionError> {
        let data = match self.fetch(id).await? {
            Some(record) => decode_record(&record)?,
            None => SessionData::new(),
        };
        Ok(self.store(id.clone(), data))
    }

    async fn exist(&self, id: &SessionId) -> Result<bool, SessionError> {
        Ok(self.fetch(id).await?.is_some())
    }

    async fn regenerate(
        &self,
        old: &SessionId,
        new: &SessionId,
    ) -> Result<SessionStore, SessionError> {
        let new_key = self.key(new);
        let Some(record) = self.fetch(old).await? else {
            self.client.set_ex(&new_key, Vec::new(), self.max_age).await?;
            return Ok(self.store(new.clone(), SessionData::new()));
        };

        let data = decode_record(&record)?;
        self.client.set_ex(&new_key, record, self.max_age).await?;
        if old != new {
            self.client.delete(&self.key(old)).await?;
        }
        tracing::debug!(provider = self.name, old = %old, new = %new, "Session record moved");
        Ok(self.store(new.clone(), data))
    }

    async fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        self.client.delete(&self.key(id)).await?;
        Ok(())
    }

    async fn all(&self) -> Result<usize, SessionError> {
        let pattern = format!("{}*", self.prefix);
        let mut cursor = 0;
        let mut total = 0;
        loop {
            let (next, keys) = self.client.scan(cursor, &pattern, self.scan_count).await?;
            total += keys.len();
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(total)
    }

    async fn gc(&self) -> Result<(), SessionError> {
        let removed = self.client.sweep().await?;
        if removed > 0 {
            tracing::debug!(provider = self.name, removed, "Expired sessions swept");
        }
        Ok(())
    }
}

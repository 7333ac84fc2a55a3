//! Redis/Valkey key-value client.

use std::time::Duration;

use ::redis::{Cmd, FromRedisValue, aio::MultiplexedConnection};
use async_trait::async_trait;
use sessionist_core::{KvClient, StorageError};
use tokio::sync::Mutex;

/// Key-value client over a Redis-compatible server.
///
/// Opens one multiplexed connection lazily and shares it between callers. A
/// failed command drops the connection and is retried once on a fresh one.
pub struct RedisKv {
    client: ::redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv").finish_non_exhaustive()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisKv {
    /// Create a client for `url` (`redis://host:port/db`).
    ///
    /// # Errors
    /// Returns error if the URL cannot be parsed.
    pub fn open(url: &str) -> Result<Self, StorageError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| StorageError::Backend(format!("invalid redis url {url}: {e}")))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StorageError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect to redis: {e}")))?;
        tracing::debug!("Redis session connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn run<T, F>(&self, operation: &'static str, build: F) -> Result<T, StorageError>
    where
        T: FromRedisValue + Send,
        F: Fn() -> Cmd + Send + Sync,
    {
        let mut last_err = None;
        for attempt in 0..2 {
            let mut conn = self.connection().await?;
            let cmd = build();
            let result: ::redis::RedisResult<T> = cmd.query_async(&mut conn).await;
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(operation, attempt = attempt + 1, "Redis command succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        "Redis command failed; reconnecting"
                    );
                    *self.connection.lock().await = None;
                    last_err = Some(err);
                }
            }
        }
        Err(StorageError::Backend(format!(
            "redis {operation} failed: {}",
            last_err.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
        )))
    }
}

#[async_trait]
impl KvClient for RedisKv {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let value: Option<Vec<u8>> = self
            .run("get", || {
                let mut cmd = ::redis::cmd("GET");
                cmd.arg(key);
                cmd
            })
            .await?;
        value.ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.run::<(), _>("set", || {
            let mut cmd = ::redis::cmd("SET");
            cmd.arg(key).arg(&value);
            cmd
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StorageError> {
        let secs = ttl_secs(ttl);
        self.run::<(), _>("set_ex", || {
            let mut cmd = ::redis::cmd("SET");
            cmd.arg(key).arg(&value).arg("EX").arg(secs);
            cmd
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.run::<i64, _>("delete", || {
            let mut cmd = ::redis::cmd("DEL");
            cmd.arg(key);
            cmd
        })
        .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        let secs = ttl_secs(ttl);
        let updated = self
            .run::<i64, _>("expire", || {
                let mut cmd = ::redis::cmd("EXPIRE");
                cmd.arg(key).arg(secs);
                cmd
            })
            .await?;
        if updated == 0 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StorageError> {
        self.run::<(u64, Vec<String>), _>("scan", || {
            let mut cmd = ::redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count.max(1));
            cmd
        })
        .await
    }
}

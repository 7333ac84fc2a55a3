//! SQLite session backend.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use sessionist_core::{
    Provider, RecordWriter, SessionData, SessionError, SessionId, SessionStore,
    store::decode_record,
};
use sqlx::SqlitePool;

use crate::ProviderSettings;

/// Table used when no `table` parameter is given.
pub const DEFAULT_TABLE: &str = "session";

/// Rows fetched per page when counting sessions.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn expiry_after(ttl: Duration) -> i64 {
    unix_now().saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
}

fn db_err(err: sqlx::Error) -> SessionError {
    SessionError::Backend(err.to_string())
}

/// Table names are spliced into SQL, so only plain identifiers are accepted.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 64
}

/// SQL text for one table.
struct Statements {
    create_table: String,
    create_index: String,
    select: String,
    exists: String,
    upsert: String,
    delete: String,
    first_page: String,
    next_page: String,
    purge: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    session_key TEXT PRIMARY KEY NOT NULL,
                    session_data BLOB NOT NULL,
                    session_expiry INTEGER NOT NULL
                )"
            ),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS {table}_expiry ON {table} (session_expiry)"
            ),
            select: format!(
                "SELECT session_data FROM {table} WHERE session_key = ? AND session_expiry > ?"
            ),
            exists: format!(
                "SELECT COUNT(*) FROM {table} WHERE session_key = ? AND session_expiry > ?"
            ),
            upsert: format!(
                "INSERT INTO {table} (session_key, session_data, session_expiry) VALUES (?, ?, ?)
                 ON CONFLICT(session_key) DO UPDATE SET
                    session_data = excluded.session_data,
                    session_expiry = excluded.session_expiry"
            ),
            delete: format!("DELETE FROM {table} WHERE session_key = ?"),
            first_page: format!(
                "SELECT session_key FROM {table} WHERE session_expiry > ?
                 ORDER BY session_key LIMIT ?"
            ),
            next_page: format!(
                "SELECT session_key FROM {table} WHERE session_key > ? AND session_expiry > ?
                 ORDER BY session_key LIMIT ?"
            ),
            purge: format!("DELETE FROM {table} WHERE session_expiry <= ?"),
        }
    }
}

struct SqliteWriter {
    pool: SqlitePool,
    sql: Arc<Statements>,
}

#[async_trait]
impl RecordWriter for SqliteWriter {
    async fn write_record(
        &self,
        id: &SessionId,
        record: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        sqlx::query(&self.sql.upsert)
            .bind(id.as_str())
            .bind(record)
            .bind(expiry_after(ttl))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

/// Backend storing one row per session in a SQLite table.
///
/// `session_expiry` holds the absolute unix time a row stops being visible.
/// Expired rows are ignored by reads and counts until [`Provider::gc`]
/// deletes them.
pub struct SqliteProvider {
    pool: SqlitePool,
    sql: Arc<Statements>,
    writer: Arc<SqliteWriter>,
    page_size: usize,
    max_age: Duration,
}

impl std::fmt::Debug for SqliteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteProvider")
            .field("page_size", &self.page_size)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl SqliteProvider {
    /// Create a backend on the default table, creating it if needed.
    ///
    /// # Errors
    /// Returns error if the table cannot be created.
    pub async fn new(pool: SqlitePool, max_age: Duration) -> Result<Self, SessionError> {
        Self::with_table(pool, max_age, DEFAULT_TABLE, DEFAULT_PAGE_SIZE).await
    }

    /// Create a backend on `table`, creating it if needed.
    ///
    /// # Errors
    /// Returns a configuration error for an invalid table name, or a backend
    /// initialization error if the table cannot be created.
    pub async fn with_table(
        pool: SqlitePool,
        max_age: Duration,
        table: &str,
        page_size: usize,
    ) -> Result<Self, SessionError> {
        if !is_identifier(table) {
            return Err(SessionError::Configuration(format!(
                "invalid session table name {table:?}"
            )));
        }
        let sql = Arc::new(Statements::for_table(table));

        sqlx::query(&sql.create_table)
            .execute(&pool)
            .await
            .map_err(|e| SessionError::BackendInit(format!("failed to create table {table}: {e}")))?;
        sqlx::query(&sql.create_index)
            .execute(&pool)
            .await
            .map_err(|e| SessionError::BackendInit(format!("failed to create index on {table}: {e}")))?;
        tracing::debug!(table, page_size, "SQLite session backend ready");

        let writer = Arc::new(SqliteWriter {
            pool: pool.clone(),
            sql: Arc::clone(&sql),
        });
        Ok(Self {
            pool,
            sql,
            writer,
            page_size: page_size.max(1),
            max_age,
        })
    }

    /// Bind to the `SqlitePool` carried in `settings`.
    ///
    /// Reads the optional `table` and `page_size` parameters.
    ///
    /// # Errors
    /// Returns error if the pool is missing or of the wrong type, a parameter
    /// is invalid, or the table cannot be created.
    pub async fn initiate(settings: &ProviderSettings) -> Result<Self, SessionError> {
        let pool = SqlitePool::clone(&*settings.client::<SqlitePool>()?);
        let table = settings.param("table").unwrap_or(DEFAULT_TABLE);
        let page_size = settings
            .positive_param("page_size")?
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self::with_table(pool, settings.max_age, table, page_size).await
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn store(&self, id: SessionId, data: SessionData) -> SessionStore {
        let writer: Arc<dyn RecordWriter> = Arc::clone(&self.writer) as Arc<dyn RecordWriter>;
        SessionStore::new(id, data, self.max_age, writer)
    }

    fn limit(&self) -> i64 {
        i64::try_from(self.page_size).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn read(&self, id: &SessionId) -> Result<SessionStore, SessionError> {
        let record: Option<Vec<u8>> = sqlx::query_scalar(&self.sql.select)
            .bind(id.as_str())
            .bind(unix_now())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let data = match record {
            Some(record) => decode_record(&record)?,
            None => SessionData::new(),
        };
        Ok(self.store(id.clone(), data))
    }

    async fn exist(&self, id: &SessionId) -> Result<bool, SessionError> {
        let count: i64 = sqlx::query_scalar(&self.sql.exists)
            .bind(id.as_str())
            .bind(unix_now())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count > 0)
    }

    async fn regenerate(
        &self,
        old: &SessionId,
        new: &SessionId,
    ) -> Result<SessionStore, SessionError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let record: Vec<u8> = sqlx::query_scalar(&self.sql.select)
            .bind(old.as_str())
            .bind(unix_now())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .unwrap_or_default();
        let data = decode_record(&record)?;

        sqlx::query(&self.sql.upsert)
            .bind(new.as_str())
            .bind(record)
            .bind(expiry_after(self.max_age))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if old != new {
            sqlx::query(&self.sql.delete)
                .bind(old.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        tracing::debug!(old = %old, new = %new, "Session row moved");
        Ok(self.store(new.clone(), data))
    }

    async fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        sqlx::query(&self.sql.delete)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn all(&self) -> Result<usize, SessionError> {
        let now = unix_now();
        let mut total = 0;
        let mut cursor: Option<String> = None;
        loop {
            let keys: Vec<String> = match cursor.as_deref() {
                None => sqlx::query_scalar(&self.sql.first_page)
                    .bind(now)
                    .bind(self.limit())
                    .fetch_all(&self.pool)
                    .await,
                Some(after) => sqlx::query_scalar(&self.sql.next_page)
                    .bind(after)
                    .bind(now)
                    .bind(self.limit())
                    .fetch_all(&self.pool)
                    .await,
            }
            .map_err(db_err)?;

            total += keys.len();
            if keys.len() < self.page_size {
                break;
            }
            cursor = keys.into_iter().last();
        }
        Ok(total)
    }

    async fn gc(&self) -> Result<(), SessionError> {
        let removed = sqlx::query(&self.sql.purge)
            .bind(unix_now())
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
        if removed > 0 {
            tracing::debug!(removed, "Expired session rows deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use tokio_test::assert_ok;

    use super::*;

    const MAX_AGE: Duration = Duration::from_secs(60);

    async fn pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn insert_raw(pool: &SqlitePool, table: &str, key: &str, expiry: i64) {
        sqlx::query(&format!(
            "INSERT INTO {table} (session_key, session_data, session_expiry) VALUES (?, ?, ?)"
        ))
        .bind(key)
        .bind(b"{}".to_vec())
        .bind(expiry)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn row_count(pool: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM session")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("session"));
        assert!(is_identifier("_web_sessions2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("session; DROP TABLE x"));
        assert!(!is_identifier("a-b"));
    }

    #[tokio::test]
    async fn test_release_then_read() {
        let provider = SqliteProvider::new(pool().await, MAX_AGE).await.unwrap();
        let id = SessionId::new("abc");

        let store = provider.read(&id).await.unwrap();
        assert!(store.is_empty());
        assert!(!provider.exist(&id).await.unwrap());

        store.set("uid", 7);
        store.set("tags", json!(["a", "b"]));
        assert_ok!(store.persist().await);

        assert!(provider.exist(&id).await.unwrap());
        let again = provider.read(&id).await.unwrap();
        assert_eq!(again.get("uid"), Some(json!(7)));
        assert_eq!(again.get("tags"), Some(json!(["a", "b"])));

        // Second release upserts the same row.
        again.set("uid", 8);
        again.release().await;
        assert_eq!(row_count(provider.pool()).await, 1);
        assert_eq!(provider.read(&id).await.unwrap().get("uid"), Some(json!(8)));
    }

    #[tokio::test]
    async fn test_expired_rows_are_hidden_and_collected() {
        let provider = SqliteProvider::new(pool().await, MAX_AGE).await.unwrap();
        insert_raw(provider.pool(), DEFAULT_TABLE, "stale", unix_now() - 10).await;
        insert_raw(provider.pool(), DEFAULT_TABLE, "live", unix_now() + 600).await;

        let stale = SessionId::new("stale");
        assert!(!provider.exist(&stale).await.unwrap());
        assert!(provider.read(&stale).await.unwrap().is_empty());
        assert_eq!(provider.all().await.unwrap(), 1);

        provider.gc().await.unwrap();
        assert_eq!(row_count(provider.pool()).await, 1);
        assert!(provider.exist(&SessionId::new("live")).await.unwrap());
    }

    #[tokio::test]
    async fn test_regenerate() {
        let provider = SqliteProvider::new(pool().await, MAX_AGE).await.unwrap();
        let old = SessionId::new("old");
        let new = SessionId::new("new");
        let store = provider.read(&old).await.unwrap();
        store.set("cart", 3);
        store.release().await;

        let moved = provider.regenerate(&old, &new).await.unwrap();
        assert_eq!(moved.id(), &new);
        assert_eq!(moved.get("cart"), Some(json!(3)));
        assert!(!provider.exist(&old).await.unwrap());
        assert!(provider.exist(&new).await.unwrap());

        let fresh = SessionId::new("fresh");
        let created = provider
            .regenerate(&SessionId::new("ghost"), &fresh)
            .await
            .unwrap();
        assert!(created.is_empty());
        assert!(provider.exist(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let provider = SqliteProvider::new(pool().await, MAX_AGE).await.unwrap();
        let id = SessionId::new("gone");
        provider.read(&id).await.unwrap().release().await;
        assert_ok!(provider.destroy(&id).await);
        assert_ok!(provider.destroy(&id).await);
        assert!(!provider.exist(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_all_pages_through_large_tables() {
        let provider = SqliteProvider::new(pool().await, MAX_AGE).await.unwrap();
        assert_eq!(provider.all().await.unwrap(), 0);

        let expiry = unix_now() + 600;
        for i in 0..2500 {
            insert_raw(provider.pool(), DEFAULT_TABLE, &format!("s{i:05}"), expiry).await;
        }
        assert_eq!(provider.all().await.unwrap(), 2500);
    }

    #[tokio::test]
    async fn test_all_counts_exact_page_multiples() {
        let pool = pool().await;
        let provider = SqliteProvider::with_table(pool, MAX_AGE, "web_sessions", 5)
            .await
            .unwrap();
        let expiry = unix_now() + 600;
        for i in 0..10 {
            insert_raw(provider.pool(), "web_sessions", &format!("k{i}"), expiry).await;
        }
        assert_eq!(provider.all().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_initiate_from_settings() {
        let settings = ProviderSettings::new(MAX_AGE)
            .with_client(Arc::new(pool().await))
            .with_param("table", "app_sessions")
            .with_param("page_size", "50");
        let provider = SqliteProvider::initiate(&settings).await.unwrap();
        assert_eq!(provider.page_size, 50);
        assert_eq!(provider.name(), "sqlite");

        let bad = ProviderSettings::new(MAX_AGE)
            .with_client(Arc::new(pool().await))
            .with_param("table", "x; --");
        assert!(matches!(
            SqliteProvider::initiate(&bad).await,
            Err(SessionError::Configuration(_))
        ));

        let missing = ProviderSettings::new(MAX_AGE);
        assert!(matches!(
            SqliteProvider::initiate(&missing).await,
            Err(SessionError::BackendInit(_))
        ));
    }
}

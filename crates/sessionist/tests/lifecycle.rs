//! End-to-end session lifecycle against every bundled backend that needs no
//! external server.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::json;
use sessionist::{ManagerConfig, ProviderRegistry, SessionManager, Transport};
use sessionist_core::{CookieExpiry, SessionCookie};
use sqlx::sqlite::SqlitePoolOptions;

#[derive(Default)]
struct Exchange {
    cookies: HashMap<String, String>,
    written: Vec<SessionCookie>,
}

impl Exchange {
    fn carrying(id: &str) -> Self {
        let mut exchange = Self::default();
        exchange.cookies.insert("sid".to_string(), id.to_string());
        exchange
    }
}

impl Transport for Exchange {
    fn cookie(&self, name: &str) -> Option<String> {
        self.cookies.get(name).cloned()
    }

    fn query(&self, _name: &str) -> Option<String> {
        None
    }

    fn header(&self, _name: &str) -> Option<String> {
        None
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn set_cookie(&mut self, cookie: SessionCookie) {
        self.written.push(cookie);
    }

    fn set_header(&mut self, _name: &str, _value: &str) {}

    fn remove_header(&mut self, _name: &str) {}
}

async fn managers() -> Vec<SessionManager> {
    let registry = ProviderRegistry::with_defaults();
    let config = |provider: &str| ManagerConfig::new(provider, "sid", Duration::from_secs(600));

    let memory = SessionManager::new(config("memory"), &registry, None)
        .await
        .unwrap();

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let sqlite = SessionManager::new(config("sqlite"), &registry, Some(Arc::new(pool)))
        .await
        .unwrap();

    vec![memory, sqlite]
}

#[tokio::test]
async fn test_full_lifecycle() {
    for manager in managers().await {
        let backend = manager.provider().name();
        assert_eq!(manager.active_count().await.unwrap(), 0, "{backend}");

        let mut login = Exchange::default();
        let store = manager.start(&mut login).await.unwrap();
        store.set("uid", 1);
        store.release().await;
        assert_eq!(manager.active_count().await.unwrap(), 1, "{backend}");

        let mut next = Exchange::carrying(store.id().as_str());
        let resumed = manager.start(&mut next).await.unwrap();
        assert_eq!(resumed.get("uid"), Some(json!(1)), "{backend}");
        assert!(next.written.is_empty(), "{backend}");

        let mut rotate = Exchange::carrying(store.id().as_str());
        let rotated = manager.regenerate_id(&mut rotate).await.unwrap();
        assert_ne!(rotated.id(), store.id(), "{backend}");
        assert_eq!(rotated.get("uid"), Some(json!(1)), "{backend}");
        assert_eq!(manager.active_count().await.unwrap(), 1, "{backend}");

        let mut logout = Exchange::carrying(rotated.id().as_str());
        manager.destroy(&mut logout).await.unwrap();
        assert_eq!(logout.written[0].expiry, CookieExpiry::Expired, "{backend}");
        assert_eq!(manager.active_count().await.unwrap(), 0, "{backend}");
    }
}

#[tokio::test]
async fn test_read_does_not_persist_until_release() {
    for manager in managers().await {
        let backend = manager.provider().name();
        let store = manager.start(&mut Exchange::default()).await.unwrap();
        assert_eq!(manager.active_count().await.unwrap(), 0, "{backend}");

        store.release().await;
        assert_eq!(manager.active_count().await.unwrap(), 1, "{backend}");
    }
}

#[tokio::test]
async fn test_count_spans_many_pages() {
    for manager in managers().await {
        let backend = manager.provider().name();
        for _ in 0..2500 {
            manager
                .start(&mut Exchange::default())
                .await
                .unwrap()
                .release()
                .await;
        }
        assert_eq!(manager.active_count().await.unwrap(), 2500, "{backend}");
    }
}

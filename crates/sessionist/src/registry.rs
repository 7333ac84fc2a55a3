//! Named backend factories.
//!
//! The registry is an explicit value handed to the manager at construction,
//! so tests can register fakes next to the built-in backends.

use std::{any::Any, collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use sessionist_core::{Provider, SessionError};

/// Type-erased reference to an already configured storage client.
pub type ClientHandle = Arc<dyn Any + Send + Sync>;

type ProviderFuture = BoxFuture<'static, Result<Arc<dyn Provider>, SessionError>>;
type Factory = Arc<dyn Fn(ProviderSettings) -> ProviderFuture + Send + Sync>;

/// Inputs handed to a backend factory.
#[derive(Clone)]
pub struct ProviderSettings {
    /// Lifetime applied to stored sessions.
    pub max_age: Duration,
    /// Backend-specific parameters.
    pub params: HashMap<String, String>,
    /// Storage client the backend binds to.
    pub client: Option<ClientHandle>,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("max_age", &self.max_age)
            .field("params", &self.params)
            .field("client", &self.client.is_some())
            .finish()
    }
}

impl ProviderSettings {
    /// Create settings with no parameters and no client.
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            params: HashMap::new(),
            client: None,
        }
    }

    /// Attach the storage client.
    #[must_use]
    pub fn with_client<C: Any + Send + Sync>(mut self, client: Arc<C>) -> Self {
        self.client = Some(client);
        self
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Look up a parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Look up and parse a numeric parameter.
    ///
    /// # Errors
    /// Returns a configuration error if the value is not a positive integer.
    pub fn positive_param(&self, key: &str) -> Result<Option<usize>, SessionError> {
        self.param(key)
            .map(|raw| match raw.trim().parse::<usize>() {
                Ok(value) if value > 0 => Ok(value),
                _ => Err(SessionError::Configuration(format!(
                    "parameter {key} must be a positive integer, got {raw:?}"
                ))),
            })
            .transpose()
    }

    /// Whether a client was supplied.
    #[must_use]
    pub const fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Take the client as a concrete type.
    ///
    /// # Errors
    /// Returns a backend initialization error if no client was supplied or
    /// it is not a `C`.
    pub fn client<C: Any + Send + Sync>(&self) -> Result<Arc<C>, SessionError> {
        let handle = self.client.clone().ok_or_else(|| {
            SessionError::BackendInit(format!(
                "no storage client supplied, expected {}",
                std::any::type_name::<C>()
            ))
        })?;
        handle.downcast::<C>().map_err(|_| {
            SessionError::BackendInit(format!(
                "storage client has the wrong type, expected {}",
                std::any::type_name::<C>()
            ))
        })
    }
}

/// Map from backend name to factory.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, Factory>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every backend compiled into this crate.
    #[must_use]
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "memory")]
        registry.register("memory", |settings: ProviderSettings| async move {
            use crate::storage::{KvProvider, MemoryKv};
            let settings = if settings.has_client() {
                settings
            } else {
                settings.with_client(Arc::new(MemoryKv::new()))
            };
            let provider = KvProvider::<MemoryKv>::initiate("memory", &settings)?;
            Ok::<_, SessionError>(Arc::new(provider) as Arc<dyn Provider>)
        });

        #[cfg(feature = "redis")]
        registry.register("redis", |settings: ProviderSettings| async move {
            use crate::storage::{KvProvider, RedisKv};
            let provider = KvProvider::<RedisKv>::initiate("redis", &settings)?;
            Ok::<_, SessionError>(Arc::new(provider) as Arc<dyn Provider>)
        });

        #[cfg(feature = "sqlite")]
        registry.register("sqlite", |settings: ProviderSettings| async move {
            let provider = crate::storage::SqliteProvider::initiate(&settings).await?;
            Ok::<_, SessionError>(Arc::new(provider) as Arc<dyn Provider>)
        });

        registry
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(ProviderSettings) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Provider>, SessionError>> + Send + 'static,
    {
        let factory: Factory = Arc::new(move |settings| factory(settings).boxed());
        self.factories.insert(name.into(), factory);
    }

    /// Whether a factory is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the backend registered under `name`.
    ///
    /// # Errors
    /// Returns a configuration error for unknown names, or whatever the
    /// factory reports.
    pub async fn initiate(
        &self,
        name: &str,
        settings: ProviderSettings,
    ) -> Result<Arc<dyn Provider>, SessionError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            SessionError::Configuration(format!("unknown session provider {name:?}"))
        })?;
        factory(settings).await
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

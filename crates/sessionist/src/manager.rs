//! Session manager for issuing, resuming and retiring sessions.

use std::{fmt, sync::Arc};

use sessionist_core::{
    CookieExpiry, Provider, SessionCookie, SessionError, SessionId, SessionStore, Transport,
};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};

use crate::{ClientHandle, ManagerConfig, ProviderRegistry, ProviderSettings};

/// Manager operation a lifecycle error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Start,
    Destroy,
    Regenerate,
    Read,
    Count,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Destroy => "destroy",
            Self::Regenerate => "regenerate",
            Self::Read => "read",
            Self::Count => "count",
        })
    }
}

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Session backend initialization failed: {0}")]
    BackendInit(#[source] SessionError),
    #[error("Session {op} failed: {source}")]
    Lifecycle {
        op: Lifecycle,
        #[source]
        source: SessionError,
    },
}

impl ManagerError {
    fn lifecycle(op: Lifecycle) -> impl Fn(SessionError) -> Self + Copy {
        move |source| Self::Lifecycle { op, source }
    }
}

/// Handle to the background garbage collection task.
///
/// Dropping the handle also stops the task, at its next wake-up.
#[derive(Debug)]
pub struct GcHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl GcHandle {
    /// Signal the task to stop and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Session GC task ended abnormally");
        }
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Session manager.
///
/// Binds one backend, chosen at construction, to the identifier transport
/// rules in [`ManagerConfig`]. Cheap to share behind an `Arc`; it holds no
/// per-session state of its own.
pub struct SessionManager {
    config: ManagerConfig,
    provider: Arc<dyn Provider>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl SessionManager {
    /// Validate `config` and build the backend it names from `registry`.
    ///
    /// `client` is the storage client handed to the backend factory, such as
    /// a `RedisKv` or a `SqlitePool`.
    ///
    /// # Errors
    /// Returns a configuration error for invalid settings or an unknown
    /// backend, or a backend initialization error if the factory fails.
    pub async fn new(
        config: ManagerConfig,
        registry: &ProviderRegistry,
        client: Option<ClientHandle>,
    ) -> Result<Self, ManagerError> {
        let config = config.validate()?;

        let settings = ProviderSettings {
            max_age: config.max_lifetime(),
            params: config.provider_params.clone(),
            client,
        };
        let provider = registry
            .initiate(&config.provider, settings)
            .await
            .map_err(|e| match e {
                SessionError::Configuration(msg) => ManagerError::Configuration(msg),
                other => ManagerError::BackendInit(other),
            })?;

        Ok(Self::bind(config, provider))
    }

    /// Validate `config` and use an already built backend.
    ///
    /// # Errors
    /// Returns a configuration error for invalid settings.
    pub fn with_provider(
        config: ManagerConfig,
        provider: Arc<dyn Provider>,
    ) -> Result<Self, ManagerError> {
        Ok(Self::bind(config.validate()?, provider))
    }

    fn bind(config: ManagerConfig, provider: Arc<dyn Provider>) -> Self {
        tracing::info!(
            provider = provider.name(),
            cookie = %config.cookie_name,
            max_lifetime_secs = config.max_lifetime_secs,
            "Session manager ready"
        );
        Self { config, provider }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Active backend.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Resume the session named by the request, or start a new one.
    ///
    /// The identifier is taken from the cookie, then the query string, then
    /// the header, as enabled. An identifier the backend does not know is
    /// discarded and a fresh one is issued on the response.
    ///
    /// # Errors
    /// Returns error if identifier generation or the backend fails.
    pub async fn start<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
    ) -> Result<SessionStore, ManagerError> {
        let wrap = ManagerError::lifecycle(Lifecycle::Start);

        if let Some(id) = self.session_id(transport) {
            match self.provider.exist(&id).await {
                Ok(true) => {
                    tracing::debug!(session_id = %id, "Session resumed");
                    return self.provider.read(&id).await.map_err(wrap);
                }
                Ok(false) => tracing::debug!(session_id = %id, "Unknown session id, issuing a new one"),
                Err(e) => return Err(wrap(e)),
            }
        }

        let id = self.mint().map_err(wrap)?;
        let store = self.provider.read(&id).await.map_err(wrap)?;
        self.write_id(transport, &id);
        tracing::debug!(session_id = %id, "Session started");
        Ok(store)
    }

    /// Destroy the session named by the request and expire its cookie.
    ///
    /// A request without an identifier is left alone.
    ///
    /// # Errors
    /// Returns error if the backend fails.
    pub async fn destroy<T: Transport + ?Sized>(&self, transport: &mut T) -> Result<(), ManagerError> {
        let Some(id) = self.session_id(transport) else {
            return Ok(());
        };

        self.provider
            .destroy(&id)
            .await
            .map_err(ManagerError::lifecycle(Lifecycle::Destroy))?;

        if self.config.enable_sid_in_header {
            transport.remove_header(&self.config.session_name_in_header);
        }

        let cookie = self.cookie(&*transport, String::new(), CookieExpiry::Expired);
        transport.set_cookie(cookie);
        tracing::debug!(session_id = %id, "Session destroyed");
        Ok(())
    }

    /// Move the request's session to a fresh identifier.
    ///
    /// Without an identifier on the request this behaves like starting a new
    /// session.
    ///
    /// # Errors
    /// Returns error if identifier generation or the backend fails.
    pub async fn regenerate_id<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
    ) -> Result<SessionStore, ManagerError> {
        let wrap = ManagerError::lifecycle(Lifecycle::Regenerate);
        let new = self.mint().map_err(wrap)?;

        let store = match self.session_id(transport) {
            Some(old) => {
                let store = self.provider.regenerate(&old, &new).await.map_err(wrap)?;
                tracing::debug!(old = %old, new = %new, "Session id regenerated");
                store
            }
            None => self.provider.read(&new).await.map_err(wrap)?,
        };

        self.write_id(transport, &new);
        Ok(store)
    }

    /// Load a session by identifier, bypassing the transport.
    ///
    /// # Errors
    /// Returns error if the backend fails.
    pub async fn session_store(&self, id: &SessionId) -> Result<SessionStore, ManagerError> {
        self.provider
            .read(id)
            .await
            .map_err(ManagerError::lifecycle(Lifecycle::Read))
    }

    /// Number of live sessions in the backend.
    ///
    /// # Errors
    /// Returns error if the backend fails.
    pub async fn active_count(&self) -> Result<usize, ManagerError> {
        self.provider
            .all()
            .await
            .map_err(ManagerError::lifecycle(Lifecycle::Count))
    }

    /// Spawn the periodic garbage collection task.
    ///
    /// The first sweep runs immediately, then once per configured interval.
    /// Failed sweeps are logged and retried on the next tick.
    #[must_use]
    pub fn spawn_gc(&self) -> GcHandle {
        let provider = Arc::clone(&self.provider);
        let period = self.config.gc_interval();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = provider.gc().await {
                            tracing::warn!(provider = provider.name(), error = %e, "Session GC failed");
                        }
                    }
                }
            }
            tracing::debug!(provider = provider.name(), "Session GC stopped");
        });

        GcHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    fn session_id<T: Transport + ?Sized>(&self, transport: &T) -> Option<SessionId> {
        let name = &self.config.cookie_name;
        let non_empty = |value: &String| !value.is_empty();

        transport
            .cookie(name)
            .filter(non_empty)
            .or_else(|| {
                self.config
                    .enable_sid_in_url_query
                    .then(|| transport.query(name))
                    .flatten()
                    .filter(non_empty)
            })
            .or_else(|| {
                self.config
                    .enable_sid_in_header
                    .then(|| transport.header(&self.config.session_name_in_header))
                    .flatten()
                    .filter(non_empty)
            })
            .map(SessionId::new)
    }

    fn mint(&self) -> Result<SessionId, SessionError> {
        SessionId::generate(
            self.config.session_id_length,
            &self.config.session_id_prefix,
        )
    }

    fn cookie<T: Transport + ?Sized>(
        &self,
        transport: &T,
        value: String,
        expiry: CookieExpiry,
    ) -> SessionCookie {
        SessionCookie {
            name: self.config.cookie_name.clone(),
            value,
            path: "/".to_string(),
            domain: self.config.domain.clone(),
            expiry,
            secure: self.config.secure && transport.is_secure(),
            http_only: self.config.http_only,
            same_site: self.config.same_site,
        }
    }

    fn write_id<T: Transport + ?Sized>(&self, transport: &mut T, id: &SessionId) {
        if self.config.enable_set_cookie {
            let expiry = match self.config.cookie_lifetime_secs {
                0 => CookieExpiry::Session,
                secs => CookieExpiry::Seconds(secs),
            };
            let cookie = self.cookie(&*transport, id.to_string(), expiry);
            transport.set_cookie(cookie);
        }
        if self.config.enable_sid_in_header {
            transport.set_header(&self.config.session_name_in_header, id.as_str());
        }
    }
}

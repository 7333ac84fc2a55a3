//! Demo web server keeping a visit counter and login name per session.
//!
//! Run with: cargo run -p web-server-demo
//!
//! Then visit http://localhost:3000, /login?user=ada, /logout and /active.
//! Set `SESSIONIST_CONFIG` to a JSON file to override the manager settings.
//! The `redis` and `sqlite` providers connect to the `url` entry of
//! `provider_params`, for example `redis://127.0.0.1:6379/0` or
//! `sqlite://sessions.db?mode=rwc`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use sessionist::{
    ClientHandle, ManagerConfig, ManagerError, ProviderRegistry, SessionManager,
    storage::RedisKv,
};
use sessionist_transport::HttpTransport;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type AppState = Arc<SessionManager>;

struct AppError(ManagerError);

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "Session operation failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "session unavailable").into_response()
    }
}

#[derive(Deserialize)]
struct Login {
    user: String,
}

fn load_config() -> anyhow::Result<ManagerConfig> {
    match std::env::var("SESSIONIST_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {path}"))?;
            Ok(ManagerConfig::from_json(&raw)?)
        }
        Err(_) => Ok(ManagerConfig::new("memory", "sessionist.sid", Duration::from_secs(1800))
            .with_gc_interval(Duration::from_secs(60))
            .with_sid_in_header("X-Session-Id")),
    }
}

/// Open the storage client the configured provider needs.
async fn connect_client(config: &ManagerConfig) -> anyhow::Result<Option<ClientHandle>> {
    let url = || {
        config
            .provider_params
            .get("url")
            .map(String::as_str)
            .with_context(|| format!("provider {} needs a `url` parameter", config.provider))
    };

    let client: ClientHandle = match config.provider.as_str() {
        "redis" => Arc::new(RedisKv::open(url()?)?),
        "sqlite" => {
            let pool = sqlx::SqlitePool::connect(url()?)
                .await
                .context("failed to open sqlite database")?;
            Arc::new(pool)
        }
        _ => return Ok(None),
    };
    tracing::info!(provider = %config.provider, "Session storage connected");
    Ok(Some(client))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sessionist=debug".into()),
        )
        .init();

    let config = load_config()?;
    let client = connect_client(&config).await?;
    let sessions = SessionManager::new(config, &ProviderRegistry::with_defaults(), client)
        .await
        .context("failed to build session manager")?;
    let sessions = Arc::new(sessions);
    let gc = sessions.spawn_gc();

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/login", get(login_handler))
        .route("/logout", get(logout_handler))
        .route("/active", get(active_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&sessions));

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gc.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }
}

async fn index_handler(
    State(sessions): State<AppState>,
    mut transport: HttpTransport,
) -> Result<(HttpTransport, String), AppError> {
    let store = sessions.start(&mut transport).await?;
    let visits = store.get_as::<u64>("visits").unwrap_or(0) + 1;
    store.set("visits", visits);
    let user = store
        .get_as::<String>("user")
        .unwrap_or_else(|| "anonymous".to_string());
    store.release().await;

    Ok((transport, format!("Hello {user}, visit #{visits}\n")))
}

async fn login_handler(
    State(sessions): State<AppState>,
    Query(login): Query<Login>,
    mut transport: HttpTransport,
) -> Result<(HttpTransport, String), AppError> {
    // Rotate the id whenever the login changes.
    let store = sessions.regenerate_id(&mut transport).await?;
    store.set("user", login.user.clone());
    store.release().await;

    Ok((transport, format!("Logged in as {}\n", login.user)))
}

async fn logout_handler(
    State(sessions): State<AppState>,
    mut transport: HttpTransport,
) -> Result<(HttpTransport, &'static str), AppError> {
    sessions.destroy(&mut transport).await?;
    Ok((transport, "Logged out\n"))
}

async fn active_handler(
    State(sessions): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let active = sessions.active_count().await?;
    Ok(Json(serde_json::json!({ "active": active })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> ManagerConfig {
        ManagerConfig::new(provider, "sid", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_memory_needs_no_client() {
        assert!(connect_client(&config("memory")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_url_param_is_required() {
        assert!(connect_client(&config("redis")).await.is_err());
        assert!(connect_client(&config("sqlite")).await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_config_builds_manager() {
        let path = std::env::temp_dir().join(format!("web-server-demo-{}.db", std::process::id()));
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let config = config("sqlite").with_provider_param("url", url);
        let client = connect_client(&config).await.unwrap();
        assert!(client.is_some());

        let sessions = SessionManager::new(config, &ProviderRegistry::with_defaults(), client)
            .await
            .unwrap();
        assert_eq!(sessions.active_count().await.unwrap(), 0);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_redis_client_opens_lazily() {
        let config = config("redis").with_provider_param("url", "redis://127.0.0.1:1/0");
        assert!(connect_client(&config).await.unwrap().is_some());
    }
}

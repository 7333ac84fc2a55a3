//! Session manager and storage backends.
//!
//! Provides:
//! - `SessionManager` - Issue, resume, regenerate and destroy sessions
//! - `ManagerConfig` - Cookie, identifier and backend settings
//! - `ProviderRegistry` - Named backend factories
//! - Storage implementations (memory, Redis, SQLite)

pub mod config;
pub mod manager;
pub mod registry;
pub mod storage;

pub use config::ManagerConfig;
pub use manager::{GcHandle, Lifecycle, ManagerError, SessionManager};
pub use registry::{ClientHandle, ProviderRegistry, ProviderSettings};
pub use sessionist_core::{
    SessionData, SessionError, SessionId, SessionStore, TokenCodec, TokenError, Transport,
};

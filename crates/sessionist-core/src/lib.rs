//! Core abstractions for session identity management.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionId` - Random, hex-encoded session identifiers
//! - `SessionStore` - Lock-guarded live view of one session's data
//! - `TokenCodec` - Signed, optionally encrypted, age-bounded tokens
//! - Provider, key-value client and transport traits

pub mod id;
pub mod store;
pub mod token;
pub mod traits;
pub mod transport;

pub use id::SessionId;
pub use store::SessionStore;
pub use token::{TokenCodec, TokenError};
pub use traits::{KvClient, Provider, RecordWriter, SessionData, SessionError, StorageError};
pub use transport::{CookieExpiry, SameSite, SessionCookie, Transport};

//! HTTP transport for the session manager.
//!
//! Provides:
//! - `HttpTransport` - Axum extractor reading the session id from cookies,
//!   query parameters and headers, and writing it back as response parts
//! - `TransportError` - Response headers that could not be encoded

pub mod http;

pub use http::{HttpTransport, TransportError};

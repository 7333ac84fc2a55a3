//! Transport boundary the session manager reads identifiers from and writes
//! them back to.

use serde::{Deserialize, Serialize};

/// `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// How long a written cookie should live on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieExpiry {
    /// No `Max-Age`; the cookie ends with the browser session.
    Session,
    /// Expire after the given number of seconds.
    Seconds(u64),
    /// Expire immediately, removing any stored cookie.
    Expired,
}

/// Session cookie to write onto a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub domain: Option<String>,
    pub expiry: CookieExpiry,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

/// Request/response pair carrying the session identifier.
///
/// Implemented by HTTP adapters; the manager never sees framework types.
pub trait Transport {
    /// Value of the named request cookie.
    fn cookie(&self, name: &str) -> Option<String>;

    /// Value of the named query parameter.
    fn query(&self, name: &str) -> Option<String>;

    /// Value of the named request header.
    fn header(&self, name: &str) -> Option<String>;

    /// Whether the request arrived over HTTPS.
    fn is_secure(&self) -> bool;

    /// Queue a cookie on the response.
    fn set_cookie(&mut self, cookie: SessionCookie);

    /// Set a response header, replacing earlier values.
    fn set_header(&mut self, name: &str, value: &str);

    /// Remove a response header.
    fn remove_header(&mut self, name: &str);
}

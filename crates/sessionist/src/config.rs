//! Session manager configuration.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use sessionist_core::{SameSite, id::DEFAULT_ID_LENGTH};

use crate::ManagerError;

/// Settings the session manager is built from.
///
/// Fixed once the manager exists. Every field has a default so partial
/// documents deserialize; [`ManagerConfig::validate`] rejects the ones that
/// cannot work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Registered name of the storage backend.
    pub provider: String,
    /// Cookie carrying the session identifier.
    pub cookie_name: String,
    /// Lifetime of a stored session, in seconds.
    pub max_lifetime_secs: u64,
    /// Period of the garbage collection task. Zero means `max_lifetime_secs`.
    pub gc_interval_secs: u64,
    /// Cookie `Max-Age`. Zero writes a browser-session cookie.
    pub cookie_lifetime_secs: u64,
    /// Write the session cookie on responses.
    pub enable_set_cookie: bool,
    pub http_only: bool,
    /// Mark cookies `Secure` when the request arrived over HTTPS.
    pub secure: bool,
    pub domain: Option<String>,
    pub same_site: Option<SameSite>,
    /// Random bytes per identifier. Zero means the default length.
    pub session_id_length: usize,
    pub session_id_prefix: String,
    /// Accept the identifier from a query parameter named like the cookie.
    pub enable_sid_in_url_query: bool,
    /// Accept the identifier from, and mirror it to, a header.
    pub enable_sid_in_header: bool,
    pub session_name_in_header: String,
    /// Backend-specific parameters.
    pub provider_params: HashMap<String, String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            cookie_name: String::new(),
            max_lifetime_secs: 0,
            gc_interval_secs: 0,
            cookie_lifetime_secs: 0,
            enable_set_cookie: true,
            http_only: true,
            secure: false,
            domain: None,
            same_site: None,
            session_id_length: DEFAULT_ID_LENGTH,
            session_id_prefix: String::new(),
            enable_sid_in_url_query: false,
            enable_sid_in_header: false,
            session_name_in_header: String::new(),
            provider_params: HashMap::new(),
        }
    }
}

/// Canonical MIME form of a header name (`x-session-id` -> `X-Session-Id`).
fn canonical_header_name(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let mapped = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            mapped
        })
        .collect()
}

impl ManagerConfig {
    /// Create a config with the required fields set.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        cookie_name: impl Into<String>,
        max_lifetime: Duration,
    ) -> Self {
        Self {
            provider: provider.into(),
            cookie_name: cookie_name.into(),
            max_lifetime_secs: max_lifetime.as_secs(),
            ..Self::default()
        }
    }

    /// Parse a config from JSON.
    ///
    /// # Errors
    /// Returns error if the document does not match the config shape.
    pub fn from_json(json: &str) -> Result<Self, ManagerError> {
        serde_json::from_str(json).map_err(|e| ManagerError::Configuration(e.to_string()))
    }

    /// Set the garbage collection period.
    #[must_use]
    pub const fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval_secs = interval.as_secs();
        self
    }

    /// Set the cookie `Max-Age`.
    #[must_use]
    pub const fn with_cookie_lifetime(mut self, lifetime: Duration) -> Self {
        self.cookie_lifetime_secs = lifetime.as_secs();
        self
    }

    /// Set the cookie domain.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Mark cookies `Secure` on HTTPS requests.
    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set the `SameSite` attribute.
    #[must_use]
    pub const fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    /// Set identifier length and prefix.
    #[must_use]
    pub fn with_session_id(mut self, length: usize, prefix: impl Into<String>) -> Self {
        self.session_id_length = length;
        self.session_id_prefix = prefix.into();
        self
    }

    /// Accept the identifier from the query string.
    #[must_use]
    pub const fn with_sid_in_url_query(mut self, enabled: bool) -> Self {
        self.enable_sid_in_url_query = enabled;
        self
    }

    /// Accept and mirror the identifier through the named header.
    #[must_use]
    pub fn with_sid_in_header(mut self, header: impl Into<String>) -> Self {
        self.enable_sid_in_header = true;
        self.session_name_in_header = header.into();
        self
    }

    /// Add a backend parameter.
    #[must_use]
    pub fn with_provider_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.provider_params.insert(key.into(), value.into());
        self
    }

    /// Check required settings and fill derived defaults.
    ///
    /// # Errors
    /// Returns a configuration error naming the first invalid setting.
    pub fn validate(mut self) -> Result<Self, ManagerError> {
        let missing = |what: &str| ManagerError::Configuration(format!("{what} is required"));

        if self.provider.trim().is_empty() {
            return Err(missing("provider"));
        }
        if self.cookie_name.trim().is_empty() {
            return Err(missing("cookie_name"));
        }
        if self.max_lifetime_secs == 0 {
            return Err(missing("max_lifetime_secs"));
        }
        if self.gc_interval_secs == 0 {
            self.gc_interval_secs = self.max_lifetime_secs;
        }
        if self.session_id_length == 0 {
            self.session_id_length = DEFAULT_ID_LENGTH;
        }
        if self.enable_sid_in_header {
            if self.session_name_in_header.is_empty() {
                return Err(missing("session_name_in_header"));
            }
            let canonical = canonical_header_name(&self.session_name_in_header);
            if canonical != self.session_name_in_header {
                return Err(ManagerError::Configuration(format!(
                    "session_name_in_header {:?} is not in canonical form, use {canonical:?}",
                    self.session_name_in_header
                )));
            }
        }
        Ok(self)
    }

    /// Lifetime of a stored session.
    #[must_use]
    pub const fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    /// Garbage collection period.
    #[must_use]
    pub const fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ManagerConfig {
        ManagerConfig::new("memory", "sid", Duration::from_secs(3600))
    }

    #[test]
    fn test_defaults_fill_in() {
        let config = base().validate().unwrap();
        assert_eq!(config.gc_interval(), Duration::from_secs(3600));
        assert_eq!(config.session_id_length, DEFAULT_ID_LENGTH);
        assert!(config.http_only);
        assert!(config.enable_set_cookie);
        assert!(!config.secure);
    }

    #[test]
    fn test_missing_required_settings() {
        for config in [
            ManagerConfig::new("", "sid", Duration::from_secs(60)),
            ManagerConfig::new("memory", " ", Duration::from_secs(60)),
            ManagerConfig::new("memory", "sid", Duration::ZERO),
        ] {
            assert!(matches!(config.validate(), Err(ManagerError::Configuration(_))));
        }
    }

    #[test]
    fn test_header_name_must_be_canonical() {
        assert!(base().with_sid_in_header("X-Session-Id").validate().is_ok());
        assert!(matches!(
            base().with_sid_in_header("x-session-id").validate(),
            Err(ManagerError::Configuration(_))
        ));
        assert!(matches!(
            base().with_sid_in_header("").validate(),
            Err(ManagerError::Configuration(_))
        ));
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("x-session-id"), "X-Session-Id");
        assert_eq!(canonical_header_name("SESSION"), "Session");
    }

    #[test]
    fn test_from_json_partial_document() {
        let config = ManagerConfig::from_json(
            r#"{
                "provider": "sqlite",
                "cookie_name": "app.sid",
                "max_lifetime_secs": 900,
                "same_site": "strict",
                "provider_params": {"table": "web_sessions"}
            }"#,
        )
        .unwrap()
        .validate()
        .unwrap();

        assert_eq!(config.provider, "sqlite");
        assert_eq!(config.same_site, Some(SameSite::Strict));
        assert_eq!(config.gc_interval_secs, 900);
        assert_eq!(config.provider_params["table"], "web_sessions");
    }

    #[test]
    fn test_from_json_rejects_wrong_types() {
        assert!(matches!(
            ManagerConfig::from_json(r#"{"max_lifetime_secs": "soon"}"#),
            Err(ManagerError::Configuration(_))
        ));
    }
}

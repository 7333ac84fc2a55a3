//! Session identifiers.

use std::fmt;

use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};

use crate::SessionError;

/// Number of random bytes behind a generated identifier when none is configured.
pub const DEFAULT_ID_LENGTH: usize = 16;

/// Opaque session identifier.
///
/// Generated identifiers are hex-encoded bytes drawn from the operating
/// system RNG, optionally preceded by a fixed prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an identifier received from a client or a backend.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Mint a fresh identifier from `len` random bytes.
    ///
    /// A `len` of zero falls back to [`DEFAULT_ID_LENGTH`].
    ///
    /// # Errors
    /// Returns error if the system RNG cannot fill the buffer.
    pub fn generate(len: usize, prefix: &str) -> Result<Self, SessionError> {
        let len = if len == 0 { DEFAULT_ID_LENGTH } else { len };
        let mut bytes = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| SessionError::IdGeneration(e.to_string()))?;
        Ok(Self(format!("{prefix}{}", hex::encode(bytes))))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the identifier.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for SessionId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

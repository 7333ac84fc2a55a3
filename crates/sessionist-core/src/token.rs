//! Self-contained session tokens.
//!
//! A token carries a serialized payload together with its issue time and an
//! HMAC-SHA1 tag, so a server can hand session data to the client and later
//! trust it again without keeping any record of its own.
//!
//! Layout before the outer base64 step:
//!
//! ```text
//! timestamp|base64(iv || ciphertext)|mac
//! ```
//!
//! The MAC covers `name|timestamp|blob|`. The name is not transmitted; binding
//! it into the tag stops a token minted for one cookie being replayed as
//! another. Encryption is optional and uses AES in counter mode with a fresh
//! random IV per token (encrypt-then-MAC).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aes::{Aes128, Aes192, Aes256};
use base64::{Engine as _, engine::general_purpose::URL_SAFE as BASE64};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use serde::{Serialize, de::DeserializeOwned};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// AES block size, also the IV length.
const BLOCK_SIZE: usize = 16;

/// Token codec error.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token signature does not match")]
    Authentication,
    #[error("Token has expired")]
    Expired,
    #[error("Token timestamp is in the future")]
    InvalidTimestamp,
    #[error("Token is malformed")]
    Malformed,
    #[error("Token payload cannot be decrypted")]
    Decryption,
    #[error("Failed to encrypt token payload: {0}")]
    Encryption(String),
    #[error("Failed to serialize token payload: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("Failed to deserialize token payload: {0}")]
    Deserialization(#[source] serde_json::Error),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl TokenError {
    /// Whether the error means an inbound token must be ignored.
    ///
    /// Callers should treat every rejection exactly like a missing session and
    /// never tell the client which check failed.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Authentication
                | Self::Expired
                | Self::InvalidTimestamp
                | Self::Malformed
                | Self::Decryption
                | Self::Deserialization(_)
        )
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn apply_keystream(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), TokenError> {
    let invalid = |e: ctr::cipher::InvalidLength| TokenError::InvalidKey(e.to_string());
    match key.len() {
        16 => Aes128Ctr::new_from_slices(key, iv)
            .map_err(invalid)?
            .apply_keystream(buf),
        24 => Aes192Ctr::new_from_slices(key, iv)
            .map_err(invalid)?
            .apply_keystream(buf),
        32 => Aes256Ctr::new_from_slices(key, iv)
            .map_err(invalid)?
            .apply_keystream(buf),
        n => {
            return Err(TokenError::InvalidKey(format!(
                "encryption key must be 16, 24 or 32 bytes, got {n}"
            )));
        }
    }
    Ok(())
}

/// Encoder/decoder for signed, optionally encrypted session tokens.
#[derive(Clone)]
pub struct TokenCodec {
    name: String,
    signing_key: Vec<u8>,
    encryption_key: Option<Vec<u8>>,
    max_lifetime: i64,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("name", &self.name)
            .field("encrypted", &self.encryption_key.is_some())
            .field("max_lifetime", &self.max_lifetime)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Create a codec that signs tokens for `name`.
    ///
    /// # Errors
    /// Returns error if the signing key is empty.
    pub fn new(
        name: impl Into<String>,
        signing_key: impl Into<Vec<u8>>,
        max_lifetime: Duration,
    ) -> Result<Self, TokenError> {
        let signing_key = signing_key.into();
        if signing_key.is_empty() {
            return Err(TokenError::InvalidKey("signing key is empty".to_string()));
        }
        Ok(Self {
            name: name.into(),
            signing_key,
            encryption_key: None,
            max_lifetime: i64::try_from(max_lifetime.as_secs()).unwrap_or(i64::MAX),
        })
    }

    /// Encrypt payloads with AES-CTR under `key` (16, 24 or 32 bytes).
    ///
    /// # Errors
    /// Returns error if the key length does not select an AES variant.
    pub fn with_encryption_key(mut self, key: impl Into<Vec<u8>>) -> Result<Self, TokenError> {
        let key = key.into();
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(TokenError::InvalidKey(format!(
                "encryption key must be 16, 24 or 32 bytes, got {}",
                key.len()
            )));
        }
        self.encryption_key = Some(key);
        Ok(self)
    }

    /// Name bound into every tag.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether payloads are encrypted.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.encryption_key.is_some()
    }

    /// Encode `payload` stamped with the current time.
    ///
    /// # Errors
    /// Returns error if serialization or encryption fails.
    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T) -> Result<String, TokenError> {
        self.encode_at(payload, unix_now())
    }

    /// Encode `payload` stamped with `issued_at` (unix seconds, UTC).
    ///
    /// # Errors
    /// Returns error if serialization or encryption fails.
    pub fn encode_at<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        issued_at: i64,
    ) -> Result<String, TokenError> {
        let plain = serde_json::to_vec(payload).map_err(TokenError::Serialization)?;
        let blob = match &self.encryption_key {
            Some(key) => Self::encrypt(key, plain)?,
            None => plain,
        };
        self.sign(issued_at, &BASE64.encode(blob))
    }

    /// Decode and verify a token against the current time.
    ///
    /// # Errors
    /// Returns error if the token is malformed, forged, expired, dated in the
    /// future, or does not decrypt and deserialize into `T`.
    pub fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T, TokenError> {
        self.decode_at(token, unix_now())
    }

    /// Decode and verify a token as of `now` (unix seconds, UTC).
    ///
    /// # Errors
    /// See [`TokenCodec::decode`].
    pub fn decode_at<T: DeserializeOwned>(&self, token: &str, now: i64) -> Result<T, TokenError> {
        let raw = BASE64
            .decode(token.as_bytes())
            .map_err(|_| TokenError::Malformed)?;

        let mut parts = raw.splitn(3, |b| *b == b'|');
        let (Some(timestamp), Some(blob), Some(tag)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let signed = &raw[..raw.len() - tag.len()];
        let expected = self.mac(signed)?;
        if !bool::from(expected.as_slice().ct_eq(tag)) {
            return Err(TokenError::Authentication);
        }

        let issued_at = std::str::from_utf8(timestamp)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(TokenError::Malformed)?;
        if now.saturating_sub(issued_at) > self.max_lifetime {
            return Err(TokenError::Expired);
        }
        if issued_at > now {
            return Err(TokenError::InvalidTimestamp);
        }

        let blob = BASE64.decode(blob).map_err(|_| TokenError::Malformed)?;
        let plain = match &self.encryption_key {
            Some(key) => Self::decrypt(key, blob)?,
            None => blob,
        };
        serde_json::from_slice(&plain).map_err(TokenError::Deserialization)
    }

    /// Decode a token, mapping every rejection to `None`.
    #[must_use]
    pub fn open<T: DeserializeOwned>(&self, token: &str) -> Option<T> {
        match self.decode(token) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::debug!(name = %self.name, error = %e, "Rejected session token");
                None
            }
        }
    }

    fn mac(&self, signed: &[u8]) -> Result<Vec<u8>, TokenError> {
        let mut mac = HmacSha1::new_from_slice(&self.signing_key)
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        mac.update(self.name.as_bytes());
        mac.update(b"|");
        mac.update(signed);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn sign(&self, issued_at: i64, encoded_blob: &str) -> Result<String, TokenError> {
        let mut body = format!("{issued_at}|{encoded_blob}|").into_bytes();
        let tag = self.mac(&body)?;
        body.extend_from_slice(&tag);
        Ok(BASE64.encode(body))
    }

    fn encrypt(key: &[u8], plain: Vec<u8>) -> Result<Vec<u8>, TokenError> {
        let mut out = vec![0u8; BLOCK_SIZE];
        OsRng
            .try_fill_bytes(&mut out)
            .map_err(|e| TokenError::Encryption(e.to_string()))?;
        out.extend_from_slice(&plain);
        let (iv, body) = out.split_at_mut(BLOCK_SIZE);
        apply_keystream(key, iv, body)?;
        Ok(out)
    }

    fn decrypt(key: &[u8], mut blob: Vec<u8>) -> Result<Vec<u8>, TokenError> {
        if blob.len() < BLOCK_SIZE {
            return Err(TokenError::Decryption);
        }
        let (iv, body) = blob.split_at_mut(BLOCK_SIZE);
        apply_keystream(key, iv, body)?;
        Ok(blob.split_off(BLOCK_SIZE))
    }
}

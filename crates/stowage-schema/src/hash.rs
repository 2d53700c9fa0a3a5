//! Digest newtypes recorded in manifests and file lists.

use serde::{Deserialize, Deserializer, Serialize};

use crate::SchemaError;

/// A validated SHA-256 digest (64 lowercase hex characters).
///
/// Validation happens at construction and at deserialization time, so a
/// manifest carrying a malformed digest fails to load instead of failing
/// later during verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Create a new `Sha256Digest`, validating the input.
    ///
    /// Accepts strings with or without a `sha256:` prefix and normalizes
    /// the hex to lowercase.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidDigest`] if the hex portion is not
    /// exactly 64 ASCII hex characters.
    pub fn new(s: impl Into<String>) -> Result<Self, SchemaError> {
        let s = s.into();
        let hex = s.strip_prefix("sha256:").unwrap_or(&s);

        if hex.len() != 64 {
            return Err(SchemaError::InvalidDigest(format!(
                "expected 64 hex characters, got {} in '{s}'",
                hex.len()
            )));
        }

        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SchemaError::InvalidDigest(format!(
                "non-hex characters in '{s}'"
            )));
        }

        Ok(Self(hex.to_lowercase()))
    }

    /// Build a digest from the raw 32 output bytes of a SHA-256 hasher.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Get the digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Sha256Digest {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.strip_prefix("sha256:").unwrap_or(other))
    }
}

/// BLAKE3 digest stored next to SHA-256 in the checksum map.
///
/// SHA-256 stays the digest that gates deploys; BLAKE3 is recorded as an
/// additional fingerprint that is cheap to recompute on large archives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blake3Hash(String);

impl Blake3Hash {
    /// Wrap a hex string without validation.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Compute the BLAKE3 hash of an in-memory buffer.
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    /// Finish an incremental hasher.
    pub fn from_hasher(hasher: &blake3::Hasher) -> Self {
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Return the inner hex string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Blake3Hash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

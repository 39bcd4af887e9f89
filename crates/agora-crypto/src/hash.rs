//! BLAKE3 content hashes
//!
//! Every content-addressed identifier in Agora is a 256-bit BLAKE3 digest.
//! Hashes compare bytewise and serialize as hex.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CryptoError;

/// Fixed-width content hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hash([u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash data using BLAKE3 (256-bit output)
    pub fn digest(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hash multiple items together
    pub fn concat(items: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for item in items {
            hasher.update(item);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Deterministic hash of `prefix || base`, used for marker values such
    /// as the new block of a proposal that failed to process
    pub fn with_prefix(prefix: &str, base: &Hash) -> Self {
        Self::concat(&[prefix.as_bytes(), base.bytes()])
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let v = hex::decode(s).map_err(|e| CryptoError::InvalidHash(e.to_string()))?;
        let arr: [u8; 32] = v
            .try_into()
            .map_err(|v: Vec<u8>| CryptoError::InvalidHash(format!("wrong length, {}", v.len())))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}..)", &self.to_hex()[..12])
    }
}

impl FromStr for Hash {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, CryptoError> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for Hash {
    type Error = CryptoError;

    fn try_from(s: String) -> Result<Self, CryptoError> {
        Self::from_hex(&s)
    }
}

impl From<Hash> for String {
    fn from(h: Hash) -> String {
        h.to_hex()
    }
}

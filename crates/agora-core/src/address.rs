//! Node addresses
//!
//! An address is `<body>:<type-hint>`. The body starts and ends with an
//! ASCII alphanumeric and may contain `_` and `-` in between.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AgoraError, Result};

/// Type hint of plain string addresses
pub const STRING_ADDRESS_HINT: &str = "sa-v0.0.1";

/// Opaque node identifier; ordered by byte comparison
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Address with the default string hint
    pub fn new(body: &str) -> Result<Self> {
        Self::with_hint(body, STRING_ADDRESS_HINT)
    }

    pub fn with_hint(body: &str, hint: &str) -> Result<Self> {
        let a = Self(format!("{}:{}", body.trim(), hint.trim()));
        a.is_valid()?;
        Ok(a)
    }

    pub fn is_valid(&self) -> Result<()> {
        let (body, hint) = self
            .0
            .rsplit_once(':')
            .ok_or_else(|| AgoraError::invalid(format!("address without type hint, {:?}", self.0)))?;

        if !is_valid_body(body) {
            return Err(AgoraError::invalid(format!("invalid address body, {:?}", body)));
        }
        if hint.is_empty() || hint.chars().any(char::is_whitespace) {
            return Err(AgoraError::invalid(format!("invalid address hint, {:?}", hint)));
        }
        Ok(())
    }

    pub fn body(&self) -> &str {
        self.0.rsplit_once(':').map(|(b, _)| b).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

fn is_valid_body(body: &str) -> bool {
    let chars: Vec<char> = body.chars().collect();
    if chars.len() < 2 {
        return false;
    }
    let edge = |c: &char| c.is_ascii_alphanumeric();
    let inner = |c: &char| c.is_ascii_alphanumeric() || *c == '_' || *c == '-';

    edge(&chars[0]) && edge(&chars[chars.len() - 1]) && chars.iter().all(inner)
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl FromStr for Address {
    type Err = AgoraError;

    fn from_str(s: &str) -> Result<Self> {
        let a = Self(s.trim().to_string());
        a.is_valid()?;
        Ok(a)
    }
}

impl TryFrom<String> for Address {
    type Error = AgoraError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> String {
        a.0
    }
}

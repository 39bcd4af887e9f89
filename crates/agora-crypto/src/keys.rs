//! Key management for Agora
//!
//! Keys are ed25519. Their canonical string form is
//! `<base58 key bytes>-<type hint>:<version>`, for example
//! `4pNp3...Kq-mpu:v0.0.1`.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash as StdHash, Hasher};
use std::str::FromStr;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};

pub const PRIVATE_KEY_HINT: &str = "mpr";
pub const PUBLIC_KEY_HINT: &str = "mpu";
pub const KEY_VERSION: &str = "v0.0.1";

fn parse_key_string(s: &str, expected_hint: &str) -> CryptoResult<Vec<u8>> {
    let (body, tail) = s
        .trim()
        .rsplit_once('-')
        .ok_or_else(|| CryptoError::InvalidKey(format!("no type hint, {:?}", s)))?;
    let (hint, version) = tail
        .split_once(':')
        .ok_or_else(|| CryptoError::InvalidKey(format!("no key version, {:?}", s)))?;

    if hint != expected_hint {
        return Err(CryptoError::UnknownKeyHint(hint.to_string()));
    }
    if version != KEY_VERSION {
        return Err(CryptoError::InvalidKey(format!("unsupported version, {:?}", version)));
    }

    bs58::decode(body)
        .into_vec()
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn to_array(v: Vec<u8>) -> CryptoResult<[u8; 32]> {
    v.try_into()
        .map_err(|v: Vec<u8>| CryptoError::InvalidKey(format!("wrong key length, {}", v.len())))
}

/// Node signing key
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let key = Self::from_seed(&seed);
        seed.zeroize();
        key
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: self.key.verifying_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.key.sign(message).to_bytes().to_vec())
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for PrivateKey {}

impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = bs58::encode(self.key.to_bytes()).into_string();
        write!(f, "{}-{}:{}", body, PRIVATE_KEY_HINT, KEY_VERSION)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(public={})", self.public_key())
    }
}

impl FromStr for PrivateKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> CryptoResult<Self> {
        let mut bytes = to_array(parse_key_string(s, PRIVATE_KEY_HINT)?)?;
        let key = Self::from_seed(&bytes);
        bytes.zeroize();
        Ok(key)
    }
}

/// Node verification key
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey {
    key: VerifyingKey,
}

impl PublicKey {
    pub fn bytes(&self) -> &[u8] {
        self.key.as_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let raw: [u8; 64] = signature
            .0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidSignatureLength(signature.0.len()))?;
        let sig = ed25519_dalek::Signature::from_bytes(&raw);

        self.key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.as_bytes() == other.key.as_bytes()
    }
}

impl Eq for PublicKey {}

impl StdHash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.as_bytes().hash(state);
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = bs58::encode(self.key.as_bytes()).into_string();
        write!(f, "{}-{}:{}", body, PUBLIC_KEY_HINT, KEY_VERSION)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> CryptoResult<Self> {
        let bytes = to_array(parse_key_string(s, PUBLIC_KEY_HINT)?)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }
}

impl TryFrom<String> for PublicKey {
    type Error = CryptoError;

    fn try_from(s: String) -> CryptoResult<Self> {
        s.parse()
    }
}

impl From<PublicKey> for String {
    fn from(k: PublicKey) -> String {
        k.to_string()
    }
}

/// Opaque signature bytes
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(b: Vec<u8>) -> Self {
        Self(b)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.to_string();
        write!(f, "Signature({}..)", &s[..s.len().min(10)])
    }
}

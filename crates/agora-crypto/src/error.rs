//! Cryptographic error types

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unknown key type hint: {0}")]
    UnknownKeyHint(String),

    #[error("invalid signature length: {0}")]
    InvalidSignatureLength(usize),

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("invalid hash: {0}")]
    InvalidHash(String),
}

impl From<CryptoError> for agora_core::AgoraError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::VerificationFailed => {
                agora_core::AgoraError::SignatureVerificationFailed(e.to_string())
            }
            other => agora_core::AgoraError::Invalid(other.to_string()),
        }
    }
}

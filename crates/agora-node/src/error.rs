//! Node error types

use agora_consensus::ConsensusError;
use agora_core::AgoraError;
use agora_crypto::CryptoError;
use thiserror::Error;

pub type NodeResult<T> = std::result::Result<T, NodeError>;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to serialize config: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("logging already initialized: {0}")]
    Logging(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<AgoraError> for NodeError {
    fn from(e: AgoraError) -> Self {
        NodeError::Consensus(e.into())
    }
}

impl NodeError {
    pub fn invalid_config(msg: impl std::fmt::Display) -> Self {
        NodeError::InvalidConfig(msg.to_string())
    }
}

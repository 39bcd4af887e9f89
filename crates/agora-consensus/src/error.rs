//! Consensus error types

use agora_core::AgoraError;
use agora_crypto::CryptoError;
use thiserror::Error;

use crate::states::StateSwitchContext;

pub type ConsensusResult<T> = std::result::Result<T, ConsensusError>;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error(transparent)]
    Core(#[from] AgoraError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Request to move the state machine; handlers return it instead of
    /// switching themselves
    #[error("switch state requested: {0}")]
    SwitchState(Box<StateSwitchContext>),

    #[error("timer {id}: {reason}")]
    Timer { id: String, reason: String },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Operator request to start or end a handover refused in the current
    /// situation
    #[error("handover rejected: {0}")]
    HandoverRejected(String),
}

impl ConsensusError {
    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        AgoraError::invalid(msg).into()
    }

    pub fn ignore(msg: impl std::fmt::Display) -> Self {
        AgoraError::ignore(msg).into()
    }

    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        AgoraError::not_found(msg).into()
    }

    pub fn switch(sctx: StateSwitchContext) -> Self {
        ConsensusError::SwitchState(Box::new(sctx))
    }

    pub fn core(&self) -> Option<&AgoraError> {
        match self {
            ConsensusError::Core(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_ignore(&self) -> bool {
        self.core().map(AgoraError::is_ignore).unwrap_or(false)
    }

    pub fn is_stop_timer(&self) -> bool {
        self.core().map(AgoraError::is_stop_timer).unwrap_or(false)
    }

    pub fn is_not_found(&self) -> bool {
        self.core().map(AgoraError::is_not_found).unwrap_or(false)
    }

    pub fn is_duplicated(&self) -> bool {
        self.core().map(AgoraError::is_duplicated).unwrap_or(false)
    }

    pub fn is_connection(&self) -> bool {
        self.core().map(AgoraError::is_connection).unwrap_or(false)
    }

    pub fn is_sync_by_voteproof(&self) -> bool {
        self.core().map(AgoraError::is_sync_by_voteproof).unwrap_or(false)
    }

    pub fn is_known_seal(&self) -> bool {
        matches!(self.core(), Some(AgoraError::KnownSeal(_)))
    }

    pub fn is_daemon_already_stopped(&self) -> bool {
        matches!(self.core(), Some(AgoraError::DaemonAlreadyStopped))
    }

    pub fn handover_rejected(msg: impl std::fmt::Display) -> Self {
        ConsensusError::HandoverRejected(msg.to_string())
    }

    pub fn is_handover_rejected(&self) -> bool {
        matches!(self, ConsensusError::HandoverRejected(_))
    }

    pub fn into_switch_context(self) -> Result<StateSwitchContext, ConsensusError> {
        match self {
            ConsensusError::SwitchState(sctx) => Ok(*sctx),
            other => Err(other),
        }
    }
}

impl From<bincode::Error> for ConsensusError {
    fn from(e: bincode::Error) -> Self {
        ConsensusError::Encoding(e.to_string())
    }
}

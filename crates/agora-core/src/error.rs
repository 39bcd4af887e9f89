//! Error types for Agora core operations

use thiserror::Error;

/// Result type alias for Agora operations
pub type Result<T> = std::result::Result<T, AgoraError>;

/// Errors shared by the consensus core and its collaborators.
///
/// Several kinds are control signals rather than failures: `StopTimer`,
/// `Ignore`, `Duplicated` and `DaemonAlreadyStopped` are swallowed by the
/// callers that expect them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgoraError {
    /// Data failed a structural or semantic validity check
    #[error("invalid: {0}")]
    Invalid(String),

    /// Lookup miss
    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotent insertion of something already stored
    #[error("duplicated: {0}")]
    Duplicated(String),

    /// Seal already known to the local database
    #[error("known seal: {0}")]
    KnownSeal(String),

    /// Signature does not verify
    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    /// Voteproof shows the local node is behind
    #[error("sync by voteproof: {0}")]
    SyncByVoteproof(String),

    /// Clean stop of a timer
    #[error("stop timer")]
    StopTimer,

    /// Non-fatal condition, dropped by the watcher
    #[error("ignore: {0}")]
    Ignore(String),

    /// Stop requested on something already stopped
    #[error("daemon already stopped")]
    DaemonAlreadyStopped,

    /// Last voteproof is too old while in consensus
    #[error("consensus looks stuck: {0}")]
    ConsensusStuck(String),

    /// Transient I/O failure; callers may retry
    #[error("connection error: {0}")]
    Connection(String),
}

impl AgoraError {
    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        AgoraError::Invalid(msg.to_string())
    }

    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        AgoraError::NotFound(msg.to_string())
    }

    pub fn ignore(msg: impl std::fmt::Display) -> Self {
        AgoraError::Ignore(msg.to_string())
    }

    /// Get error code for API responses
    pub fn code(&self) -> u32 {
        match self {
            AgoraError::Invalid(_) => 1001,
            AgoraError::NotFound(_) => 1002,
            AgoraError::Duplicated(_) => 1003,
            AgoraError::KnownSeal(_) => 1004,
            AgoraError::SignatureVerificationFailed(_) => 2001,
            AgoraError::SyncByVoteproof(_) => 3001,
            AgoraError::ConsensusStuck(_) => 3002,
            AgoraError::StopTimer => 4001,
            AgoraError::Ignore(_) => 4002,
            AgoraError::DaemonAlreadyStopped => 4003,
            AgoraError::Connection(_) => 5001,
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgoraError::Connection(_)
                | AgoraError::NotFound(_)
                | AgoraError::Duplicated(_)
                | AgoraError::KnownSeal(_)
                | AgoraError::Ignore(_)
                | AgoraError::StopTimer
                | AgoraError::DaemonAlreadyStopped
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AgoraError::NotFound(_))
    }

    pub fn is_duplicated(&self) -> bool {
        matches!(self, AgoraError::Duplicated(_))
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self, AgoraError::Ignore(_))
    }

    pub fn is_stop_timer(&self) -> bool {
        matches!(self, AgoraError::StopTimer)
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, AgoraError::Connection(_))
    }

    pub fn is_sync_by_voteproof(&self) -> bool {
        matches!(self, AgoraError::SyncByVoteproof(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_signals_are_recoverable() {
        assert!(AgoraError::StopTimer.is_recoverable());
        assert!(AgoraError::ignore("old ballot").is_recoverable());
        assert!(!AgoraError::invalid("bad fact").is_recoverable());
        assert!(!AgoraError::SyncByVoteproof("behind".into()).is_recoverable());
    }

    #[test]
    fn test_error_codes_unique() {
        let errors = [
            AgoraError::invalid("a"),
            AgoraError::not_found("a"),
            AgoraError::Duplicated("a".into()),
            AgoraError::KnownSeal("a".into()),
            AgoraError::SignatureVerificationFailed("a".into()),
            AgoraError::SyncByVoteproof("a".into()),
            AgoraError::StopTimer,
            AgoraError::ignore("a"),
            AgoraError::DaemonAlreadyStopped,
            AgoraError::ConsensusStuck("a".into()),
            AgoraError::Connection("a".into()),
        ];
        let mut codes: Vec<u32> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}

//! Local consensus policy
//!
//! Durations are stored as milliseconds so the policy reads naturally from
//! TOML and environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use agora_core::{AgoraError, NetworkId, Result, ThresholdRatio};

pub const MIN_NETWORK_CONNECTION_TIMEOUT_MS: u64 = 1_000;

/// Per-node consensus parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalPolicy {
    /// Network namespace mixed into every signature
    #[serde(default = "default_network_id")]
    pub network_id: NetworkId,

    /// Percentage of acting suffrage needed for a majority
    #[serde(default = "default_threshold_ratio")]
    pub threshold_ratio: f64,

    #[serde(default = "default_number_of_acting")]
    pub number_of_acting_suffrage_nodes: usize,

    #[serde(default = "default_max_operations")]
    pub max_operations_in_seal: usize,

    #[serde(default = "default_max_operations")]
    pub max_operations_in_proposal: usize,

    #[serde(default = "default_timeout_waiting_proposal_ms")]
    pub timeout_waiting_proposal_ms: u64,

    #[serde(default = "default_interval_ms")]
    pub interval_broadcasting_init_ballot_ms: u64,

    #[serde(default = "default_interval_ms")]
    pub interval_broadcasting_proposal_ms: u64,

    #[serde(default = "default_interval_ms")]
    pub wait_broadcasting_accept_ballot_ms: u64,

    #[serde(default = "default_interval_ms")]
    pub interval_broadcasting_accept_ballot_ms: u64,

    /// Accepted clock skew of an incoming ballot's `signed_at`
    #[serde(default = "default_timespan_valid_ballot_ms")]
    pub timespan_valid_ballot_ms: u64,

    #[serde(default = "default_network_connection_timeout_ms")]
    pub network_connection_timeout_ms: u64,

    #[serde(default = "default_keep_verify_ms")]
    pub interval_keep_verify_duplicated_node_ms: u64,

    #[serde(default = "default_max_failed_keep_verify")]
    pub max_failed_count_keep_verify_duplicated_node: u32,

    #[serde(default = "default_interval_ms")]
    pub interval_ping_handover_ms: u64,

    /// Wait in syncing for a fresh voteproof before rejoining
    #[serde(default = "default_wait_voteproof_after_sync_ms")]
    pub wait_voteproof_after_sync_ms: u64,
}

fn default_network_id() -> NetworkId {
    NetworkId::new("agora").unwrap_or_else(|_| unreachable!("static network id is valid"))
}

fn default_threshold_ratio() -> f64 {
    100.0
}

fn default_number_of_acting() -> usize {
    1
}

fn default_max_operations() -> usize {
    100
}

fn default_timeout_waiting_proposal_ms() -> u64 {
    5_000
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_timespan_valid_ballot_ms() -> u64 {
    60_000
}

fn default_network_connection_timeout_ms() -> u64 {
    3_000
}

fn default_keep_verify_ms() -> u64 {
    2_000
}

fn default_max_failed_keep_verify() -> u32 {
    3
}

fn default_wait_voteproof_after_sync_ms() -> u64 {
    10_000
}

impl Default for LocalPolicy {
    fn default() -> Self {
        Self {
            network_id: default_network_id(),
            threshold_ratio: default_threshold_ratio(),
            number_of_acting_suffrage_nodes: default_number_of_acting(),
            max_operations_in_seal: default_max_operations(),
            max_operations_in_proposal: default_max_operations(),
            timeout_waiting_proposal_ms: default_timeout_waiting_proposal_ms(),
            interval_broadcasting_init_ballot_ms: default_interval_ms(),
            interval_broadcasting_proposal_ms: default_interval_ms(),
            wait_broadcasting_accept_ballot_ms: default_interval_ms(),
            interval_broadcasting_accept_ballot_ms: default_interval_ms(),
            timespan_valid_ballot_ms: default_timespan_valid_ballot_ms(),
            network_connection_timeout_ms: default_network_connection_timeout_ms(),
            interval_keep_verify_duplicated_node_ms: default_keep_verify_ms(),
            max_failed_count_keep_verify_duplicated_node: default_max_failed_keep_verify(),
            interval_ping_handover_ms: default_interval_ms(),
            wait_voteproof_after_sync_ms: default_wait_voteproof_after_sync_ms(),
        }
    }
}

impl LocalPolicy {
    pub fn with_network_id(mut self, network_id: NetworkId) -> Self {
        self.network_id = network_id;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.network_id.is_valid()?;
        ThresholdRatio::new(self.threshold_ratio)?;

        if self.number_of_acting_suffrage_nodes < 1 {
            return Err(AgoraError::invalid("number of acting suffrage nodes should be over 0"));
        }
        if self.max_operations_in_seal < 1 || self.max_operations_in_proposal < 1 {
            return Err(AgoraError::invalid("max operations should be over 0"));
        }

        let durations = [
            ("timeout_waiting_proposal", self.timeout_waiting_proposal_ms),
            ("interval_broadcasting_init_ballot", self.interval_broadcasting_init_ballot_ms),
            ("interval_broadcasting_proposal", self.interval_broadcasting_proposal_ms),
            ("interval_broadcasting_accept_ballot", self.interval_broadcasting_accept_ballot_ms),
            ("timespan_valid_ballot", self.timespan_valid_ballot_ms),
            ("interval_keep_verify_duplicated_node", self.interval_keep_verify_duplicated_node_ms),
            ("interval_ping_handover", self.interval_ping_handover_ms),
        ];
        for (name, ms) in durations {
            if ms < 1 {
                return Err(AgoraError::invalid(format!("{} should be over 0", name)));
            }
        }

        if self.network_connection_timeout_ms < MIN_NETWORK_CONNECTION_TIMEOUT_MS {
            return Err(AgoraError::invalid(format!(
                "network connection timeout too short; {}ms < {}ms",
                self.network_connection_timeout_ms, MIN_NETWORK_CONNECTION_TIMEOUT_MS
            )));
        }
        Ok(())
    }

    pub fn threshold_ratio(&self) -> ThresholdRatio {
        ThresholdRatio::new(self.threshold_ratio).unwrap_or_default()
    }

    pub fn timeout_waiting_proposal(&self) -> Duration {
        Duration::from_millis(self.timeout_waiting_proposal_ms)
    }

    pub fn interval_broadcasting_init_ballot(&self) -> Duration {
        Duration::from_millis(self.interval_broadcasting_init_ballot_ms)
    }

    pub fn interval_broadcasting_proposal(&self) -> Duration {
        Duration::from_millis(self.interval_broadcasting_proposal_ms)
    }

    pub fn wait_broadcasting_accept_ballot(&self) -> Duration {
        Duration::from_millis(self.wait_broadcasting_accept_ballot_ms)
    }

    pub fn interval_broadcasting_accept_ballot(&self) -> Duration {
        Duration::from_millis(self.interval_broadcasting_accept_ballot_ms)
    }

    pub fn timespan_valid_ballot(&self) -> Duration {
        Duration::from_millis(self.timespan_valid_ballot_ms)
    }

    pub fn network_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.network_connection_timeout_ms)
    }

    pub fn interval_keep_verify_duplicated_node(&self) -> Duration {
        Duration::from_millis(self.interval_keep_verify_duplicated_node_ms)
    }

    pub fn interval_ping_handover(&self) -> Duration {
        Duration::from_millis(self.interval_ping_handover_ms)
    }

    pub fn wait_voteproof_after_sync(&self) -> Duration {
        Duration::from_millis(self.wait_voteproof_after_sync_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = LocalPolicy::default();
        assert!(p.validate().is_ok());
        assert_eq!(p.threshold_ratio, 100.0);
        assert_eq!(p.number_of_acting_suffrage_nodes, 1);
        assert_eq!(p.timeout_waiting_proposal(), Duration::from_secs(5));
        assert_eq!(p.interval_broadcasting_init_ballot(), Duration::from_secs(1));
        assert_eq!(p.timespan_valid_ballot(), Duration::from_secs(60));
        assert_eq!(p.network_connection_timeout(), Duration::from_secs(3));
        assert_eq!(p.max_failed_count_keep_verify_duplicated_node, 3);
    }

    #[test]
    fn test_validate_rejects() {
        let mut p = LocalPolicy::default();
        p.network_connection_timeout_ms = 999;
        assert!(p.validate().is_err());

        let mut p = LocalPolicy::default();
        p.threshold_ratio = 0.0;
        assert!(p.validate().is_err());

        let mut p = LocalPolicy::default();
        p.interval_broadcasting_init_ballot_ms = 0;
        assert!(p.validate().is_err());
    }
}

//! Node configuration types
//!
//! Loaded from a TOML file layered with `AGORA_` environment variables,
//! e.g. `AGORA_NODE__NAME=n1` or `AGORA_POLICY__THRESHOLD_RATIO=67`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use agora_consensus::network::{ConnInfo, RemoteNode};
use agora_consensus::{FixedSuffrage, LocalNode, LocalPolicy, RoundrobinSuffrage, StatesConfig, Suffrage};
use agora_core::{Address, NetworkId};
use agora_crypto::{PrivateKey, PublicKey};

use crate::error::{NodeError, NodeResult};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "AGORA";

/// Complete node configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity of this node
    #[serde(default)]
    pub node: NodeSettings,

    /// Validator set
    #[serde(default)]
    pub suffrage: SuffrageConfig,

    /// Consensus parameters
    #[serde(default)]
    pub policy: LocalPolicy,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Read `path` and the `AGORA_` environment
    pub fn load(path: impl AsRef<Path>) -> NodeResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Toml))
            .add_source(environment())
            .build()?;
        let config: NodeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text, still layered with the environment
    pub fn from_toml(text: &str) -> NodeResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .add_source(environment())
            .build()?;
        let config: NodeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> NodeResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> NodeResult<()> {
        self.node.address()?;
        self.node.network_id()?;
        self.policy().validate()?;

        if self.suffrage.members.is_empty() {
            return Err(NodeError::invalid_config("empty suffrage members"));
        }

        let mut names = HashSet::new();
        for member in &self.suffrage.members {
            member.address()?;
            if !names.insert(member.name.as_str()) {
                return Err(NodeError::invalid_config(format!(
                    "duplicated suffrage member, {}",
                    member.name
                )));
            }
        }

        if let Some(proposer) = &self.suffrage.proposer {
            if !names.contains(proposer.as_str()) {
                return Err(NodeError::invalid_config(format!(
                    "proposer {} is not a suffrage member",
                    proposer
                )));
            }
        }
        Ok(())
    }

    /// Policy with the network id of the node section
    pub fn policy(&self) -> LocalPolicy {
        match self.node.network_id() {
            Ok(nid) => self.policy.clone().with_network_id(nid),
            Err(_) => self.policy.clone(),
        }
    }

    pub fn local_node(&self) -> NodeResult<LocalNode> {
        let key = match &self.node.private_key {
            Some(key) => key.parse::<PrivateKey>()?,
            None => {
                tracing::warn!(node = %self.node.name, "no private key configured; using a fresh one");
                PrivateKey::generate()
            }
        };
        Ok(LocalNode::new(self.node.address()?, key))
    }

    pub fn suffrage(&self) -> NodeResult<Arc<dyn Suffrage>> {
        let members = self
            .suffrage
            .members
            .iter()
            .map(|m| m.address())
            .collect::<NodeResult<Vec<_>>>()?;

        match self.suffrage.kind {
            SuffrageKind::Fixed => {
                let proposer = match &self.suffrage.proposer {
                    Some(name) => Address::new(name)?,
                    None => members
                        .first()
                        .cloned()
                        .ok_or_else(|| NodeError::invalid_config("empty suffrage members"))?,
                };
                Ok(Arc::new(FixedSuffrage::new(proposer, members)))
            }
            SuffrageKind::Roundrobin => Ok(Arc::new(RoundrobinSuffrage::new(
                members,
                self.policy.number_of_acting_suffrage_nodes,
            )?)),
        }
    }

    /// Members other than this node, with their keys and connection
    /// addresses
    pub fn peers(&self) -> NodeResult<Vec<RemoteNode>> {
        let local = self.node.address()?;
        let mut peers = Vec::new();
        for member in &self.suffrage.members {
            let address = member.address()?;
            if address != local {
                peers.push(RemoteNode {
                    address,
                    public_key: member.public_key()?,
                    conn_info: member.conn_info.clone(),
                });
            }
        }
        Ok(peers)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

/// Basic node settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Body of the node address
    #[serde(default = "default_node_name")]
    pub name: String,

    #[serde(default = "default_network_id")]
    pub network_id: String,

    /// Signing key in its string form; a fresh key is used when missing
    #[serde(default)]
    pub private_key: Option<String>,

    #[serde(default = "default_conn_info")]
    pub conn_info: ConnInfo,

    /// Watch for another process running this identity and take over
    #[serde(default)]
    pub handover: bool,

    /// Machine-level intervals
    #[serde(default)]
    pub states: StatesSettings,
}

fn default_node_name() -> String {
    "n0".to_string()
}

fn default_network_id() -> String {
    "agora".to_string()
}

fn default_conn_info() -> ConnInfo {
    "local://n0".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            network_id: default_network_id(),
            private_key: None,
            conn_info: default_conn_info(),
            handover: false,
            states: StatesSettings::default(),
        }
    }
}

impl NodeSettings {
    pub fn address(&self) -> NodeResult<Address> {
        Ok(Address::new(&self.name)?)
    }

    pub fn network_id(&self) -> NodeResult<NetworkId> {
        Ok(NetworkId::new(&self.network_id)?)
    }
}

/// Intervals of the state machine's own loops
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatesSettings {
    #[serde(default = "default_clean_ballotbox_ms")]
    pub clean_ballotbox_interval_ms: u64,

    #[serde(default = "default_stuck_check_ms")]
    pub stuck_check_interval_ms: u64,

    #[serde(default = "default_stuck_endure_ms")]
    pub stuck_endure_ms: u64,
}

fn default_clean_ballotbox_ms() -> u64 {
    10_000
}

fn default_stuck_check_ms() -> u64 {
    3_000
}

fn default_stuck_endure_ms() -> u64 {
    60_000
}

impl Default for StatesSettings {
    fn default() -> Self {
        Self {
            clean_ballotbox_interval_ms: default_clean_ballotbox_ms(),
            stuck_check_interval_ms: default_stuck_check_ms(),
            stuck_endure_ms: default_stuck_endure_ms(),
        }
    }
}

impl StatesSettings {
    pub fn states_config(&self) -> StatesConfig {
        use std::time::Duration;

        StatesConfig {
            clean_ballotbox_interval: Duration::from_millis(self.clean_ballotbox_interval_ms),
            stuck_check_interval: Duration::from_millis(self.stuck_check_interval_ms),
            stuck_endure: Duration::from_millis(self.stuck_endure_ms),
            ..StatesConfig::default()
        }
    }
}

/// How the proposer and the acting set are chosen
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuffrageKind {
    #[default]
    Fixed,
    Roundrobin,
}

/// Validator set configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuffrageConfig {
    #[serde(default)]
    pub kind: SuffrageKind,

    /// Fixed proposer; the first member when missing
    #[serde(default)]
    pub proposer: Option<String>,

    #[serde(default = "default_members")]
    pub members: Vec<MemberConfig>,
}

fn default_members() -> Vec<MemberConfig> {
    vec![MemberConfig {
        name: default_node_name(),
        conn_info: default_conn_info(),
        public_key: None,
    }]
}

impl Default for SuffrageConfig {
    fn default() -> Self {
        Self {
            kind: SuffrageKind::default(),
            proposer: None,
            members: default_members(),
        }
    }
}

/// Suffrage member
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub name: String,
    pub conn_info: ConnInfo,
    /// Key the member signs with; required for every member but this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl MemberConfig {
    pub fn address(&self) -> NodeResult<Address> {
        Ok(Address::new(&self.name)?)
    }

    pub fn public_key(&self) -> NodeResult<PublicKey> {
        match &self.public_key {
            Some(key) => Ok(key.parse::<PublicKey>()?),
            None => Err(NodeError::invalid_config(format!(
                "suffrage member {} has no public key",
                self.name
            ))),
        }
    }
}

/// Output format of the log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Color output of the text format
    #[serde(default = "default_true")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            color: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn member_key(seed: u8) -> String {
        PrivateKey::from_seed(&[seed; 32]).public_key().to_string()
    }

    /// Config of n1 in a three member suffrage
    fn three_nodes() -> String {
        r#"
[node]
name = "n1"
network_id = "test"
conn_info = "local://n1"

[suffrage]
kind = "fixed"
proposer = "n0"

[[suffrage.members]]
name = "n0"
conn_info = "local://n0"
public_key = "__N0__"

[[suffrage.members]]
name = "n1"
conn_info = "local://n1"

[[suffrage.members]]
name = "n2"
conn_info = "local://n2"
public_key = "__N2__"

[policy]
threshold_ratio = 67.0
timeout_waiting_proposal_ms = 2000

[logging]
level = "debug"
format = "json"
"#
        .replace("__N0__", &member_key(1))
        .replace("__N2__", &member_key(3))
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = NodeConfig::default().to_toml().unwrap();
        let config = NodeConfig::from_toml(&text).unwrap();

        assert_eq!(config.node.name, "n0");
        assert_eq!(config.suffrage.members.len(), 1);
        assert_eq!(config.policy.threshold_ratio, 100.0);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(three_nodes().as_bytes()).unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.node.name, "n1");
        assert_eq!(config.policy().network_id, NetworkId::new("test").unwrap());
        assert_eq!(config.policy.timeout_waiting_proposal_ms, 2000);
        // untouched policy fields keep their defaults
        assert_eq!(config.policy.interval_broadcasting_init_ballot_ms, 1000);
        assert_eq!(config.logging.format, LogFormat::Json);

        let peers = config.peers().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].conn_info, "local://n0");
        assert_eq!(peers[0].public_key, PrivateKey::from_seed(&[1u8; 32]).public_key());
    }

    #[test]
    fn test_peer_without_public_key() {
        let text = three_nodes().replace(&format!("public_key = \"{}\"", member_key(3)), "");
        let config = NodeConfig::from_toml(&text).unwrap();

        assert!(matches!(config.peers(), Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn test_suffrage_from_config() {
        let config = NodeConfig::from_toml(&three_nodes()).unwrap();
        let suffrage = config.suffrage().unwrap();

        assert_eq!(suffrage.nodes().len(), 3);
        assert!(suffrage.is_inside(&Address::new("n2").unwrap()));
        let acting = suffrage.acting(agora_core::Height(5), agora_core::Round(3));
        assert_eq!(acting.proposer, Address::new("n0").unwrap());
    }

    #[test]
    fn test_invalid_configs() {
        let dup = three_nodes().replace("name = \"n2\"", "name = \"n0\"");
        assert!(matches!(NodeConfig::from_toml(&dup), Err(NodeError::InvalidConfig(_))));

        let stranger = three_nodes().replace("proposer = \"n0\"", "proposer = \"n9\"");
        assert!(matches!(NodeConfig::from_toml(&stranger), Err(NodeError::InvalidConfig(_))));

        let short_timeout =
            three_nodes().replace("timeout_waiting_proposal_ms = 2000", "network_connection_timeout_ms = 10");
        assert!(NodeConfig::from_toml(&short_timeout).is_err());
    }

    #[test]
    fn test_private_key_from_config() {
        let key = PrivateKey::from_seed(&[7u8; 32]);
        let text = format!("[node]\nname = \"n0\"\nprivate_key = \"{}\"\n", key);

        let config = NodeConfig::from_toml(&text).unwrap();
        let local = config.local_node().unwrap();
        assert_eq!(*local.public_key(), key.public_key());
    }
}

//! # Agora Node
//!
//! Runs the Agora consensus core as a node.
//!
//! - `config` - TOML and environment configuration
//! - `logging` - tracing subscriber setup
//! - `genesis` - the height-0 block of a new network
//! - `memory` - in-memory database and processor pool
//! - `local_network` - in-process channels, discovery and block syncing
//! - `node` - `AgoraNode`, the wiring of a state machine and its peers
//! - `cluster` - several nodes of one network in a single process

pub mod cluster;
pub mod config;
pub mod error;
pub mod genesis;
pub mod local_network;
pub mod logging;
pub mod memory;
pub mod node;

pub use cluster::{ClusterConfig, LocalCluster};
pub use config::{LoggingConfig, NodeConfig};
pub use error::{NodeError, NodeResult};
pub use genesis::{Genesis, GenesisGenerator};
pub use local_network::{LocalChannel, LocalDiscovery, LocalNetwork, LocalSyncers, LocalSyncersFactory};
pub use logging::init_logging;
pub use memory::{MemoryDatabase, MemoryProcessorPool};
pub use node::{AgoraNode, NodeParts};

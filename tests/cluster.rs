//! Integration tests for in-process Agora clusters

use std::collections::HashSet;
use std::time::Duration;

use agora_consensus::Database;
use agora_core::{Height, NetworkId, NodeState};
use agora_node::{ClusterConfig, LocalCluster, NodeConfig, NodeParts};

const WAIT: Duration = Duration::from_secs(60);

fn network_id() -> NetworkId {
    NetworkId::new("cluster-test").unwrap()
}

/// Every node in `indexes` holds the same chain up to `height`
fn assert_same_chain(cluster: &LocalCluster, indexes: &[usize], height: Height) {
    let first = cluster.node(indexes[0]).unwrap();
    for h in 0..=height.value() {
        let expected = first.database().block(Height(h)).unwrap().hash();
        for i in &indexes[1..] {
            let block = cluster.node(*i).unwrap().database().block(Height(h)).unwrap();
            assert_eq!(block.hash(), expected, "node {} differs at height {}", i, h);
        }
    }
}

mod agreement_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_four_nodes_roundrobin() {
        let config = ClusterConfig::new(4, network_id()).with_roundrobin(true);
        let cluster = LocalCluster::new(config).await.unwrap();
        cluster.start().await.unwrap();

        cluster.wait_height(&[0, 1, 2, 3], Height(4), WAIT).await.unwrap();
        assert_same_chain(&cluster, &[0, 1, 2, 3], Height(4));

        // the proposer rotates
        let database = cluster.node(0).unwrap().database();
        let mut proposers = HashSet::new();
        for h in 1..=4 {
            let block = database.block(Height(h)).unwrap();
            let proposal = database.proposal(&block.manifest.proposal).await.unwrap().unwrap();
            proposers.insert(proposal.proposal_fact().unwrap().proposer.clone());
        }
        assert!(proposers.len() > 1);

        for node in cluster.nodes() {
            assert_eq!(node.state(), NodeState::Consensus);
        }
        cluster.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_of_four_down() {
        let cluster = LocalCluster::new(ClusterConfig::new(4, network_id())).await.unwrap();
        cluster.start().await.unwrap();
        cluster.wait_height(&[0, 1, 2, 3], Height(1), WAIT).await.unwrap();

        cluster.network().set_down("local://n3", true);
        let height = cluster.node(0).unwrap().last_height();
        cluster.wait_height(&[0, 1, 2], Height(height.value() + 3), WAIT).await.unwrap();

        // n3 catches up once reachable again
        cluster.network().set_down("local://n3", false);
        let target = cluster.node(0).unwrap().last_height();
        cluster.wait_height(&[3], target, WAIT).await.unwrap();
        assert_same_chain(&cluster, &[0, 1, 2, 3], target);

        cluster.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_majority_no_blocks() {
        let cluster = LocalCluster::new(ClusterConfig::new(3, network_id())).await.unwrap();
        cluster.node(0).unwrap().start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cluster.node(0).unwrap().last_height(), Height::GENESIS);
        cluster.stop().await.unwrap();
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_twice() {
        let cluster = LocalCluster::new(ClusterConfig::new(1, network_id())).await.unwrap();
        let node = cluster.node(0).unwrap();
        node.start().await.unwrap();

        cluster.wait_height(&[0], Height(2), WAIT).await.unwrap();

        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(node.stop().await.is_err());
        assert!(cluster.stop().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_node_from_config() {
        let config = NodeConfig::from_toml(
            r#"
            [node]
            name = "n0"
            network_id = "cluster-test"
            conn_info = "local://n0"

            [suffrage]
            kind = "fixed"
            members = [{ name = "n0", conn_info = "local://n0" }]

            [policy]
            network_connection_timeout_ms = 1000
            interval_broadcasting_init_ballot_ms = 200
            interval_broadcasting_accept_ballot_ms = 200
            wait_broadcasting_accept_ballot_ms = 100
            "#,
        )
        .unwrap();

        let network = agora_node::LocalNetwork::new();
        let database = std::sync::Arc::new(agora_node::MemoryDatabase::new());
        let parts = NodeParts::from_config(&config, network, database.clone()).unwrap();
        agora_node::GenesisGenerator::new(parts.local.clone(), parts.policy.network_id.clone())
            .generate()
            .unwrap()
            .store(&database)
            .await
            .unwrap();

        let node = agora_node::AgoraNode::new(parts).unwrap();
        node.start().await.unwrap();

        let wait = async {
            while node.last_height() < Height(2) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(WAIT, wait).await.expect("single node made no blocks");
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_database_without_peers_fails_to_boot() {
        let config = NodeConfig::default();
        let network = agora_node::LocalNetwork::new();
        let node = agora_node::AgoraNode::from_config(
            &config,
            network,
            std::sync::Arc::new(agora_node::MemoryDatabase::new()),
        )
        .unwrap();

        let mut events = node.subscribe();
        node.start().await.unwrap();

        // booting can not sync from nobody
        let wait = async {
            loop {
                if let Ok(agora_consensus::StateEvent::StateChanged { to, .. }) = events.recv().await {
                    if to == NodeState::Booting {
                        break;
                    }
                }
            }
        };
        tokio::time::timeout(WAIT, wait).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_ne!(node.state(), NodeState::Consensus);
        assert_eq!(node.last_height(), Height::NIL);
        let _ = node.stop().await;
    }
}

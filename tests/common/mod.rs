//! Shared harness for integration tests: clusters of real node engines
//! wired over the in-memory datagram network.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use verikad::transport::MemoryNetwork;
use verikad::utils::SystemClock;
use verikad::{Config, Keypair, Node, PeerInfo};

/// Protocol timings tightened so tests converge in milliseconds.
pub fn fast_config() -> Config {
    Config {
        k: 3,
        alpha: 2,
        request_timeout: Duration::from_millis(250),
        lookup_deadline: Duration::from_secs(2),
        probe_timeout: Duration::from_millis(100),
        tick_interval: Duration::from_millis(20),
        ..Config::default()
    }
}

pub fn test_addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

pub struct Cluster {
    pub net: MemoryNetwork,
    pub nodes: Vec<Node>,
    next_port: u16,
}

impl Cluster {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            net: MemoryNetwork::new(),
            nodes: Vec::new(),
            next_port: 20_000,
        }
    }

    /// Spawn a node seeded with the given contacts.
    pub fn spawn_with_seeds(&mut self, config: Config, seeds: Vec<PeerInfo>) -> Node {
        let port = self.next_port;
        self.next_port += 1;
        let addr = test_addr(port);
        let (transport, inbound) = self.net.attach(addr);
        let keypair = Keypair::generate();
        let (node, _handle) = verikad::spawn_node(
            keypair,
            addr,
            seeds,
            config,
            Arc::new(transport),
            inbound,
            Arc::new(SystemClock::new()),
        )
        .unwrap();
        self.nodes.push(node.clone());
        node
    }

    /// Spawn a node seeded with every node already in the cluster.
    pub fn spawn(&mut self, config: Config) -> Node {
        let seeds: Vec<PeerInfo> = self.nodes.iter().map(|n| n.peer_info()).collect();
        self.spawn_with_seeds(config, seeds)
    }

    /// Build an n-node cluster and have every node join through all the
    /// others, so tables are as complete as bucket capacities allow.
    pub async fn full_mesh(n: usize, config: Config) -> Cluster {
        let mut cluster = Cluster::new();
        for _ in 0..n {
            cluster.spawn(config.clone());
        }
        let infos: Vec<PeerInfo> = cluster.nodes.iter().map(|n| n.peer_info()).collect();
        for node in &cluster.nodes {
            let seeds: Vec<PeerInfo> = infos
                .iter()
                .filter(|info| info.id != *node.id())
                .cloned()
                .collect();
            node.join(seeds).await.expect("join failed");
        }
        cluster
    }
}

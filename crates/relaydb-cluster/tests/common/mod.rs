//! Shared scaffolding for multi-node integration tests: in-process nodes
//! on loopback ephemeral ports with shortened timers.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use relaydb_cluster::config::{BackendSettings, ClusterConfig, NodeDescriptor, ReadStrategy};
use relaydb_cluster::ClusterNode;
use relaydb_core::backend::{Backend, BackendSession};
use relaydb_core::MemoryBackend;

pub struct TestCluster {
    pub nodes: Vec<Arc<ClusterNode<MemoryBackend>>>,
    pub backends: Vec<MemoryBackend>,
    pub descriptors: Vec<NodeDescriptor>,
}

impl TestCluster {
    pub fn node(&self, id: u32) -> &Arc<ClusterNode<MemoryBackend>> {
        &self.nodes[(id - 1) as usize]
    }

    pub fn backend(&self, id: u32) -> &MemoryBackend {
        &self.backends[(id - 1) as usize]
    }

    pub fn addr(&self, id: u32) -> String {
        self.descriptors[(id - 1) as usize].addr()
    }
}

pub fn test_config(
    node_id: u32,
    nodes: Vec<NodeDescriptor>,
    strategy: ReadStrategy,
) -> ClusterConfig {
    ClusterConfig {
        node_id,
        nodes,
        heartbeat_interval_ms: 100,
        heartbeat_timeout_ms: 400,
        lock_timeout_ms: 1_000,
        prepare_timeout_ms: 1_500,
        election_timeout_ms: 200,
        coordinator_wait_ms: 500,
        txn_phase_timeout_ms: 3_000,
        client_reply_timeout_ms: 5_000,
        connect_timeout_ms: 300,
        ack_timeout_ms: 500,
        read_strategy: strategy,
        backend: BackendSettings::default(),
    }
}

/// Start `n` nodes; `prep` seeds each backend before its node boots.
pub async fn spawn_cluster<F>(n: u32, strategy: ReadStrategy, prep: F) -> TestCluster
where
    F: Fn(u32, &MemoryBackend),
{
    let mut listeners = Vec::new();
    let mut descriptors = Vec::new();
    for id in 1..=n {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        descriptors.push(NodeDescriptor {
            id,
            address: "127.0.0.1".to_string(),
            port,
        });
        listeners.push(listener);
    }

    let mut nodes = Vec::new();
    let mut backends = Vec::new();
    for (idx, listener) in listeners.into_iter().enumerate() {
        let id = (idx + 1) as u32;
        let backend = MemoryBackend::new(u64::from(n), u64::from(id));
        prep(id, &backend);
        backends.push(backend.clone());
        let config = test_config(id, descriptors.clone(), strategy);
        let node = ClusterNode::start_with_listener(config, backend, listener)
            .await
            .expect("node start");
        nodes.push(node);
    }

    TestCluster {
        nodes,
        backends,
        descriptors,
    }
}

/// Poll until `cond` holds or the deadline passes.
pub async fn wait_for<F, Fut>(cond: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Wait until every node in `ids` publishes the expected coordinator.
pub async fn await_coordinator(cluster: &TestCluster, ids: &[u32], expect: u32) -> bool {
    let ids = ids.to_vec();
    wait_for(
        move || {
            let ids = ids.clone();
            async move {
                ids.iter()
                    .all(|id| cluster.node(*id).coordinator_view().coordinator == Some(expect))
            }
        },
        Duration::from_secs(5),
    )
    .await
}

/// Commit a statement straight into a backend, bypassing the cluster.
pub fn seed(backend: &MemoryBackend, sql: &str) {
    let mut session = backend.begin().expect("begin");
    session.execute(sql).expect("execute");
    session.commit().expect("commit");
}

/// Read committed rows straight from a backend, bypassing the cluster.
pub fn rows(backend: &MemoryBackend, sql: &str) -> Vec<Vec<String>> {
    backend.begin().expect("begin").query(sql).expect("query")
}

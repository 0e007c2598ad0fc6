//! Heartbeat and peer health tracking.
//!
//! A sender task pushes `HEARTBEAT` to every peer each interval; a checker
//! task flips peers DOWN when their last heartbeat is older than the
//! timeout (monotonic clock only). Status transitions publish events; the
//! checker additionally reports a lost coordinator to the election engine
//! exactly while no election is in progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, NodeId};
use crate::election::CoordinatorView;
use crate::message::{Envelope, HeartbeatPayload, MessageKind};
use crate::transport::Messenger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Up,
    Down,
}

/// Liveness record for one peer.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub node_id: NodeId,
    pub last_heartbeat: Instant,
    pub status: PeerStatus,
}

/// Transition events consumed by the node runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    PeerUp(NodeId),
    PeerDown(NodeId),
    CoordinatorLost { term: u64 },
}

/// Peer liveness view, owned here and read by everyone else as snapshots.
pub struct HealthMonitor {
    node_id: NodeId,
    heartbeat_timeout: Duration,
    peers: RwLock<HashMap<NodeId, PeerState>>,
    events: mpsc::UnboundedSender<HealthEvent>,
    view: Arc<CoordinatorView>,
}

impl HealthMonitor {
    pub fn new(
        config: &ClusterConfig,
        view: Arc<CoordinatorView>,
        events: mpsc::UnboundedSender<HealthEvent>,
    ) -> Self {
        let now = Instant::now();
        let peers = config
            .peers()
            .into_iter()
            .map(|n| {
                (
                    n.id,
                    PeerState {
                        node_id: n.id,
                        last_heartbeat: now,
                        status: PeerStatus::Up,
                    },
                )
            })
            .collect();
        HealthMonitor {
            node_id: config.node_id,
            heartbeat_timeout: config.heartbeat_timeout(),
            peers: RwLock::new(peers),
            events,
            view,
        }
    }

    /// Record a heartbeat arrival; revives DOWN peers.
    pub fn record_heartbeat(&self, node_id: NodeId) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(&node_id) {
            peer.last_heartbeat = Instant::now();
            if peer.status == PeerStatus::Down {
                info!("peer {node_id} recovered");
                peer.status = PeerStatus::Up;
                let _ = self.events.send(HealthEvent::PeerUp(node_id));
            }
        }
    }

    /// Mark a peer DOWN immediately (failed send observed by a caller).
    pub fn mark_down(&self, node_id: NodeId) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(&node_id) {
            if peer.status == PeerStatus::Up {
                warn!("peer {node_id} marked down after failed send");
                peer.status = PeerStatus::Down;
                let _ = self.events.send(HealthEvent::PeerDown(node_id));
            }
        }
    }

    pub fn is_up(&self, node_id: NodeId) -> bool {
        if node_id == self.node_id {
            return true;
        }
        self.peers
            .read()
            .get(&node_id)
            .map(|p| p.status == PeerStatus::Up)
            .unwrap_or(false)
    }

    /// UP set including this node, sorted by id.
    pub fn up_nodes(&self) -> Vec<NodeId> {
        let mut up: Vec<NodeId> = self
            .peers
            .read()
            .values()
            .filter(|p| p.status == PeerStatus::Up)
            .map(|p| p.node_id)
            .collect();
        up.push(self.node_id);
        up.sort_unstable();
        up
    }

    /// UP peers excluding this node, sorted by id.
    pub fn up_peers(&self) -> Vec<NodeId> {
        let mut up: Vec<NodeId> = self
            .peers
            .read()
            .values()
            .filter(|p| p.status == PeerStatus::Up)
            .map(|p| p.node_id)
            .collect();
        up.sort_unstable();
        up
    }

    pub fn snapshot(&self) -> Vec<PeerState> {
        self.peers.read().values().cloned().collect()
    }

    /// Periodic heartbeat broadcast.
    pub async fn run_sender(
        self: Arc<Self>,
        messenger: Arc<Messenger>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let envelope = match Envelope::new(
                        self.node_id,
                        MessageKind::Heartbeat,
                        &HeartbeatPayload::default(),
                    ) {
                        Ok(env) => env,
                        Err(e) => {
                            warn!("failed to build heartbeat: {e}");
                            continue;
                        }
                    };
                    let peer_ids: Vec<NodeId> = self.peers.read().keys().copied().collect();
                    for peer in peer_ids {
                        if let Err(e) = messenger.send(peer, &envelope).await {
                            debug!("heartbeat to {peer} failed: {e}");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Periodic timeout sweep and coordinator-loss detection.
    pub async fn run_checker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(
            (self.heartbeat_timeout.as_millis() as u64 / 4).clamp(50, 1_000),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut newly_down = Vec::new();
        {
            let mut peers = self.peers.write();
            for peer in peers.values_mut() {
                if peer.status == PeerStatus::Up
                    && now.duration_since(peer.last_heartbeat) > self.heartbeat_timeout
                {
                    warn!(
                        "peer {} failed (no heartbeat for {:?})",
                        peer.node_id,
                        now.duration_since(peer.last_heartbeat)
                    );
                    peer.status = PeerStatus::Down;
                    newly_down.push(peer.node_id);
                }
            }
        }
        for node_id in &newly_down {
            let _ = self.events.send(HealthEvent::PeerDown(*node_id));
        }

        let view = self.view.snapshot();
        if let Some(coordinator) = view.coordinator {
            if coordinator != self.node_id && !view.election_in_progress && !self.is_up(coordinator)
            {
                info!("coordinator {coordinator} lost at term {}", view.term);
                let _ = self
                    .events
                    .send(HealthEvent::CoordinatorLost { term: view.term });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendSettings, NodeDescriptor, ReadStrategy};

    fn config() -> ClusterConfig {
        ClusterConfig {
            node_id: 1,
            nodes: (1..=3)
                .map(|id| NodeDescriptor {
                    id,
                    address: "127.0.0.1".to_string(),
                    port: 7_000 + id as u16,
                })
                .collect(),
            heartbeat_interval_ms: 50,
            heartbeat_timeout_ms: 100,
            lock_timeout_ms: 1_000,
            prepare_timeout_ms: 1_000,
            election_timeout_ms: 200,
            coordinator_wait_ms: 400,
            txn_phase_timeout_ms: 2_000,
            client_reply_timeout_ms: 1_000,
            connect_timeout_ms: 200,
            ack_timeout_ms: 200,
            read_strategy: ReadStrategy::RoundRobin,
            backend: BackendSettings::default(),
        }
    }

    fn monitor() -> (HealthMonitor, mpsc::UnboundedReceiver<HealthEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let view = Arc::new(CoordinatorView::new());
        (HealthMonitor::new(&config(), view, tx), rx)
    }

    #[test]
    fn test_up_set_includes_self_sorted() {
        let (health, _rx) = monitor();
        assert_eq!(health.up_nodes(), vec![1, 2, 3]);
        assert_eq!(health.up_peers(), vec![2, 3]);
        assert!(health.is_up(1));
    }

    #[test]
    fn test_mark_down_and_recovery_events() {
        let (health, mut rx) = monitor();
        health.mark_down(2);
        assert!(!health.is_up(2));
        assert_eq!(rx.try_recv().unwrap(), HealthEvent::PeerDown(2));
        // repeated mark_down does not refire
        health.mark_down(2);
        assert!(rx.try_recv().is_err());

        health.record_heartbeat(2);
        assert!(health.is_up(2));
        assert_eq!(rx.try_recv().unwrap(), HealthEvent::PeerUp(2));
    }

    #[tokio::test]
    async fn test_sweep_times_out_silent_peers() {
        let (health, mut rx) = monitor();
        tokio::time::sleep(Duration::from_millis(150)).await;
        health.record_heartbeat(2);
        health.sweep();
        assert!(health.is_up(2));
        assert!(!health.is_up(3));
        assert_eq!(rx.try_recv().unwrap(), HealthEvent::PeerDown(3));
    }

    #[tokio::test]
    async fn test_lost_coordinator_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let view = Arc::new(CoordinatorView::new());
        view.publish(3, 1);
        let health = HealthMonitor::new(&config(), Arc::clone(&view), tx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        health.sweep();
        let mut saw_lost = false;
        while let Ok(event) = rx.try_recv() {
            if event == (HealthEvent::CoordinatorLost { term: 1 }) {
                saw_lost = true;
            }
        }
        assert!(saw_lost);
    }
}

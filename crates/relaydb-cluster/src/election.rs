//! Bully election engine.
//!
//! The highest-id live node wins. On coordinator loss (or at startup with
//! no known coordinator) a node sends `ELECTION(term+1)` to every higher
//! id and waits `T_elect`; any `ALIVE` moves it to waiting for a
//! `COORDINATOR` announcement within `T_coord`, otherwise it declares
//! itself. Terms are monotonic per node; announcements with a stale term
//! are ignored. The engine is the sole writer of `CoordinatorView`.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::NodeId;
use crate::message::{AlivePayload, CoordinatorPayload, ElectionPayload, Envelope, MessageKind};
use crate::transport::Messenger;

/// Published coordinator identity, read everywhere as value snapshots.
pub struct CoordinatorView {
    inner: RwLock<ViewSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewSnapshot {
    pub coordinator: Option<NodeId>,
    pub term: u64,
    pub election_in_progress: bool,
}

impl CoordinatorView {
    pub fn new() -> Self {
        CoordinatorView {
            inner: RwLock::new(ViewSnapshot {
                coordinator: None,
                term: 0,
                election_in_progress: false,
            }),
        }
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        *self.inner.read()
    }

    /// Clear the coordinator while an election runs; writes are rejected
    /// until it settles.
    pub fn begin_election(&self) {
        let mut inner = self.inner.write();
        inner.coordinator = None;
        inner.election_in_progress = true;
    }

    pub fn publish(&self, coordinator: NodeId, term: u64) {
        let mut inner = self.inner.write();
        inner.coordinator = Some(coordinator);
        inner.term = term;
        inner.election_in_progress = false;
    }
}

impl Default for CoordinatorView {
    fn default() -> Self {
        CoordinatorView::new()
    }
}

/// Protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElectionState {
    Follower,
    Electing,
    WaitingForHigher,
    Coordinator,
}

/// Inputs to the engine: inbound protocol messages plus local triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionEvent {
    /// Startup or watchdog trigger with no known coordinator.
    Kickoff,
    CoordinatorLost { term: u64 },
    ElectionMessage { from: NodeId, term: u64 },
    AliveMessage { from: NodeId, term: u64 },
    CoordinatorMessage { coordinator_id: NodeId, term: u64 },
}

pub struct ElectionEngine {
    node_id: NodeId,
    higher_peers: Vec<NodeId>,
    all_peers: Vec<NodeId>,
    view: Arc<CoordinatorView>,
    messenger: Arc<Messenger>,
    t_elect: Duration,
    t_coord: Duration,
}

impl ElectionEngine {
    pub fn new(
        node_id: NodeId,
        peer_ids: Vec<NodeId>,
        view: Arc<CoordinatorView>,
        messenger: Arc<Messenger>,
        t_elect: Duration,
        t_coord: Duration,
    ) -> Self {
        let mut all_peers = peer_ids;
        all_peers.sort_unstable();
        let higher_peers = all_peers.iter().copied().filter(|p| *p > node_id).collect();
        ElectionEngine {
            node_id,
            higher_peers,
            all_peers,
            view,
            messenger,
            t_elect,
            t_coord,
        }
    }

    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ElectionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut state = ElectionState::Follower;
        let mut local_term: u64 = 0;
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event, &mut state, &mut local_term, &mut deadline)
                            .await;
                    }
                    None => break,
                },
                _ = expire(deadline) => {
                    self.handle_deadline(&mut state, &mut local_term, &mut deadline)
                        .await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_event(
        &self,
        event: ElectionEvent,
        state: &mut ElectionState,
        local_term: &mut u64,
        deadline: &mut Option<Instant>,
    ) {
        match event {
            ElectionEvent::Kickoff | ElectionEvent::CoordinatorLost { .. } => {
                if matches!(*state, ElectionState::Follower) {
                    self.start_election(state, local_term, deadline).await;
                }
            }
            ElectionEvent::ElectionMessage { from, term } => {
                debug!("ELECTION from {from} (term {term})");
                *local_term = (*local_term).max(term.saturating_sub(1));
                self.send_to(from, MessageKind::Alive, &AlivePayload { term: *local_term });
                match *state {
                    ElectionState::Coordinator => {
                        // a lower node lost track of us; re-announce
                        self.announce(*local_term);
                    }
                    ElectionState::Follower => {
                        self.start_election(state, local_term, deadline).await;
                    }
                    ElectionState::Electing | ElectionState::WaitingForHigher => {}
                }
            }
            ElectionEvent::AliveMessage { from, term } => {
                debug!("ALIVE from {from} (term {term})");
                if *state == ElectionState::Electing {
                    *state = ElectionState::WaitingForHigher;
                    *deadline = Some(Instant::now() + self.t_coord);
                }
            }
            ElectionEvent::CoordinatorMessage {
                coordinator_id,
                term,
            } => {
                if term < *local_term {
                    warn!(
                        "ignoring stale COORDINATOR({coordinator_id}, {term}); local term {}",
                        *local_term
                    );
                    return;
                }
                if term == *local_term {
                    // concurrent declarations at the same term settle on
                    // the higher id
                    if *state == ElectionState::Coordinator && coordinator_id < self.node_id {
                        debug!(
                            "lower node {coordinator_id} declared at term {term}; re-announcing"
                        );
                        self.announce(*local_term);
                        return;
                    }
                    if let Some(current) = self.view.snapshot().coordinator {
                        if coordinator_id < current {
                            debug!(
                                "ignoring COORDINATOR({coordinator_id}, {term}); already following {current}"
                            );
                            return;
                        }
                    }
                }
                *local_term = term;
                *deadline = None;
                *state = if coordinator_id == self.node_id {
                    ElectionState::Coordinator
                } else {
                    ElectionState::Follower
                };
                info!("adopting coordinator {coordinator_id} at term {term}");
                self.view.publish(coordinator_id, term);
            }
        }
    }

    async fn handle_deadline(
        &self,
        state: &mut ElectionState,
        local_term: &mut u64,
        deadline: &mut Option<Instant>,
    ) {
        match *state {
            ElectionState::Electing => {
                // no higher node answered
                self.declare(state, *local_term, deadline);
            }
            ElectionState::WaitingForHigher => {
                debug!("no COORDINATOR announcement; restarting election");
                *state = ElectionState::Follower;
                self.start_election(state, local_term, deadline).await;
            }
            _ => *deadline = None,
        }
    }

    async fn start_election(
        &self,
        state: &mut ElectionState,
        local_term: &mut u64,
        deadline: &mut Option<Instant>,
    ) {
        *local_term += 1;
        info!(
            "node {} starting election at term {}",
            self.node_id, *local_term
        );
        *state = ElectionState::Electing;
        self.view.begin_election();

        if self.higher_peers.is_empty() {
            self.declare(state, *local_term, deadline);
            return;
        }
        for peer in &self.higher_peers {
            self.send_to(
                *peer,
                MessageKind::Election,
                &ElectionPayload { term: *local_term },
            );
        }
        *deadline = Some(Instant::now() + self.t_elect);
    }

    fn declare(&self, state: &mut ElectionState, term: u64, deadline: &mut Option<Instant>) {
        info!("node {} becoming coordinator at term {term}", self.node_id);
        *state = ElectionState::Coordinator;
        *deadline = None;
        self.view.publish(self.node_id, term);
        self.announce(term);
    }

    fn announce(&self, term: u64) {
        for peer in &self.all_peers {
            self.send_to(
                *peer,
                MessageKind::Coordinator,
                &CoordinatorPayload {
                    coordinator_id: self.node_id,
                    term,
                },
            );
        }
    }

    /// Fire-and-forget send off the engine loop; unreachable peers are
    /// the expected case during an election.
    fn send_to<T: serde::Serialize>(&self, peer: NodeId, kind: MessageKind, payload: &T) {
        let envelope = match Envelope::new(self.node_id, kind, payload) {
            Ok(env) => env,
            Err(e) => {
                warn!("failed to encode {kind:?}: {e}");
                return;
            }
        };
        let messenger = Arc::clone(&self.messenger);
        tokio::spawn(async move {
            if let Err(e) = messenger.send(peer, &envelope).await {
                debug!("{kind:?} to {peer} failed: {e}");
            }
        });
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

//! Coordinator side of two-phase commit.
//!
//! PREPARE fans out to every UP participant in parallel (the local one via
//! an in-process call); votes are gathered under one phase deadline and a
//! missing vote counts as NO. The unanimous-YES decision is the commit
//! point: COMMIT or ABORT is broadcast, the local participant finalizes,
//! and ACKs are collected best-effort. In-flight state lives only on this
//! node — a coordinator crash loses it and clients retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relaydb_core::backend::Backend;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::NodeId;
use crate::error::ErrorCode;
use crate::health::HealthMonitor;
use crate::message::{
    AbortPayload, ClientReply, CommitPayload, Envelope, MessageKind, PreparePayload, Vote,
};
use crate::participant::Participant;
use crate::transport::Messenger;

/// Lifecycle of a coordinated transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Init,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

/// Coordinator-side record of one write in flight.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub txn_id: String,
    pub statement: String,
    pub participants: Vec<NodeId>,
    pub votes: HashMap<NodeId, Vote>,
    pub phase: TxnPhase,
    pub started_at: Instant,
}

pub struct TwoPhaseCoordinator<B: Backend> {
    node_id: NodeId,
    messenger: Arc<Messenger>,
    health: Arc<HealthMonitor>,
    participant: Arc<Participant<B>>,
    prepare_timeout: Duration,
    ack_timeout: Duration,
    in_flight: Mutex<HashMap<String, Transaction>>,
    pending_votes: Mutex<HashMap<String, mpsc::UnboundedSender<(NodeId, Vote)>>>,
    pending_acks: Mutex<HashMap<String, mpsc::UnboundedSender<NodeId>>>,
}

impl<B: Backend> TwoPhaseCoordinator<B> {
    pub fn new(
        node_id: NodeId,
        messenger: Arc<Messenger>,
        health: Arc<HealthMonitor>,
        participant: Arc<Participant<B>>,
        prepare_timeout: Duration,
        ack_timeout: Duration,
    ) -> Self {
        TwoPhaseCoordinator {
            node_id,
            messenger,
            health,
            participant,
            prepare_timeout,
            ack_timeout,
            in_flight: Mutex::new(HashMap::new()),
            pending_votes: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Route an inbound VOTE to its waiting transaction.
    pub fn deliver_vote(&self, txn_id: &str, node_id: NodeId, vote: Vote) {
        if let Some(tx) = self.pending_votes.lock().get(txn_id) {
            let _ = tx.send((node_id, vote));
        } else {
            debug!("late vote from {node_id} for {txn_id}");
        }
    }

    /// Route an inbound ACK to its waiting transaction.
    pub fn deliver_ack(&self, txn_id: &str, node_id: NodeId) {
        if let Some(tx) = self.pending_acks.lock().get(txn_id) {
            let _ = tx.send(node_id);
        }
    }

    /// Run a WRITE/DDL statement through 2PC across the UP set.
    pub async fn execute_write(self: &Arc<Self>, txn_id: &str, stmt: &str) -> ClientReply {
        let participants = self.health.up_nodes();
        if participants.is_empty() {
            return ClientReply::failure(
                txn_id.to_string(),
                self.node_id,
                ErrorCode::Unavailable,
                "no live participants",
            );
        }
        info!(
            "starting 2PC for {txn_id} with {} participants",
            participants.len()
        );
        self.in_flight.lock().insert(
            txn_id.to_string(),
            Transaction {
                txn_id: txn_id.to_string(),
                statement: stmt.to_string(),
                participants: participants.clone(),
                votes: HashMap::new(),
                phase: TxnPhase::Preparing,
                started_at: Instant::now(),
            },
        );

        let votes = self.phase_prepare(txn_id, stmt, &participants).await;
        let all_yes = participants
            .iter()
            .all(|p| votes.get(p) == Some(&Vote::Yes));
        if let Some(txn) = self.in_flight.lock().get_mut(txn_id) {
            txn.votes = votes.clone();
            txn.phase = if all_yes {
                TxnPhase::Prepared
            } else {
                TxnPhase::Aborting
            };
        }

        let reply = if all_yes {
            self.phase_commit(txn_id, &participants).await
        } else {
            let dissenters: Vec<String> = participants
                .iter()
                .filter(|p| votes.get(p) != Some(&Vote::Yes))
                .map(|p| format!("{p}:{:?}", votes.get(p).copied().unwrap_or(Vote::Timeout)))
                .collect();
            warn!("aborting {txn_id}: votes {}", dissenters.join(", "));
            self.phase_abort(txn_id, &participants).await;
            ClientReply::failure(
                txn_id.to_string(),
                self.node_id,
                ErrorCode::Aborted,
                format!("prepare rejected by {}", dissenters.join(", ")),
            )
        };
        self.in_flight.lock().remove(txn_id);
        reply
    }

    /// Phase 1: fan out PREPARE and gather votes under one deadline.
    async fn phase_prepare(
        self: &Arc<Self>,
        txn_id: &str,
        stmt: &str,
        participants: &[NodeId],
    ) -> HashMap<NodeId, Vote> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending_votes
            .lock()
            .insert(txn_id.to_string(), tx.clone());

        // local participant votes via in-process call
        {
            let participant = Arc::clone(&self.participant);
            let tx = tx.clone();
            let node_id = self.node_id;
            let txn_id = txn_id.to_string();
            let stmt = stmt.to_string();
            tokio::spawn(async move {
                let vote = participant.prepare(&txn_id, &stmt).await;
                let _ = tx.send((node_id, vote));
            });
        }

        for &peer in participants.iter().filter(|p| **p != self.node_id) {
            let coordinator = Arc::clone(self);
            let tx = tx.clone();
            let payload = PreparePayload {
                txn_id: txn_id.to_string(),
                statement: stmt.to_string(),
            };
            tokio::spawn(async move {
                let envelope =
                    match Envelope::new(coordinator.node_id, MessageKind::Prepare, &payload) {
                        Ok(env) => env,
                        Err(e) => {
                            warn!("failed to encode PREPARE: {e}");
                            let _ = tx.send((peer, Vote::No));
                            return;
                        }
                    };
                if let Err(e) = coordinator.messenger.send(peer, &envelope).await {
                    warn!("PREPARE to {peer} failed ({e}); counting as NO");
                    coordinator.health.mark_down(peer);
                    let _ = tx.send((peer, Vote::No));
                }
            });
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + self.prepare_timeout;
        let mut votes: HashMap<NodeId, Vote> = HashMap::new();
        while votes.len() < participants.len() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((node_id, vote))) => {
                    votes.entry(node_id).or_insert(vote);
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("prepare phase deadline for {txn_id}");
                    break;
                }
            }
        }
        self.pending_votes.lock().remove(txn_id);
        for &p in participants {
            votes.entry(p).or_insert(Vote::Timeout);
        }
        votes
    }

    /// Phase 2, commit: broadcast the decision, finalize locally, collect
    /// ACKs best-effort.
    async fn phase_commit(self: &Arc<Self>, txn_id: &str, participants: &[NodeId]) -> ClientReply {
        if let Some(txn) = self.in_flight.lock().get_mut(txn_id) {
            txn.phase = TxnPhase::Committing;
        }
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        self.pending_acks
            .lock()
            .insert(txn_id.to_string(), ack_tx);

        let remote: Vec<NodeId> = participants
            .iter()
            .copied()
            .filter(|p| *p != self.node_id)
            .collect();
        for &peer in &remote {
            let coordinator = Arc::clone(self);
            let payload = CommitPayload {
                txn_id: txn_id.to_string(),
            };
            tokio::spawn(async move {
                let envelope =
                    match Envelope::new(coordinator.node_id, MessageKind::Commit, &payload) {
                        Ok(env) => env,
                        Err(e) => {
                            warn!("failed to encode COMMIT: {e}");
                            return;
                        }
                    };
                if let Err(e) = coordinator.messenger.send(peer, &envelope).await {
                    warn!("COMMIT to {peer} failed: {e}; peer must resolve via TXN_STATUS");
                    coordinator.health.mark_down(peer);
                }
            });
        }

        let local = self.participant.commit(txn_id).await;

        let ack_deadline = tokio::time::Instant::now() + self.ack_timeout;
        let mut acked = 0usize;
        while acked < remote.len() {
            match tokio::time::timeout_at(ack_deadline, ack_rx.recv()).await {
                Ok(Some(node_id)) => {
                    debug!("ACK from {node_id} for {txn_id}");
                    acked += 1;
                }
                _ => {
                    warn!("{} of {} ACKs missing for {txn_id}", remote.len() - acked, remote.len());
                    break;
                }
            }
        }
        self.pending_acks.lock().remove(txn_id);

        match local {
            Ok(affected) => {
                if let Some(txn) = self.in_flight.lock().get_mut(txn_id) {
                    txn.phase = TxnPhase::Committed;
                }
                ClientReply::write_ok(txn_id.to_string(), self.node_id, affected)
            }
            Err(e) => ClientReply::failure(
                txn_id.to_string(),
                self.node_id,
                ErrorCode::BackendError,
                e.to_string(),
            ),
        }
    }

    /// Phase 2, abort: broadcast ABORT (no reply expected) and roll back
    /// locally.
    async fn phase_abort(self: &Arc<Self>, txn_id: &str, participants: &[NodeId]) {
        for &peer in participants.iter().filter(|p| **p != self.node_id) {
            let coordinator = Arc::clone(self);
            let payload = AbortPayload {
                txn_id: txn_id.to_string(),
            };
            tokio::spawn(async move {
                let envelope =
                    match Envelope::new(coordinator.node_id, MessageKind::Abort, &payload) {
                        Ok(env) => env,
                        Err(e) => {
                            warn!("failed to encode ABORT: {e}");
                            return;
                        }
                    };
                if let Err(e) = coordinator.messenger.send(peer, &envelope).await {
                    debug!("ABORT to {peer} failed: {e}");
                }
            });
        }
        self.participant.abort(txn_id).await;
        if let Some(txn) = self.in_flight.lock().get_mut(txn_id) {
            txn.phase = TxnPhase::Aborted;
        }
    }
}

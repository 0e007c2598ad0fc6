//! Node runtime: wires the messenger, health, election, locks, balancer,
//! participant, and 2PC coordinator into one process and routes every
//! inbound message to its owner.
//!
//! Control flow for a client statement: classify → if this node is not
//! the coordinator, forward `CLIENT_REQUEST` and await the correlated
//! `CLIENT_REPLY`; on the coordinator, reads go through the balancer and
//! writes through 2PC. The same listener serves peers and clients —
//! clients use sender id 0 and get their reply on the same connection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use relaydb_core::backend::pool::{BackendPool, PoolConfig};
use relaydb_core::backend::{Backend, BackendSession};
use relaydb_core::statement::{self, StatementKind};
use relaydb_core::txnlog::TxnLogStatus;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::balance::ReadBalancer;
use crate::config::{ClusterConfig, NodeId};
use crate::election::{CoordinatorView, ElectionEngine, ElectionEvent, ViewSnapshot};
use crate::error::{ErrorCode, Result};
use crate::health::{HealthEvent, HealthMonitor};
use crate::locks::LockManager;
use crate::message::{
    generate_txn_id, AckPayload, AlivePayload, ClientReply, ClientRequestPayload,
    CoordinatorPayload, CommitPayload, ElectionPayload, Envelope, ExecuteReadPayload, MessageKind,
    PreparePayload, ReadResultPayload, TxnOutcome, TxnStatusPayload, TxnStatusReplyPayload,
    VotePayload, CLIENT_SENDER,
};
use crate::participant::Participant;
use crate::transport::{run_dispatch, run_listener, Inbound, Messenger};
use crate::twopc::TwoPhaseCoordinator;

const DISPATCH_WORKERS: usize = 8;

/// One middleware node.
pub struct ClusterNode<B: Backend> {
    config: ClusterConfig,
    messenger: Arc<Messenger>,
    health: Arc<HealthMonitor>,
    view: Arc<CoordinatorView>,
    election_tx: mpsc::UnboundedSender<ElectionEvent>,
    balancer: Arc<ReadBalancer>,
    participant: Arc<Participant<B>>,
    twopc: Arc<TwoPhaseCoordinator<B>>,
    pool: BackendPool<B>,
    pending_replies: Mutex<HashMap<String, oneshot::Sender<ClientReply>>>,
    pending_reads: Mutex<HashMap<String, oneshot::Sender<ReadResultPayload>>>,
    pending_status: Mutex<HashMap<String, oneshot::Sender<TxnOutcome>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<B: Backend> ClusterNode<B> {
    /// Bind the configured port and start every background task.
    pub async fn start(config: ClusterConfig, backend: B) -> Result<Arc<Self>> {
        config.validate()?;
        let port = config.local().port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Self::start_with_listener(config, backend, listener).await
    }

    /// Start on a pre-bound listener (tests bind port 0 themselves).
    pub async fn start_with_listener(
        config: ClusterConfig,
        backend: B,
        listener: TcpListener,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let view = Arc::new(CoordinatorView::new());
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let health = Arc::new(HealthMonitor::new(&config, Arc::clone(&view), health_tx));
        let messenger = Arc::new(Messenger::new(&config));
        let pool = BackendPool::new(
            backend,
            PoolConfig {
                capacity: config.backend.pool_size,
                acquire_timeout_ms: config.backend.acquire_timeout_ms,
            },
        );
        if !pool.health() {
            return Err(crate::error::ClusterError::Transport(
                "backend failed liveness probe".to_string(),
            ));
        }
        let locks = Arc::new(LockManager::new());
        let participant = Arc::new(Participant::new(
            config.node_id,
            pool.clone(),
            Arc::clone(&locks),
            config.lock_timeout(),
            config.txn_phase_timeout(),
        ));
        let twopc = Arc::new(TwoPhaseCoordinator::new(
            config.node_id,
            Arc::clone(&messenger),
            Arc::clone(&health),
            Arc::clone(&participant),
            config.prepare_timeout(),
            config.ack_timeout(),
        ));
        let balancer = Arc::new(ReadBalancer::new(config.read_strategy));

        let (election_tx, election_rx) = mpsc::unbounded_channel();
        let engine = ElectionEngine::new(
            config.node_id,
            config.peers().iter().map(|n| n.id).collect(),
            Arc::clone(&view),
            Arc::clone(&messenger),
            config.election_timeout(),
            config.coordinator_wait(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let node = Arc::new(ClusterNode {
            config,
            messenger,
            health,
            view,
            election_tx,
            balancer,
            participant,
            twopc,
            pool,
            pending_replies: Mutex::new(HashMap::new()),
            pending_reads: Mutex::new(HashMap::new()),
            pending_status: Mutex::new(HashMap::new()),
            shutdown_tx,
        });

        tokio::spawn(run_listener(listener, inbound_tx, shutdown_rx.clone()));
        {
            let node = Arc::clone(&node);
            tokio::spawn(run_dispatch(inbound_rx, DISPATCH_WORKERS, move |inbound| {
                let node = Arc::clone(&node);
                async move { node.handle_inbound(inbound).await }
            }));
        }
        tokio::spawn(Arc::clone(&node.health).run_sender(
            Arc::clone(&node.messenger),
            node.config.heartbeat_interval(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(Arc::clone(&node.health).run_checker(shutdown_rx.clone()));
        tokio::spawn(engine.run(election_rx, shutdown_rx.clone()));
        {
            let node = Arc::clone(&node);
            tokio::spawn(node.run_health_pump(health_rx, shutdown_rx));
        }

        // startup with no known coordinator triggers an election
        let _ = node.election_tx.send(ElectionEvent::Kickoff);

        {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.run_recovery().await });
        }
        info!("node {} started", node.config.node_id);
        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn coordinator_view(&self) -> ViewSnapshot {
        self.view.snapshot()
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn participant(&self) -> &Arc<Participant<B>> {
        &self.participant
    }

    pub fn in_flight_writes(&self) -> usize {
        self.twopc.active_count()
    }

    /// Cooperative shutdown: stop the loops, abort pinned work, fail
    /// pending waits, drop outbound connections.
    pub async fn shutdown(&self) {
        info!("node {} shutting down", self.config.node_id);
        let _ = self.shutdown_tx.send(true);
        self.participant.abandon_all();
        self.fail_pending_unavailable();
        self.pending_reads.lock().clear();
        self.pending_status.lock().clear();
        self.messenger.disconnect_all().await;
    }

    /// Run one client statement to completion from this node.
    pub async fn execute(self: &Arc<Self>, stmt: &str) -> ClientReply {
        self.execute_with_txn(generate_txn_id(), stmt).await
    }

    async fn execute_with_txn(self: &Arc<Self>, txn_id: String, stmt: &str) -> ClientReply {
        let kind = match statement::classify(stmt) {
            Ok(kind) => kind,
            Err(e) => {
                return ClientReply::failure(
                    txn_id,
                    self.config.node_id,
                    ErrorCode::BadStatement,
                    e.to_string(),
                )
            }
        };
        let snapshot = self.view.snapshot();
        let Some(coordinator) = snapshot.coordinator else {
            return ClientReply::failure(
                txn_id,
                self.config.node_id,
                ErrorCode::Unavailable,
                "no coordinator elected",
            );
        };
        if coordinator == self.config.node_id {
            self.coordinate(&txn_id, stmt, kind).await
        } else {
            self.forward_to_coordinator(coordinator, txn_id, stmt).await
        }
    }

    async fn coordinate(self: &Arc<Self>, txn_id: &str, stmt: &str, kind: StatementKind) -> ClientReply {
        match kind {
            StatementKind::Read => self.dispatch_read(txn_id, stmt).await,
            StatementKind::Write | StatementKind::Ddl => {
                self.twopc.execute_write(txn_id, stmt).await
            }
        }
    }

    async fn forward_to_coordinator(
        self: &Arc<Self>,
        coordinator: NodeId,
        txn_id: String,
        stmt: &str,
    ) -> ClientReply {
        let (tx, rx) = oneshot::channel();
        self.pending_replies.lock().insert(txn_id.clone(), tx);

        let payload = ClientRequestPayload {
            txn_id: txn_id.clone(),
            statement: stmt.to_string(),
        };
        let envelope =
            match Envelope::new(self.config.node_id, MessageKind::ClientRequest, &payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.pending_replies.lock().remove(&txn_id);
                    return ClientReply::failure(
                        txn_id,
                        self.config.node_id,
                        ErrorCode::Unavailable,
                        e.to_string(),
                    );
                }
            };
        if let Err(e) = self.messenger.send(coordinator, &envelope).await {
            self.pending_replies.lock().remove(&txn_id);
            self.health.mark_down(coordinator);
            return ClientReply::failure(
                txn_id,
                self.config.node_id,
                ErrorCode::Unavailable,
                format!("coordinator unreachable: {e}"),
            );
        }

        match tokio::time::timeout(self.config.client_reply_timeout(), rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => ClientReply::failure(
                txn_id,
                self.config.node_id,
                ErrorCode::Unavailable,
                "coordinator lost mid-request",
            ),
            Err(_) => {
                self.pending_replies.lock().remove(&txn_id);
                ClientReply::failure(
                    txn_id,
                    self.config.node_id,
                    ErrorCode::Unavailable,
                    "timed out waiting for coordinator reply",
                )
            }
        }
    }

    /// Coordinator read path: pick a target from the UP set, run locally
    /// or round-trip EXECUTE_READ/READ_RESULT. Reads take no lock-manager
    /// locks.
    async fn dispatch_read(self: &Arc<Self>, txn_id: &str, stmt: &str) -> ClientReply {
        let up = self.health.up_nodes();
        let Some(target) = self.balancer.select(&up) else {
            return ClientReply::failure(
                txn_id.to_string(),
                self.config.node_id,
                ErrorCode::Unavailable,
                "no live nodes for read dispatch",
            );
        };
        let _guard = self.balancer.track(target);
        debug!("dispatching read {txn_id} to node {target}");

        if target == self.config.node_id {
            return self.local_read(txn_id, stmt).await;
        }

        let (tx, rx) = oneshot::channel();
        self.pending_reads.lock().insert(txn_id.to_string(), tx);
        let payload = ExecuteReadPayload {
            txn_id: txn_id.to_string(),
            statement: stmt.to_string(),
        };
        let envelope = match Envelope::new(self.config.node_id, MessageKind::ExecuteRead, &payload)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                self.pending_reads.lock().remove(txn_id);
                return ClientReply::failure(
                    txn_id.to_string(),
                    self.config.node_id,
                    ErrorCode::Unavailable,
                    e.to_string(),
                );
            }
        };
        if let Err(e) = self.messenger.send(target, &envelope).await {
            self.pending_reads.lock().remove(txn_id);
            self.health.mark_down(target);
            return ClientReply::failure(
                txn_id.to_string(),
                self.config.node_id,
                ErrorCode::Unavailable,
                format!("read target unreachable: {e}"),
            );
        }

        match tokio::time::timeout(self.config.client_reply_timeout(), rx).await {
            Ok(Ok(result)) => {
                if result.ok {
                    ClientReply::read_ok(txn_id.to_string(), self.config.node_id, result.rows)
                } else {
                    ClientReply::failure(
                        txn_id.to_string(),
                        self.config.node_id,
                        ErrorCode::BackendError,
                        result.error.unwrap_or_else(|| "read failed".to_string()),
                    )
                }
            }
            _ => {
                self.pending_reads.lock().remove(txn_id);
                ClientReply::failure(
                    txn_id.to_string(),
                    self.config.node_id,
                    ErrorCode::Unavailable,
                    "read target did not answer",
                )
            }
        }
    }

    async fn local_read(&self, txn_id: &str, stmt: &str) -> ClientReply {
        let mut session = match self.pool.acquire().await {
            Ok(session) => session,
            Err(e) => {
                return ClientReply::failure(
                    txn_id.to_string(),
                    self.config.node_id,
                    ErrorCode::BackendError,
                    e.to_string(),
                )
            }
        };
        match session.query(stmt) {
            Ok(rows) => ClientReply::read_ok(txn_id.to_string(), self.config.node_id, rows),
            Err(e) => ClientReply::failure(
                txn_id.to_string(),
                self.config.node_id,
                ErrorCode::BackendError,
                e.to_string(),
            ),
        }
    }

    /// Switch over message kinds; runs on the dispatch worker pool.
    async fn handle_inbound(self: Arc<Self>, inbound: Inbound) {
        if *self.shutdown_tx.borrow() {
            return;
        }
        let envelope = inbound.envelope;
        let sender = envelope.sender_id;
        match envelope.kind {
            MessageKind::Heartbeat => self.health.record_heartbeat(sender),
            MessageKind::Election => {
                if let Ok(payload) = envelope.decode::<ElectionPayload>() {
                    let _ = self.election_tx.send(ElectionEvent::ElectionMessage {
                        from: sender,
                        term: payload.term,
                    });
                }
            }
            MessageKind::Alive => {
                if let Ok(payload) = envelope.decode::<AlivePayload>() {
                    let _ = self.election_tx.send(ElectionEvent::AliveMessage {
                        from: sender,
                        term: payload.term,
                    });
                }
            }
            MessageKind::Coordinator => {
                if let Ok(payload) = envelope.decode::<CoordinatorPayload>() {
                    let _ = self.election_tx.send(ElectionEvent::CoordinatorMessage {
                        coordinator_id: payload.coordinator_id,
                        term: payload.term,
                    });
                }
            }
            MessageKind::ClientRequest => {
                let Ok(payload) = envelope.decode::<ClientRequestPayload>() else {
                    return;
                };
                // runs a full transaction; detach so slow statements never
                // starve the dispatch pool that delivers their votes
                let node = Arc::clone(&self);
                let reply_sink = inbound.reply.clone();
                tokio::spawn(async move {
                    if sender == CLIENT_SENDER {
                        let reply = node
                            .execute_with_txn(payload.txn_id, &payload.statement)
                            .await;
                        match Envelope::new(node.config.node_id, MessageKind::ClientReply, &reply)
                        {
                            Ok(envelope) => {
                                let _ = reply_sink.send(envelope).await;
                            }
                            Err(e) => warn!("failed to encode client reply: {e}"),
                        }
                    } else {
                        let reply = node.handle_forwarded(payload).await;
                        node.send_to_peer(sender, MessageKind::ClientReply, &reply)
                            .await;
                    }
                });
            }
            MessageKind::ClientReply => {
                if let Ok(reply) = envelope.decode::<ClientReply>() {
                    if let Some(tx) = self.pending_replies.lock().remove(&reply.txn_id) {
                        let _ = tx.send(reply);
                    }
                }
            }
            MessageKind::Prepare => {
                let Ok(payload) = envelope.decode::<PreparePayload>() else {
                    return;
                };
                // may wait on table locks up to the lock timeout; detach
                let node = Arc::clone(&self);
                tokio::spawn(async move {
                    let vote = node
                        .participant
                        .prepare(&payload.txn_id, &payload.statement)
                        .await;
                    node.send_to_peer(
                        sender,
                        MessageKind::Vote,
                        &VotePayload {
                            txn_id: payload.txn_id,
                            vote,
                        },
                    )
                    .await;
                });
            }
            MessageKind::Vote => {
                if let Ok(payload) = envelope.decode::<VotePayload>() {
                    self.twopc.deliver_vote(&payload.txn_id, sender, payload.vote);
                }
            }
            MessageKind::Commit => {
                let Ok(payload) = envelope.decode::<CommitPayload>() else {
                    return;
                };
                match self.participant.commit(&payload.txn_id).await {
                    Ok(_) => {
                        self.send_to_peer(
                            sender,
                            MessageKind::Ack,
                            &AckPayload {
                                txn_id: payload.txn_id,
                            },
                        )
                        .await;
                    }
                    Err(e) => warn!("commit of {} failed: {e}", payload.txn_id),
                }
            }
            MessageKind::Abort => {
                let Ok(payload) = envelope.decode::<crate::message::AbortPayload>() else {
                    return;
                };
                self.participant.abort(&payload.txn_id).await;
                self.send_to_peer(
                    sender,
                    MessageKind::Ack,
                    &AckPayload {
                        txn_id: payload.txn_id,
                    },
                )
                .await;
            }
            MessageKind::Ack => {
                if let Ok(payload) = envelope.decode::<AckPayload>() {
                    self.twopc.deliver_ack(&payload.txn_id, sender);
                }
            }
            MessageKind::ExecuteRead => {
                let Ok(payload) = envelope.decode::<ExecuteReadPayload>() else {
                    return;
                };
                let reply = self.local_read(&payload.txn_id, &payload.statement).await;
                let result = ReadResultPayload {
                    txn_id: payload.txn_id,
                    ok: reply.ok,
                    rows: reply.rows.unwrap_or_default(),
                    error: reply.error.map(|e| e.message),
                };
                self.send_to_peer(sender, MessageKind::ReadResult, &result)
                    .await;
            }
            MessageKind::ReadResult => {
                if let Ok(payload) = envelope.decode::<ReadResultPayload>() {
                    if let Some(tx) = self.pending_reads.lock().remove(&payload.txn_id) {
                        let _ = tx.send(payload);
                    }
                }
            }
            MessageKind::TxnStatus => {
                let Ok(payload) = envelope.decode::<TxnStatusPayload>() else {
                    return;
                };
                let outcome = match self.participant.log().status_of(&payload.txn_id).await {
                    Ok(Some(TxnLogStatus::Committed)) => TxnOutcome::Committed,
                    Ok(Some(TxnLogStatus::Aborted)) => TxnOutcome::Aborted,
                    _ => TxnOutcome::Unknown,
                };
                self.send_to_peer(
                    sender,
                    MessageKind::TxnStatusReply,
                    &TxnStatusReplyPayload {
                        txn_id: payload.txn_id,
                        outcome,
                    },
                )
                .await;
            }
            MessageKind::TxnStatusReply => {
                if let Ok(payload) = envelope.decode::<TxnStatusReplyPayload>() {
                    if let Some(tx) = self.pending_status.lock().remove(&payload.txn_id) {
                        let _ = tx.send(payload.outcome);
                    }
                }
            }
        }
    }

    /// A peer forwarded a client statement; serve it if we are the
    /// coordinator.
    async fn handle_forwarded(self: &Arc<Self>, payload: ClientRequestPayload) -> ClientReply {
        let snapshot = self.view.snapshot();
        if snapshot.coordinator != Some(self.config.node_id) {
            return ClientReply::failure(
                payload.txn_id,
                self.config.node_id,
                ErrorCode::Unavailable,
                "not the coordinator",
            );
        }
        match statement::classify(&payload.statement) {
            Ok(kind) => {
                self.coordinate(&payload.txn_id, &payload.statement, kind)
                    .await
            }
            Err(e) => ClientReply::failure(
                payload.txn_id,
                self.config.node_id,
                ErrorCode::BadStatement,
                e.to_string(),
            ),
        }
    }

    async fn send_to_peer<T: Serialize>(&self, peer: NodeId, kind: MessageKind, payload: &T) {
        match Envelope::new(self.config.node_id, kind, payload) {
            Ok(envelope) => {
                if let Err(e) = self.messenger.send(peer, &envelope).await {
                    debug!("{kind:?} to {peer} failed: {e}");
                }
            }
            Err(e) => warn!("failed to encode {kind:?}: {e}"),
        }
    }

    /// Forward health transitions to the election engine and fail waits
    /// that can no longer complete.
    async fn run_health_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<HealthEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(HealthEvent::CoordinatorLost { term }) => {
                        let _ = self
                            .election_tx
                            .send(ElectionEvent::CoordinatorLost { term });
                    }
                    Some(HealthEvent::PeerDown(node_id)) => {
                        if self.view.snapshot().coordinator == Some(node_id) {
                            self.fail_pending_unavailable();
                        }
                    }
                    Some(HealthEvent::PeerUp(_)) => {}
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn fail_pending_unavailable(&self) {
        let drained: Vec<(String, oneshot::Sender<ClientReply>)> =
            self.pending_replies.lock().drain().collect();
        for (txn_id, tx) in drained {
            let reply = ClientReply::failure(
                txn_id,
                self.config.node_id,
                ErrorCode::Unavailable,
                "coordinator lost",
            );
            let _ = tx.send(reply);
        }
    }

    /// Resolve PREPARING journal rows left by a previous run of this node.
    async fn run_recovery(self: Arc<Self>) {
        let unresolved = match self.participant.unresolved().await {
            Ok(unresolved) if !unresolved.is_empty() => unresolved,
            _ => return,
        };
        info!(
            "recovering {} in-doubt transaction(s) from the journal",
            unresolved.len()
        );

        // wait for an elected coordinator to ask
        let deadline =
            tokio::time::Instant::now() + self.config.client_reply_timeout();
        let coordinator = loop {
            let snapshot = self.view.snapshot();
            if let Some(coordinator) = snapshot.coordinator {
                break Some(coordinator);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        };

        for txn in unresolved {
            let outcome = match coordinator {
                Some(c) if c == self.config.node_id => {
                    // our own journal is the best record we have
                    match self.participant.log().status_of(&txn.txn_id).await {
                        Ok(Some(TxnLogStatus::Committed)) => TxnOutcome::Committed,
                        Ok(Some(TxnLogStatus::Aborted)) => TxnOutcome::Aborted,
                        _ => TxnOutcome::Unknown,
                    }
                }
                Some(c) => self.query_txn_status(c, &txn.txn_id).await,
                None => TxnOutcome::Unknown,
            };
            self.participant.resolve_recovered(&txn, outcome).await;
        }
    }

    async fn query_txn_status(&self, coordinator: NodeId, txn_id: &str) -> TxnOutcome {
        let (tx, rx) = oneshot::channel();
        self.pending_status.lock().insert(txn_id.to_string(), tx);
        let payload = TxnStatusPayload {
            txn_id: txn_id.to_string(),
        };
        let envelope = match Envelope::new(self.config.node_id, MessageKind::TxnStatus, &payload) {
            Ok(envelope) => envelope,
            Err(_) => {
                self.pending_status.lock().remove(txn_id);
                return TxnOutcome::Unknown;
            }
        };
        if self.messenger.send(coordinator, &envelope).await.is_err() {
            self.pending_status.lock().remove(txn_id);
            return TxnOutcome::Unknown;
        }
        match tokio::time::timeout(self.config.client_reply_timeout(), rx).await {
            Ok(Ok(outcome)) => outcome,
            _ => {
                self.pending_status.lock().remove(txn_id);
                TxnOutcome::Unknown
            }
        }
    }
}

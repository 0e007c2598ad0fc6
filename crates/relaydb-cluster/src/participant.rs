//! Participant side of two-phase commit.
//!
//! `prepare` takes the table lock, runs the statement inside an open
//! backend session, validates it, and leaves the session pinned; the
//! decision later commits or rolls it back. Every step is journaled in
//! the local transactions_log. A prepared transaction that never hears a
//! decision aborts unilaterally after the phase timeout, and PREPARING
//! journal rows found at startup are resolved against the coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relaydb_core::backend::pool::{BackendPool, PooledSession};
use relaydb_core::backend::{Backend, BackendSession};
use relaydb_core::statement;
use relaydb_core::txnlog::{TxnLogStatus, TxnLogStore, UnresolvedTxn};
use tracing::{debug, info, warn};

use crate::config::NodeId;
use crate::error::{ClusterError, Result};
use crate::locks::{LockGrant, LockManager, LockMode};
use crate::message::{TxnOutcome, Vote};

/// Lock target for statements whose table cannot be parsed; serializes
/// them against everything.
pub const GLOBAL_LOCK_TABLE: &str = "__all_tables";

struct PreparedTxn<B: Backend> {
    session: PooledSession<B>,
    keyword: String,
    statement: String,
    affected: u64,
}

/// Local 2PC participant; one per node, shared between the inbound
/// message handlers and the coordinator's in-process fast path.
pub struct Participant<B: Backend> {
    node_id: NodeId,
    pool: BackendPool<B>,
    locks: Arc<LockManager>,
    log: TxnLogStore<B>,
    lock_timeout: Duration,
    phase_timeout: Duration,
    prepared: Mutex<HashMap<String, PreparedTxn<B>>>,
    /// Statements seen at prepare, kept so an abort after a failed or
    /// timed-out prepare can still journal the text.
    seen: Mutex<HashMap<String, (String, String)>>,
}

impl<B: Backend> Participant<B> {
    pub fn new(
        node_id: NodeId,
        pool: BackendPool<B>,
        locks: Arc<LockManager>,
        lock_timeout: Duration,
        phase_timeout: Duration,
    ) -> Self {
        let log = TxnLogStore::new(pool.clone(), node_id);
        Participant {
            node_id,
            pool,
            locks,
            log,
            lock_timeout,
            phase_timeout,
            prepared: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &TxnLogStore<B> {
        &self.log
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn has_prepared(&self, txn_id: &str) -> bool {
        self.prepared.lock().contains_key(txn_id)
    }

    /// Phase 1: lock, execute, validate; vote YES with the session pinned.
    pub async fn prepare(self: &Arc<Self>, txn_id: &str, stmt: &str) -> Vote {
        if self.has_prepared(txn_id) {
            return Vote::Yes;
        }
        let keyword = statement::keyword(stmt);
        self.seen
            .lock()
            .insert(txn_id.to_string(), (keyword.clone(), stmt.to_string()));

        let table =
            statement::target_table(stmt).unwrap_or_else(|| GLOBAL_LOCK_TABLE.to_string());
        match self
            .locks
            .acquire(txn_id, &table, LockMode::Exclusive, self.lock_timeout)
            .await
        {
            LockGrant::Granted => {}
            LockGrant::Timeout => {
                warn!("txn {txn_id}: lock timeout on {table}, voting NO");
                return Vote::No;
            }
        }

        self.log
            .record(txn_id, &keyword, stmt, TxnLogStatus::Preparing)
            .await;

        let mut session = match self.pool.acquire().await {
            Ok(session) => session,
            Err(e) => {
                warn!("txn {txn_id}: no backend session ({e}), voting NO");
                self.locks.release_all(txn_id);
                return Vote::No;
            }
        };
        let executed = session
            .execute(stmt)
            .and_then(|affected| session.prepare().map(|_| affected));
        let affected = match executed {
            Ok(affected) => affected,
            Err(e) => {
                warn!("txn {txn_id}: prepare failed ({e}), voting NO");
                self.locks.release_all(txn_id);
                return Vote::No;
            }
        };

        self.prepared.lock().insert(
            txn_id.to_string(),
            PreparedTxn {
                session,
                keyword,
                statement: stmt.to_string(),
                affected,
            },
        );
        self.spawn_phase_watchdog(txn_id.to_string());
        debug!("txn {txn_id}: prepared, voting YES");
        Vote::Yes
    }

    /// Phase 2, commit decision: apply the pinned session and journal.
    pub async fn commit(&self, txn_id: &str) -> Result<u64> {
        let mut prepared = match self.prepared.lock().remove(txn_id) {
            Some(prepared) => prepared,
            None => {
                return Err(ClusterError::Transport(format!(
                    "txn {txn_id} is not prepared on node {}",
                    self.node_id
                )))
            }
        };
        self.seen.lock().remove(txn_id);

        let applied = prepared.session.commit();
        match applied {
            Ok(_) => {
                self.log
                    .record(
                        txn_id,
                        &prepared.keyword,
                        &prepared.statement,
                        TxnLogStatus::Committed,
                    )
                    .await;
                self.locks.release_all(txn_id);
                info!("txn {txn_id}: committed");
                Ok(prepared.affected)
            }
            Err(e) => {
                self.locks.release_all(txn_id);
                warn!("txn {txn_id}: commit failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Phase 2, abort decision: roll back and journal, idempotently.
    pub async fn abort(&self, txn_id: &str) {
        let removed = self.prepared.lock().remove(txn_id);
        let (keyword, stmt) = match &removed {
            Some(prepared) => (prepared.keyword.clone(), prepared.statement.clone()),
            None => self
                .seen
                .lock()
                .get(txn_id)
                .cloned()
                .unwrap_or_else(|| ("UNKNOWN".to_string(), String::new())),
        };
        if let Some(mut prepared) = removed {
            if let Err(e) = prepared.session.rollback() {
                warn!("txn {txn_id}: rollback failed: {e}");
            }
        }
        self.seen.lock().remove(txn_id);
        self.log
            .record(txn_id, &keyword, &stmt, TxnLogStatus::Aborted)
            .await;
        self.locks.release_all(txn_id);
        info!("txn {txn_id}: aborted");
    }

    /// PREPARING journal rows left over from a previous run.
    pub async fn unresolved(&self) -> Result<Vec<UnresolvedTxn>> {
        Ok(self.log.unresolved().await?)
    }

    /// Finalize an in-doubt transaction from the coordinator's answer.
    /// The pinned session died with the old process, so a COMMITTED
    /// outcome re-executes the journaled statement.
    pub async fn resolve_recovered(&self, txn: &UnresolvedTxn, outcome: TxnOutcome) {
        match outcome {
            TxnOutcome::Committed => {
                info!("txn {}: recovering COMMITTED outcome", txn.txn_id);
                match self.pool.acquire().await {
                    Ok(mut session) => {
                        let applied = session
                            .execute(&txn.query_text)
                            .and_then(|_| session.commit());
                        match applied {
                            Ok(_) => {
                                self.log
                                    .record(
                                        &txn.txn_id,
                                        &txn.query_type,
                                        &txn.query_text,
                                        TxnLogStatus::Committed,
                                    )
                                    .await;
                            }
                            Err(e) => {
                                warn!("txn {}: recovery replay failed: {e}", txn.txn_id)
                            }
                        }
                    }
                    Err(e) => warn!("txn {}: recovery replay failed: {e}", txn.txn_id),
                }
            }
            TxnOutcome::Aborted | TxnOutcome::Unknown => {
                info!(
                    "txn {}: resolving in-doubt prepare as ABORTED ({outcome:?})",
                    txn.txn_id
                );
                self.log
                    .record(
                        &txn.txn_id,
                        &txn.query_type,
                        &txn.query_text,
                        TxnLogStatus::Aborted,
                    )
                    .await;
            }
        }
    }

    /// Roll back everything still pinned (cooperative shutdown).
    pub fn abandon_all(&self) {
        let drained: Vec<(String, PreparedTxn<B>)> = self.prepared.lock().drain().collect();
        for (txn_id, mut prepared) in drained {
            let _ = prepared.session.rollback();
            self.locks.release_all(&txn_id);
        }
        self.seen.lock().clear();
    }

    /// A prepared transaction with no decision aborts on its own once the
    /// phase timeout expires.
    fn spawn_phase_watchdog(self: &Arc<Self>, txn_id: String) {
        let participant = Arc::clone(self);
        let timeout = self.phase_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if participant.has_prepared(&txn_id) {
                warn!("txn {txn_id}: no decision within {timeout:?}, aborting unilaterally");
                participant.abort(&txn_id).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaydb_core::backend::pool::PoolConfig;
    use relaydb_core::MemoryBackend;

    fn participant(backend: MemoryBackend) -> Arc<Participant<MemoryBackend>> {
        let pool = BackendPool::new(backend, PoolConfig::default());
        Arc::new(Participant::new(
            1,
            pool,
            Arc::new(LockManager::new()),
            Duration::from_millis(200),
            Duration::from_millis(500),
        ))
    }

    fn select(backend: &MemoryBackend, sql: &str) -> Vec<Vec<String>> {
        backend.begin().unwrap().query(sql).unwrap()
    }

    #[tokio::test]
    async fn test_prepare_commit_applies_and_journals() {
        let backend = MemoryBackend::new(1, 1);
        let p = participant(backend.clone());

        let vote = p
            .prepare("TXN-1-a", "INSERT INTO users (name) VALUES ('X')")
            .await;
        assert_eq!(vote, Vote::Yes);
        assert!(p.has_prepared("TXN-1-a"));
        // not visible before the decision
        assert!(select(&backend, "SELECT name FROM users").is_empty());

        let affected = p.commit("TXN-1-a").await.unwrap();
        assert_eq!(affected, 1);
        assert_eq!(select(&backend, "SELECT name FROM users").len(), 1);
        assert_eq!(
            p.log().status_of("TXN-1-a").await.unwrap(),
            Some(TxnLogStatus::Committed)
        );
        assert!(!p.locks().holds("TXN-1-a", "users"));
    }

    #[tokio::test]
    async fn test_prepare_failure_votes_no_and_releases_lock() {
        let backend = MemoryBackend::new(1, 1);
        backend.add_unique("users", "email");
        {
            let mut s = backend.begin().unwrap();
            s.execute("INSERT INTO users (email) VALUES ('a@e')").unwrap();
            s.commit().unwrap();
        }
        let p = participant(backend.clone());

        let vote = p
            .prepare("TXN-2-b", "INSERT INTO users (email) VALUES ('a@e')")
            .await;
        assert_eq!(vote, Vote::No);
        assert!(!p.has_prepared("TXN-2-b"));
        assert!(!p.locks().holds("TXN-2-b", "users"));

        p.abort("TXN-2-b").await;
        assert_eq!(
            p.log().status_of("TXN-2-b").await.unwrap(),
            Some(TxnLogStatus::Aborted)
        );
    }

    #[tokio::test]
    async fn test_abort_rolls_back_prepared_session() {
        let backend = MemoryBackend::new(1, 1);
        let p = participant(backend.clone());
        p.prepare("TXN-3-c", "INSERT INTO users (name) VALUES ('X')")
            .await;
        p.abort("TXN-3-c").await;
        assert!(select(&backend, "SELECT name FROM users").is_empty());
        assert_eq!(
            p.log().status_of("TXN-3-c").await.unwrap(),
            Some(TxnLogStatus::Aborted)
        );
    }

    #[tokio::test]
    async fn test_undecided_prepare_aborts_after_phase_timeout() {
        let backend = MemoryBackend::new(1, 1);
        let p = participant(backend.clone());
        p.prepare("TXN-4-d", "INSERT INTO users (name) VALUES ('X')")
            .await;
        assert!(p.has_prepared("TXN-4-d"));

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!p.has_prepared("TXN-4-d"));
        assert!(!p.locks().holds("TXN-4-d", "users"));
        assert_eq!(
            p.log().status_of("TXN-4-d").await.unwrap(),
            Some(TxnLogStatus::Aborted)
        );
    }

    #[tokio::test]
    async fn test_recovery_replays_committed_outcome() {
        let backend = MemoryBackend::new(1, 1);
        let p = participant(backend.clone());
        // simulate a crash after PREPARING was journaled
        p.log()
            .record(
                "TXN-5-e",
                "INSERT",
                "INSERT INTO users (name) VALUES ('R')",
                TxnLogStatus::Preparing,
            )
            .await;

        let unresolved = p.unresolved().await.unwrap();
        assert_eq!(unresolved.len(), 1);
        p.resolve_recovered(&unresolved[0], TxnOutcome::Committed).await;

        assert_eq!(select(&backend, "SELECT name FROM users").len(), 1);
        assert_eq!(
            p.log().status_of("TXN-5-e").await.unwrap(),
            Some(TxnLogStatus::Committed)
        );
        assert!(p.unresolved().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_aborts_unknown_outcome() {
        let backend = MemoryBackend::new(1, 1);
        let p = participant(backend.clone());
        p.log()
            .record("TXN-6-f", "INSERT", "stmt", TxnLogStatus::Preparing)
            .await;
        let unresolved = p.unresolved().await.unwrap();
        p.resolve_recovered(&unresolved[0], TxnOutcome::Unknown).await;
        assert_eq!(
            p.log().status_of("TXN-6-f").await.unwrap(),
            Some(TxnLogStatus::Aborted)
        );
    }
}

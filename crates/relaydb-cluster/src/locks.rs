//! Table-level lock manager.
//!
//! Per table: a held set and a FIFO waiter queue. SHARED/SHARED is the only
//! compatible pair; grants are strictly in queue order (no barging). A
//! transaction that already holds a lock on a table re-enters freely, and
//! may upgrade while it is the sole holder. Waiting is bounded; timeouts
//! return a structured result and remove the waiter from the queue. There
//! is no deadlock detection — timeouts break cycles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    Granted,
    Timeout,
}

struct Waiter {
    id: u64,
    txn_id: String,
    mode: LockMode,
    notify: oneshot::Sender<()>,
}

#[derive(Default)]
struct TableLock {
    holders: Vec<(String, LockMode)>,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, TableLock>,
    by_txn: HashMap<String, HashSet<String>>,
    next_waiter_id: u64,
}

/// Node-local lock table. Writes are globally serialized through the
/// coordinator, so contention is between concurrent write sessions on the
/// coordinator and local reads dispatched here.
#[derive(Default)]
pub struct LockManager {
    state: Mutex<State>,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager::default()
    }

    /// Acquire a lock, waiting in FIFO order up to `timeout`.
    pub async fn acquire(
        &self,
        txn_id: &str,
        table: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> LockGrant {
        let (waiter_id, rx) = {
            let mut guard = self.state.lock();
            let State {
                tables,
                by_txn,
                next_waiter_id,
            } = &mut *guard;
            let entry = tables.entry(table.to_string()).or_default();

            let reentrant = entry.holders.iter().any(|(t, _)| t == txn_id);
            let can_grant = if reentrant {
                compatible(&entry.holders, txn_id, mode)
            } else {
                entry.waiters.is_empty() && compatible(&entry.holders, txn_id, mode)
            };
            if can_grant {
                entry.holders.push((txn_id.to_string(), mode));
                by_txn
                    .entry(txn_id.to_string())
                    .or_default()
                    .insert(table.to_string());
                return LockGrant::Granted;
            }

            let (tx, rx) = oneshot::channel();
            let id = *next_waiter_id;
            *next_waiter_id += 1;
            entry.waiters.push_back(Waiter {
                id,
                txn_id: txn_id.to_string(),
                mode,
                notify: tx,
            });
            (id, rx)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => LockGrant::Granted,
            _ => {
                let mut state = self.state.lock();
                let mut removed = false;
                if let Some(entry) = state.tables.get_mut(table) {
                    let before = entry.waiters.len();
                    entry.waiters.retain(|w| w.id != waiter_id);
                    removed = entry.waiters.len() < before;
                }
                if removed {
                    // a timed-out head may have been blocking compatible
                    // waiters behind it
                    promote(&mut state, table);
                    debug!("txn {txn_id} timed out waiting for {mode:?} on {table}");
                    return LockGrant::Timeout;
                }
                // the grant raced the timeout and won
                if state
                    .by_txn
                    .get(txn_id)
                    .map(|tables| tables.contains(table))
                    .unwrap_or(false)
                {
                    LockGrant::Granted
                } else {
                    LockGrant::Timeout
                }
            }
        }
    }

    /// Release every lock held by a transaction and promote waiters FIFO.
    pub fn release_all(&self, txn_id: &str) {
        let mut state = self.state.lock();
        let Some(tables) = state.by_txn.remove(txn_id) else {
            return;
        };
        for table in tables {
            if let Some(entry) = state.tables.get_mut(&table) {
                entry.holders.retain(|(t, _)| t != txn_id);
            }
            promote(&mut state, &table);
            if let Some(entry) = state.tables.get(&table) {
                if entry.holders.is_empty() && entry.waiters.is_empty() {
                    state.tables.remove(&table);
                }
            }
        }
    }

    /// Whether a transaction holds any lock on a table.
    pub fn holds(&self, txn_id: &str, table: &str) -> bool {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|entry| entry.holders.iter().any(|(t, _)| t == txn_id))
            .unwrap_or(false)
    }

    /// Number of tables with at least one holder or waiter.
    pub fn locked_tables(&self) -> usize {
        self.state.lock().tables.len()
    }
}

fn compatible(holders: &[(String, LockMode)], txn_id: &str, mode: LockMode) -> bool {
    if holders.is_empty() {
        return true;
    }
    if holders.iter().any(|(t, _)| t == txn_id) {
        return match mode {
            LockMode::Shared => true,
            LockMode::Exclusive => holders.iter().all(|(t, _)| t == txn_id),
        };
    }
    match mode {
        LockMode::Shared => holders.iter().all(|(_, m)| *m == LockMode::Shared),
        LockMode::Exclusive => false,
    }
}

fn promote(state: &mut State, table: &str) {
    let Some(entry) = state.tables.get_mut(table) else {
        return;
    };
    let mut granted: Vec<(String, LockMode)> = Vec::new();
    while let Some(front) = entry.waiters.front() {
        if !compatible(&entry.holders, &front.txn_id, front.mode) {
            break;
        }
        let waiter = match entry.waiters.pop_front() {
            Some(w) => w,
            None => break,
        };
        // a dropped receiver means the waiter timed out; skip it
        if waiter.notify.send(()).is_ok() {
            entry.holders.push((waiter.txn_id.clone(), waiter.mode));
            granted.push((waiter.txn_id, waiter.mode));
        }
    }
    for (txn_id, _) in granted {
        state
            .by_txn
            .entry(txn_id)
            .or_default()
            .insert(table.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const T: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let locks = LockManager::new();
        assert_eq!(locks.acquire("t1", "users", LockMode::Shared, T).await, LockGrant::Granted);
        assert_eq!(locks.acquire("t2", "users", LockMode::Shared, T).await, LockGrant::Granted);
        locks.release_all("t1");
        locks.release_all("t2");
        assert_eq!(locks.locked_tables(), 0);
    }

    #[tokio::test]
    async fn test_exclusive_conflicts_until_release() {
        let locks = Arc::new(LockManager::new());
        assert_eq!(
            locks.acquire("t1", "users", LockMode::Exclusive, T).await,
            LockGrant::Granted
        );

        let locks2 = Arc::clone(&locks);
        let waiter =
            tokio::spawn(
                async move { locks2.acquire("t2", "users", LockMode::Exclusive, T).await },
            );
        tokio::time::sleep(Duration::from_millis(50)).await;
        locks.release_all("t1");
        assert_eq!(waiter.await.unwrap(), LockGrant::Granted);
        assert!(locks.holds("t2", "users"));
    }

    #[tokio::test]
    async fn test_timeout_returns_structured_result() {
        let locks = LockManager::new();
        locks.acquire("t1", "users", LockMode::Exclusive, T).await;
        let grant = locks
            .acquire("t2", "users", LockMode::Shared, Duration::from_millis(50))
            .await;
        assert_eq!(grant, LockGrant::Timeout);
        assert!(!locks.holds("t2", "users"));
    }

    #[tokio::test]
    async fn test_fifo_grant_order_without_barging() {
        let locks = Arc::new(LockManager::new());
        locks.acquire("t1", "users", LockMode::Exclusive, T).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for name in ["t2", "t3", "t4"] {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let grant = locks.acquire(name, "users", LockMode::Exclusive, T).await;
                assert_eq!(grant, LockGrant::Granted);
                order.lock().push(name.to_string());
                locks.release_all(name);
            }));
            // establish queue order deterministically
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        locks.release_all("t1");
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["t2", "t3", "t4"]);
    }

    #[tokio::test]
    async fn test_shared_waiters_promoted_together() {
        let locks = Arc::new(LockManager::new());
        locks.acquire("w", "users", LockMode::Exclusive, T).await;

        let mut handles = Vec::new();
        for name in ["r1", "r2"] {
            let locks = Arc::clone(&locks);
            handles.push(tokio::spawn(async move {
                locks.acquire(name, "users", LockMode::Shared, T).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        locks.release_all("w");
        for handle in handles {
            assert_eq!(handle.await.unwrap(), LockGrant::Granted);
        }
        assert!(locks.holds("r1", "users") && locks.holds("r2", "users"));
    }

    #[tokio::test]
    async fn test_reentrant_acquire() {
        let locks = LockManager::new();
        locks.acquire("t1", "users", LockMode::Exclusive, T).await;
        assert_eq!(
            locks.acquire("t1", "users", LockMode::Exclusive, T).await,
            LockGrant::Granted
        );
        locks.release_all("t1");
        assert!(!locks.holds("t1", "users"));
    }

    #[tokio::test]
    async fn test_disjoint_tables_do_not_conflict() {
        let locks = LockManager::new();
        assert_eq!(
            locks.acquire("t1", "users", LockMode::Exclusive, T).await,
            LockGrant::Granted
        );
        assert_eq!(
            locks.acquire("t2", "orders", LockMode::Exclusive, T).await,
            LockGrant::Granted
        );
    }
}

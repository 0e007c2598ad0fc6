//! Per-node `transactions_log` access.
//!
//! Every participant persists a row at prepare and again at commit/abort;
//! the rows double as the recovery journal for in-doubt transactions. The
//! log lives in the backend itself, written through the same session
//! interface as client statements:
//!
//! `transactions_log(id, transaction_id, query_type, query_text, status,
//! node_id, created_at)`
//!
//! `id` is auto-assigned by the backend with stride = cluster size and
//! offset = node id, so rows created on different replicas never collide.

use tracing::warn;

use crate::backend::pool::BackendPool;
use crate::backend::{Backend, BackendSession};
use crate::error::Result;
use crate::statement::quote;

pub const TXN_LOG_TABLE: &str = "transactions_log";

/// Terminal and in-flight statuses recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnLogStatus {
    Preparing,
    Committed,
    Aborted,
}

impl TxnLogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnLogStatus::Preparing => "PREPARING",
            TxnLogStatus::Committed => "COMMITTED",
            TxnLogStatus::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PREPARING" => Some(TxnLogStatus::Preparing),
            "COMMITTED" => Some(TxnLogStatus::Committed),
            "ABORTED" => Some(TxnLogStatus::Aborted),
            _ => None,
        }
    }
}

/// A transaction whose last logged status is still PREPARING.
#[derive(Debug, Clone)]
pub struct UnresolvedTxn {
    pub txn_id: String,
    pub query_type: String,
    pub query_text: String,
}

/// Writer/reader for this node's transactions_log.
pub struct TxnLogStore<B: Backend> {
    pool: BackendPool<B>,
    node_id: u32,
}

impl<B: Backend> Clone for TxnLogStore<B> {
    fn clone(&self) -> Self {
        TxnLogStore {
            pool: self.pool.clone(),
            node_id: self.node_id,
        }
    }
}

impl<B: Backend> TxnLogStore<B> {
    pub fn new(pool: BackendPool<B>, node_id: u32) -> Self {
        TxnLogStore { pool, node_id }
    }

    /// Append one log row. Log failures are reported but never escalate:
    /// losing a journal row must not fail the transaction it describes.
    pub async fn record(
        &self,
        txn_id: &str,
        query_type: &str,
        query_text: &str,
        status: TxnLogStatus,
    ) {
        if let Err(e) = self.try_record(txn_id, query_type, query_text, status).await {
            warn!("failed to log {} for {txn_id}: {e}", status.as_str());
        }
    }

    async fn try_record(
        &self,
        txn_id: &str,
        query_type: &str,
        query_text: &str,
        status: TxnLogStatus,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {TXN_LOG_TABLE} (transaction_id, query_type, query_text, status, node_id, created_at) VALUES ({}, {}, {}, {}, {}, {})",
            quote(txn_id),
            quote(query_type),
            quote(query_text),
            quote(status.as_str()),
            quote(&self.node_id.to_string()),
            quote(&current_time_ms().to_string()),
        );
        let mut session = self.pool.acquire().await?;
        session.execute(&sql)?;
        session.commit()?;
        Ok(())
    }

    /// Transactions whose most recent row on this node is PREPARING.
    pub async fn unresolved(&self) -> Result<Vec<UnresolvedTxn>> {
        let sql = format!(
            "SELECT transaction_id, query_type, query_text, status FROM {TXN_LOG_TABLE} WHERE node_id={}",
            quote(&self.node_id.to_string()),
        );
        let mut session = self.pool.acquire().await?;
        let rows = session.query(&sql)?;

        // Rows are in insertion order; the last row per txn wins.
        let mut latest: Vec<(String, UnresolvedTxn, TxnLogStatus)> = Vec::new();
        for row in rows {
            let [txn_id, query_type, query_text, status] = match row.as_slice() {
                [a, b, c, d] => [a.clone(), b.clone(), c.clone(), d.clone()],
                _ => continue,
            };
            let Some(status) = TxnLogStatus::parse(&status) else {
                continue;
            };
            let entry = (
                txn_id.clone(),
                UnresolvedTxn {
                    txn_id,
                    query_type,
                    query_text,
                },
                status,
            );
            if let Some(existing) = latest.iter_mut().find(|(id, _, _)| *id == entry.0) {
                *existing = entry;
            } else {
                latest.push(entry);
            }
        }
        Ok(latest
            .into_iter()
            .filter(|(_, _, status)| *status == TxnLogStatus::Preparing)
            .map(|(_, txn, _)| txn)
            .collect())
    }

    /// Most recent logged status for a transaction on this node.
    pub async fn status_of(&self, txn_id: &str) -> Result<Option<TxnLogStatus>> {
        let sql = format!(
            "SELECT status FROM {TXN_LOG_TABLE} WHERE transaction_id={}",
            quote(txn_id),
        );
        let mut session = self.pool.acquire().await?;
        let rows = session.query(&sql)?;
        Ok(rows
            .last()
            .and_then(|row| row.first())
            .and_then(|s| TxnLogStatus::parse(s)))
    }
}

pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::pool::PoolConfig;

    fn store() -> TxnLogStore<MemoryBackend> {
        let pool = BackendPool::new(MemoryBackend::new(3, 1), PoolConfig::default());
        TxnLogStore::new(pool, 1)
    }

    #[tokio::test]
    async fn test_record_and_status() {
        let log = store();
        log.record("TXN-1-a", "INSERT", "INSERT INTO t (a) VALUES ('x')", TxnLogStatus::Preparing)
            .await;
        assert_eq!(
            log.status_of("TXN-1-a").await.unwrap(),
            Some(TxnLogStatus::Preparing)
        );
        log.record("TXN-1-a", "INSERT", "INSERT INTO t (a) VALUES ('x')", TxnLogStatus::Committed)
            .await;
        assert_eq!(
            log.status_of("TXN-1-a").await.unwrap(),
            Some(TxnLogStatus::Committed)
        );
        assert_eq!(log.status_of("TXN-2-b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unresolved_reports_only_last_preparing() {
        let log = store();
        log.record("TXN-1-a", "INSERT", "stmt a", TxnLogStatus::Preparing)
            .await;
        log.record("TXN-1-a", "INSERT", "stmt a", TxnLogStatus::Committed)
            .await;
        log.record("TXN-2-b", "UPDATE", "stmt b", TxnLogStatus::Preparing)
            .await;

        let unresolved = log.unresolved().await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].txn_id, "TXN-2-b");
        assert_eq!(unresolved[0].query_text, "stmt b");
    }

    #[tokio::test]
    async fn test_statement_text_with_quotes_round_trips() {
        let log = store();
        let stmt = "INSERT INTO users (name) VALUES ('o''brien')";
        log.record("TXN-3-c", "INSERT", stmt, TxnLogStatus::Preparing)
            .await;
        let unresolved = log.unresolved().await.unwrap();
        assert_eq!(unresolved[0].query_text, stmt);
    }
}

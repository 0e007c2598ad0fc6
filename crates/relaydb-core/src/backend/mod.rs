//! The backend seam.
//!
//! The middleware talks to its co-located relational engine only through
//! these two traits. `prepare` runs the buffered statement inside an open
//! transaction without committing, so a participant can vote before the
//! coordinator's decision arrives; the session stays pinned until
//! `commit` or `rollback`.

pub mod memory;
pub mod pool;

use crate::error::Result;

/// One result row, column values rendered as strings.
pub type Row = Vec<String>;

/// A relational backend reachable from this node.
pub trait Backend: Send + Sync + 'static {
    type Session: BackendSession;

    /// Open a session with an implicit transaction.
    fn begin(&self) -> Result<Self::Session>;

    /// Liveness probe for the underlying engine.
    fn ping(&self) -> bool;
}

/// A single backend transaction.
///
/// Dropping a session without committing discards its buffered work.
pub trait BackendSession: Send + 'static {
    /// Run a write statement; returns affected row count.
    fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Run a read statement against committed state.
    fn query(&mut self, sql: &str) -> Result<Vec<Row>>;

    /// Validate the buffered statements (constraints, lock violations)
    /// without committing. After a successful prepare the session must be
    /// finished with `commit` or `rollback`.
    fn prepare(&mut self) -> Result<()>;

    /// Atomically apply the buffered statements; returns total affected rows.
    fn commit(&mut self) -> Result<u64>;

    /// Discard the buffered statements.
    fn rollback(&mut self) -> Result<()>;
}

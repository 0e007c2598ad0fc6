pub mod backend;
pub mod error;
pub mod statement;
pub mod txnlog;

pub use crate::backend::memory::MemoryBackend;
pub use crate::backend::pool::{BackendPool, PoolConfig, PooledSession};
pub use crate::backend::{Backend, BackendSession, Row};
pub use crate::error::{CoreError, Result};
pub use crate::statement::StatementKind;
pub use crate::txnlog::{TxnLogStatus, TxnLogStore, UnresolvedTxn};

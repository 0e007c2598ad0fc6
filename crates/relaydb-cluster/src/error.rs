//! Control-plane error types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::NodeId;

/// Errors that can occur in the distributed layer.
#[derive(Debug)]
pub enum ClusterError {
    /// Error from the backend seam.
    Core(relaydb_core::CoreError),
    /// Transport/framing error.
    Transport(String),
    /// A peer could not be reached.
    Unreachable(NodeId),
    /// Frame integrity check failed.
    ChecksumMismatch,
    /// Frame exceeds the wire limit.
    FrameTooLarge(usize),
    /// An outbound wait expired.
    Timeout(String),
    /// No coordinator is currently known.
    NoCoordinator,
    /// Lock acquisition exceeded its budget.
    LockTimeout { table: String },
    /// Configuration problem.
    Config(String),
    /// Raw IO error.
    Io(std::io::Error),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Core(e) => write!(f, "core: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Unreachable(id) => write!(f, "peer {id} unreachable"),
            Self::ChecksumMismatch => write!(f, "frame checksum mismatch"),
            Self::FrameTooLarge(n) => write!(f, "frame of {n} bytes exceeds limit"),
            Self::Timeout(e) => write!(f, "timeout: {e}"),
            Self::NoCoordinator => write!(f, "no coordinator available"),
            Self::LockTimeout { table } => write!(f, "lock timeout on table {table}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<relaydb_core::CoreError> for ClusterError {
    fn from(e: relaydb_core::CoreError) -> Self {
        Self::Core(e)
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Result alias for control-plane operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Stable error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadStatement,
    LockTimeout,
    BackendError,
    UnreachablePeer,
    Unavailable,
    ChecksumFail,
    TxnTimeout,
    Aborted,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadStatement => "BAD_STATEMENT",
            ErrorCode::LockTimeout => "LOCK_TIMEOUT",
            ErrorCode::BackendError => "BACKEND_ERROR",
            ErrorCode::UnreachablePeer => "UNREACHABLE_PEER",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::ChecksumFail => "CHECKSUM_FAIL",
            ErrorCode::TxnTimeout => "TXN_TIMEOUT",
            ErrorCode::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

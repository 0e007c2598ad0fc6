use thiserror::Error;

/// Errors raised at the backend seam.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("no backend session available within {0} ms")]
    PoolTimeout(u64),
    #[error("unrecognized statement: {0}")]
    BadStatement(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

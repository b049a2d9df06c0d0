use ledger_core::LedgerError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind {role} listener on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("peer call timed out after {0:?}")]
    Timeout(Duration),
    #[error("node is already running")]
    AlreadyRunning,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

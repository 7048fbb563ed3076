//! Error taxonomy for the synchronization core.
//!
//! Nothing here is fatal to the hosting process. `NotFound` is a valid answer,
//! `TransportFailure` and `SequenceGap` are recovered by reconnect / resync, and
//! `StoreUnavailable` keeps the node degraded until a retry succeeds.

use crate::model::types::PlayerId;
use thiserror::Error;

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Optimistic version check failed; the caller must re-read and retry.
    #[error("version conflict for {player}: expected {expected}, current {current}")]
    Conflict {
        player: PlayerId,
        expected: u64,
        current: u64,
    },

    #[error("no assignment for {0}")]
    NotFound(PlayerId),

    #[error("unknown cape: {0}")]
    UnknownCape(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A sequence number arrived (or was requested) beyond what the reader can bridge.
    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },

    #[error("assignment store unavailable: {0}")]
    StoreUnavailable(String),

    /// Writes are refused while the node is not synchronized with the proxy.
    #[error("node is not live (state: {0})")]
    NotLive(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Short machine readable kind, used on the wire and in HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Conflict { .. } => "conflict",
            SyncError::NotFound(_) => "not_found",
            SyncError::UnknownCape(_) => "unknown_cape",
            SyncError::TransportFailure(_) => "transport_failure",
            SyncError::SequenceGap { .. } => "sequence_gap",
            SyncError::StoreUnavailable(_) => "store_unavailable",
            SyncError::NotLive(_) => "not_live",
            SyncError::Persistence(_) => "persistence",
            SyncError::Codec(_) => "codec",
            SyncError::Io(_) => "io",
        }
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Persistence(e.to_string())
    }
}

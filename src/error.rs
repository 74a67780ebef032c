//! Error types for the coordination layer.
//!
//! Transport and protocol failures are `CoordError`; failures of the logic an
//! action runs on the receiving side are `ActionError` (see `action.rs`) and
//! never cross the wire.

use std::io;

use thiserror::Error;

use crate::types::ConnectionId;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("wire format error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("session closed")]
    Disconnected,

    #[error("no coordination server is reachable")]
    NoServer,

    #[error("{0} has not subscribed")]
    NotSubscribed(ConnectionId),

    #[error("remote side rejected the call: {0}")]
    Rejected(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("channel worker exited before reporting")]
    WorkerLost,

    #[error("invalid value {value:?} for config key {key}")]
    Config { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, CoordError>;

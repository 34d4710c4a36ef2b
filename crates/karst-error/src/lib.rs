#![forbid(unsafe_code)]
//! Error types for Karst.
//!
//! Defines `KarstError` and a `Result<T>` alias used throughout the workspace.

use karst_types::{LogGroupId, MapId};
use thiserror::Error;

/// Unified error type for all Karst operations.
#[derive(Debug, Error)]
pub enum KarstError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Format(String),

    #[error("checkpoint already in progress")]
    CheckpointInProgress,

    #[error("map flush failed for map {map}: {detail}")]
    FlushFailed { map: MapId, detail: String },

    #[error("allocator context flush failed: {0}")]
    ContextFlushFailed(String),

    #[error("log buffer reset submit failed for group {group}")]
    ResetSubmitFailed { group: LogGroupId },

    #[error("journaling disabled after unrecoverable checkpoint failure")]
    FailJournaled,

    #[error("access beyond log group {group}: offset {offset} + len {len}")]
    OutOfRange {
        group: LogGroupId,
        offset: u64,
        len: usize,
    },

    #[error("volume meta content broken: {0}")]
    MetaContentBroken(String),

    #[error("volume meta blob of {needed} bytes exceeds region of {capacity} bytes")]
    MetaRegionOverflow { needed: usize, capacity: usize },
}

/// Result alias using `KarstError`.
pub type Result<T> = std::result::Result<T, KarstError>;

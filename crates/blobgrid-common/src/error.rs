//! Error types for BlobGrid
//!
//! Each public surface exposes a closed error set; replication-service
//! failures are translated into these before reaching a caller.

use thiserror::Error;

/// Errors surfaced by placement-group operations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PgError {
    #[error("invalid argument")]
    InvalidArg,

    #[error("unknown placement group")]
    UnknownPg,

    #[error("unknown peer")]
    UnknownPeer,

    #[error("not the leader of the replica set")]
    NotLeader,

    #[error("request timed out")]
    Timeout,

    #[error("not enough free chunks")]
    NoSpaceLeft,

    #[error("drive write error")]
    DriveWriteError,

    #[error("transient failure, retry the request")]
    RetryRequest,

    #[error("crc mismatch")]
    CrcMismatch,

    #[error("unknown failure")]
    Unknown,
}

impl PgError {
    /// Whether the caller may retry the same request unchanged
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::RetryRequest)
    }
}

/// Errors surfaced by shard operations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ShardError {
    #[error("request timed out")]
    Timeout,

    #[error("not the leader of the replica set")]
    NotLeader,

    #[error("invalid argument")]
    InvalidArg,

    #[error("unknown placement group")]
    UnknownPg,

    #[error("unknown shard")]
    UnknownShard,
}

impl ShardError {
    /// Whether the caller may retry the same request unchanged
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Errors surfaced by blob operations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BlobError {
    #[error("unknown blob")]
    UnknownBlob,

    #[error("invalid argument")]
    InvalidArg,

    #[error("shard is sealed")]
    SealedShard,

    #[error("crc mismatch")]
    CrcMismatch,

    #[error("not enough free blocks")]
    NoSpaceLeft,

    #[error("request timed out")]
    Timeout,

    #[error("not the leader of the replica set")]
    NotLeader,
}

impl BlobError {
    /// Whether the caller may retry the same request unchanged
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

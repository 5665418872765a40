//! BlobGrid Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, and utilities
//! used across all BlobGrid components.

pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use config::{CheckpointConfig, DeviceConfig, StoreConfig, DEFAULT_CHUNK_SIZE};
pub use error::{BlobError, PgError, ShardError};
pub use hash::{compute_blob_hash, HashAlgorithm, BLOB_MAX_HASH_LEN};
pub use types::*;

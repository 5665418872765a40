//! Configuration types for BlobGrid
//!
//! This module defines configuration structures used across components.

use crate::hash::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default uniform chunk size (8 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Root configuration for a BlobGrid store instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Storage devices contributing chunks
    pub devices: Vec<DeviceConfig>,
    /// Uniform chunk size in bytes; all replicas of a PG must agree
    pub chunk_size: u64,
    /// Hash algorithm stamped into blob headers on write
    pub blob_hash_algorithm: HashAlgorithm,
    /// Checkpoint flusher settings
    pub checkpoint: CheckpointConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            blob_hash_algorithm: HashAlgorithm::Crc32,
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Total number of chunks across all devices
    #[must_use]
    pub fn total_chunks(&self) -> u32 {
        self.devices.iter().map(|d| d.num_chunks).sum()
    }
}

/// One storage device contributing chunks to the pool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier, unique within the node
    pub dev_id: u32,
    /// Number of chunks carved out of this device
    pub num_chunks: u32,
}

/// Checkpoint flusher configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Run the periodic flusher
    pub enabled: bool,
    /// Interval between flushes in seconds
    pub interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl CheckpointConfig {
    /// Flush interval as a `Duration`
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_chunks_sums_devices() {
        let cfg = StoreConfig {
            devices: vec![
                DeviceConfig { dev_id: 0, num_chunks: 8 },
                DeviceConfig { dev_id: 1, num_chunks: 4 },
            ],
            ..Default::default()
        };
        assert_eq!(cfg.total_chunks(), 12);
    }
}

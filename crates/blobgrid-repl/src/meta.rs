//! Metadata-block (superblock) persistence service
//!
//! Superblocks are persisted under a registered type name and scanned back
//! by type at recovery. Writes to an existing `(type, key)` pair replace the
//! previous record in place.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Superblock persistence keyed by `(type name, record key)`
pub trait MetaBlkService: Send + Sync {
    /// Persist (or replace) one superblock
    fn write(&self, type_name: &str, key: u64, buf: Bytes);

    /// Remove one superblock
    fn remove(&self, type_name: &str, key: u64);

    /// All superblocks of a type, in ascending key order
    fn scan(&self, type_name: &str) -> Vec<Bytes>;
}

/// In-memory metadata-block service
///
/// Contents survive listener re-registration, so tests can recover a store
/// from the same service instance to simulate a restart.
#[derive(Default)]
pub struct MemMetaBlkService {
    records: Mutex<HashMap<String, BTreeMap<u64, Bytes>>>,
}

impl MemMetaBlkService {
    /// Create an empty service
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records of one type
    #[must_use]
    pub fn count(&self, type_name: &str) -> usize {
        self.records
            .lock()
            .get(type_name)
            .map_or(0, BTreeMap::len)
    }
}

impl MetaBlkService for MemMetaBlkService {
    fn write(&self, type_name: &str, key: u64, buf: Bytes) {
        self.records
            .lock()
            .entry(type_name.to_string())
            .or_default()
            .insert(key, buf);
    }

    fn remove(&self, type_name: &str, key: u64) {
        if let Some(by_key) = self.records.lock().get_mut(type_name) {
            by_key.remove(&key);
        }
    }

    fn scan(&self, type_name: &str) -> Vec<Bytes> {
        self.records
            .lock()
            .get(type_name)
            .map(|by_key| by_key.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_replace_scan() {
        let svc = MemMetaBlkService::new();
        svc.write("PGManager", 2, Bytes::from_static(b"two"));
        svc.write("PGManager", 1, Bytes::from_static(b"one"));
        svc.write("PGManager", 2, Bytes::from_static(b"two-v2"));

        let records = svc.scan("PGManager");
        assert_eq!(records, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two-v2")]);
        assert_eq!(svc.count("PGManager"), 2);
        assert!(svc.scan("ShardManager").is_empty());

        svc.remove("PGManager", 1);
        assert_eq!(svc.count("PGManager"), 1);
    }
}

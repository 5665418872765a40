//! Persistent indexed table engine
//!
//! Each table is an ordered key-value index tagged with a uuid. The service
//! keeps a registry of live tables so that recovery can enumerate them (in
//! registration order) before any superblock scan runs.

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Durable identity of an index table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexTableSb {
    /// Table uuid, referenced by the owning PG superblock
    pub uuid: Uuid,
}

/// An ordered index table keyed by `K`
pub struct IndexTable<K, V> {
    uuid: Uuid,
    tree: RwLock<BTreeMap<K, V>>,
}

impl<K: Ord + Clone, V: Clone> IndexTable<K, V> {
    /// Create an empty table with the given uuid
    #[must_use]
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            tree: RwLock::new(BTreeMap::new()),
        }
    }

    /// Table uuid
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Insert `value` unless `key` is already present.
    ///
    /// Returns the existing value on conflict.
    pub fn put_if_absent(&self, key: K, value: V) -> Result<(), V> {
        let mut tree = self.tree.write();
        match tree.get(&key) {
            Some(existing) => Err(existing.clone()),
            None => {
                tree.insert(key, value);
                Ok(())
            }
        }
    }

    /// Look up a key
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.tree.read().get(key).cloned()
    }

    /// Replace the value of an existing key, returning the previous value
    pub fn update(&self, key: &K, value: V) -> Option<V> {
        let mut tree = self.tree.write();
        match tree.get_mut(key) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => None,
        }
    }

    /// Up to `limit` entries in `[start, end]`, ascending
    #[must_use]
    pub fn range(&self, start: &K, end: &K, limit: usize) -> Vec<(K, V)> {
        self.tree
            .read()
            .range(start.clone()..=end.clone())
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    /// Whether the table holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }
}

/// Registry of index tables, enumerated first during recovery
pub trait IndexService: Send + Sync {
    /// Register a table so it participates in recovery
    fn add_index_table(&self, sb: IndexTableSb, table: Arc<dyn Any + Send + Sync>);

    /// Drop a table from the registry
    fn remove_index_table(&self, uuid: Uuid);

    /// All registered tables in registration order
    fn recovered_tables(&self) -> Vec<(IndexTableSb, Arc<dyn Any + Send + Sync>)>;
}

/// In-memory index service; table contents survive a simulated restart
#[derive(Default)]
pub struct MemIndexService {
    tables: Mutex<Vec<(IndexTableSb, Arc<dyn Any + Send + Sync>)>>,
}

impl MemIndexService {
    /// Create an empty service
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexService for MemIndexService {
    fn add_index_table(&self, sb: IndexTableSb, table: Arc<dyn Any + Send + Sync>) {
        self.tables.lock().push((sb, table));
    }

    fn remove_index_table(&self, uuid: Uuid) {
        self.tables.lock().retain(|(sb, _)| sb.uuid != uuid);
    }

    fn recovered_tables(&self) -> Vec<(IndexTableSb, Arc<dyn Any + Send + Sync>)> {
        self.tables.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_if_absent_never_overwrites() {
        let table: IndexTable<u64, &'static str> = IndexTable::new(Uuid::new_v4());
        assert!(table.put_if_absent(1, "a").is_ok());
        assert_eq!(table.put_if_absent(1, "b"), Err("a"));
        assert_eq!(table.get(&1), Some("a"));
    }

    #[test]
    fn update_requires_existing_key() {
        let table: IndexTable<u64, u32> = IndexTable::new(Uuid::new_v4());
        assert_eq!(table.update(&9, 1), None);
        table.put_if_absent(9, 1).unwrap();
        assert_eq!(table.update(&9, 2), Some(1));
        assert_eq!(table.get(&9), Some(2));
    }

    #[test]
    fn range_is_inclusive_and_bounded() {
        let table: IndexTable<u64, u64> = IndexTable::new(Uuid::new_v4());
        for i in 0..10 {
            table.put_if_absent(i, i * 10).unwrap();
        }
        let slice = table.range(&2, &8, 3);
        assert_eq!(slice, vec![(2, 20), (3, 30), (4, 40)]);
        let tail = table.range(&8, &u64::MAX, 100);
        assert_eq!(tail, vec![(8, 80), (9, 90)]);
    }

    #[test]
    fn service_enumerates_in_registration_order() {
        let svc = MemIndexService::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        svc.add_index_table(
            IndexTableSb { uuid: a },
            Arc::new(IndexTable::<u64, u64>::new(a)),
        );
        svc.add_index_table(
            IndexTableSb { uuid: b },
            Arc::new(IndexTable::<u64, u64>::new(b)),
        );
        let recovered = svc.recovered_tables();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].0.uuid, a);
        assert_eq!(recovered[1].0.uuid, b);
    }
}

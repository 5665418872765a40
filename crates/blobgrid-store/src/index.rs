//! Per-PG blob index adapter
//!
//! Maps `(shard_id, blob_id)` to the block location of the committed blob
//! payload. The index entry is the authoritative liveness bit: the tombstone
//! sentinel value means the blob is logically deleted. Inserts never
//! overwrite an existing entry; the only permitted in-place update is the
//! swap to the tombstone.

use crate::store::BlobStore;
use blobgrid_common::{BlobError, BlobId, ShardId};
use blobgrid_repl::{IndexTable, IndexTableSb, MultiBlkId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Index key: blob route within a PG
///
/// Ordered by `(shard, blob)` so that a shard's blobs are contiguous and
/// ascending in the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobRouteKey {
    pub shard: ShardId,
    pub blob: BlobId,
}

impl BlobRouteKey {
    /// Create a route key
    #[must_use]
    pub const fn new(shard: ShardId, blob: BlobId) -> Self {
        Self { shard, blob }
    }

    /// Serialize big-endian so byte order matches key order
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(self.shard.as_u64());
        buf.put_u64(self.blob);
        buf.freeze()
    }

    /// Parse from log-entry key bytes
    #[must_use]
    pub fn from_bytes(mut data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }
        let shard = ShardId::from(data.get_u64());
        let blob = data.get_u64();
        Some(Self { shard, blob })
    }
}

/// Index value: the blob's block location (or the tombstone sentinel)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRouteValue {
    pub pbas: MultiBlkId,
}

impl BlobRouteValue {
    /// Wrap a block location
    #[must_use]
    pub fn new(pbas: MultiBlkId) -> Self {
        Self { pbas }
    }

    /// The tombstone value
    #[must_use]
    pub fn tombstone() -> Self {
        Self {
            pbas: MultiBlkId::tombstone(),
        }
    }

    /// Whether this entry marks a deleted blob
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.pbas.is_tombstone()
    }
}

/// The per-PG index table type
pub type BlobIndexTable = IndexTable<BlobRouteKey, BlobRouteValue>;

impl BlobStore {
    /// Create a fresh index table and register it with the index service
    pub(crate) fn create_index_table(&self) -> Arc<BlobIndexTable> {
        let uuid = Uuid::new_v4();
        let table = Arc::new(BlobIndexTable::new(uuid));
        self.index_service.add_index_table(
            IndexTableSb { uuid },
            table.clone() as Arc<dyn std::any::Any + Send + Sync>,
        );
        info!(%uuid, "created index table");
        table
    }

    /// Insert a committed blob route.
    ///
    /// Returns `Ok(true)` on a fresh insert and `Ok(false)` when the entry
    /// already exists with the same location or was already tombstoned (log
    /// replay). A conflicting location is corruption and fatal.
    pub(crate) fn add_to_index_table(
        &self,
        table: &BlobIndexTable,
        key: BlobRouteKey,
        pbas: &MultiBlkId,
    ) -> bool {
        match table.put_if_absent(key, BlobRouteValue::new(pbas.clone())) {
            Ok(()) => true,
            Err(existing) => {
                // Replay may catch up on a blob that was deleted later.
                assert!(
                    existing.is_tombstone() || existing.pbas == *pbas,
                    "blob route {key:?} already mapped to a different location"
                );
                false
            }
        }
    }

    /// Look up a blob route; tombstones surface as `UNKNOWN_BLOB`
    pub(crate) fn get_blob_from_index_table(
        &self,
        table: &BlobIndexTable,
        shard: ShardId,
        blob: BlobId,
    ) -> Result<MultiBlkId, BlobError> {
        let value = table
            .get(&BlobRouteKey::new(shard, blob))
            .ok_or(BlobError::UnknownBlob)?;
        if value.is_tombstone() {
            return Err(BlobError::UnknownBlob);
        }
        Ok(value.pbas)
    }

    /// Swap an entry to the tombstone sentinel.
    ///
    /// Returns the previous location on the first delete, `None` when the
    /// entry was already a tombstone (idempotent), `UNKNOWN_BLOB` when the
    /// route never existed.
    pub(crate) fn move_to_tombstone(
        &self,
        table: &BlobIndexTable,
        key: BlobRouteKey,
    ) -> Result<Option<MultiBlkId>, BlobError> {
        let existing = table.get(&key).ok_or(BlobError::UnknownBlob)?;
        if existing.is_tombstone() {
            return Ok(None);
        }
        table.update(&key, BlobRouteValue::tombstone());
        Ok(Some(existing.pbas))
    }

    /// Alive blobs of one shard with id in `[start_blob, u64::MAX]`,
    /// ascending, at most `max_count` entries.
    ///
    /// Tombstoned routes are skipped without counting against `max_count`,
    /// so an empty result means the shard holds no further alive blobs.
    pub(crate) fn query_blobs_in_shard(
        &self,
        table: &BlobIndexTable,
        shard: ShardId,
        start_blob: BlobId,
        max_count: usize,
    ) -> Vec<(BlobRouteKey, MultiBlkId)> {
        let mut out = Vec::new();
        let mut cursor = start_blob;
        loop {
            let window = table.range(
                &BlobRouteKey::new(shard, cursor),
                &BlobRouteKey::new(shard, u64::MAX),
                max_count.max(1),
            );
            let exhausted = window.len() < max_count.max(1);
            for (k, v) in &window {
                if !v.is_tombstone() {
                    out.push((*k, v.pbas.clone()));
                    if out.len() == max_count {
                        return out;
                    }
                }
            }
            match window.last() {
                Some((k, _)) if k.blob < u64::MAX && !exhausted => cursor = k.blob + 1,
                _ => return out,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_key_bytes_preserve_order() {
        let a = BlobRouteKey::new(ShardId::from_parts(1, 1), 5);
        let b = BlobRouteKey::new(ShardId::from_parts(1, 2), 0);
        assert!(a < b);
        assert!(a.to_bytes() < b.to_bytes());
        assert_eq!(BlobRouteKey::from_bytes(&a.to_bytes()), Some(a));
        assert_eq!(BlobRouteKey::from_bytes(&[0u8; 3]), None);
    }

    #[test]
    fn tombstone_value() {
        assert!(BlobRouteValue::tombstone().is_tombstone());
        assert!(!BlobRouteValue::new(MultiBlkId::single(1, 8, 2)).is_tombstone());
    }
}

//! The BlobGrid store service
//!
//! `BlobStore` owns every PG hosted on this node, the chunk selector, and
//! the uuid → index-table map. Shards and index tables are reached through
//! their owning PG; the replication state machine holds only a weak
//! back-reference and looks entries up per commit.

use crate::checkpoint::CpManager;
use crate::chunk_selector::ChunkSelector;
use crate::index::BlobIndexTable;
use crate::pg::PgEntry;
use crate::records::{DATA_BLOCK_SIZE, IO_ALIGN, MAX_ZPAD_BUFS};
use crate::shard::ShardEntry;
use crate::state_machine::ReplStateMachine;
use blobgrid_common::{PgId, ShardId, StoreConfig, StoreStats};
use blobgrid_repl::{IndexService, MetaBlkService, ReplicationService};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Index-table registry entry; `pg_id` is filled once the owning PG is known
pub(crate) struct PgIndexSlot {
    pub(crate) pg_id: Option<PgId>,
    pub(crate) table: Arc<BlobIndexTable>,
}

/// The store service
pub struct BlobStore {
    pub(crate) cfg: StoreConfig,
    pub(crate) repl_service: Arc<dyn ReplicationService>,
    pub(crate) meta_service: Arc<dyn MetaBlkService>,
    pub(crate) index_service: Arc<dyn IndexService>,
    pub(crate) chunk_selector: Arc<ChunkSelector>,
    /// All PGs hosted on this node
    pub(crate) pgs: RwLock<HashMap<PgId, Arc<PgEntry>>>,
    /// Shard lookup across PGs
    pub(crate) shards: RwLock<HashMap<ShardId, Arc<ShardEntry>>>,
    /// uuid → index table; guarded separately from the PG lock and never
    /// taken while holding it
    pub(crate) index_tables: Mutex<HashMap<Uuid, PgIndexSlot>>,
    /// Zero-pad buffers indexed by `pad_len / IO_ALIGN`
    zpad_bufs: Vec<Bytes>,
    cp: Mutex<Option<CpManager>>,
}

impl BlobStore {
    /// Bring up the store: register the state machine, run recovery in the
    /// fixed order, and start the checkpoint flusher.
    pub async fn start(
        cfg: StoreConfig,
        repl_service: Arc<dyn ReplicationService>,
        meta_service: Arc<dyn MetaBlkService>,
        index_service: Arc<dyn IndexService>,
    ) -> Arc<Self> {
        let chunk_selector = Arc::new(ChunkSelector::new(
            cfg.chunk_size,
            DATA_BLOCK_SIZE,
            &cfg.devices,
        ));
        let zpad_bufs = (0..MAX_ZPAD_BUFS)
            .map(|i| Bytes::from(vec![0u8; i * IO_ALIGN]))
            .collect();

        let store = Arc::new(Self {
            cfg,
            repl_service,
            meta_service,
            index_service,
            chunk_selector,
            pgs: RwLock::new(HashMap::new()),
            shards: RwLock::new(HashMap::new()),
            index_tables: Mutex::new(HashMap::new()),
            zpad_bufs,
            cp: Mutex::new(None),
        });

        let machine = Arc::new(ReplStateMachine::new(Arc::downgrade(&store)));
        store.repl_service.register_listener(machine);
        store.on_replica_restart();

        if store.cfg.checkpoint.enabled {
            let mgr = CpManager::start(Arc::downgrade(&store), store.cfg.checkpoint.interval());
            store.cp.lock().replace(mgr);
        }
        info!(pgs = store.pgs.read().len(), "blob store started");
        store
    }

    /// Stop the flusher and write a final checkpoint
    pub fn shutdown(&self) {
        if let Some(cp) = self.cp.lock().take() {
            cp.stop();
        }
        let flushed = self.checkpoint_flush(None);
        info!(flushed, "blob store shut down");
    }

    /// Checkpoint progress in `[0, 100]`
    #[must_use]
    pub fn cp_progress_percent(&self) -> u8 {
        self.cp.lock().as_ref().map_or(100, CpManager::cp_progress_percent)
    }

    /// Whether a PG is hosted here
    #[must_use]
    pub fn pg_exists(&self, pg_id: PgId) -> bool {
        self.pgs.read().contains_key(&pg_id)
    }

    /// Store-wide statistics
    #[must_use]
    pub fn get_stats(&self) -> StoreStats {
        let pgs = self.pgs.read();
        let mut stats = StoreStats {
            total_capacity_bytes: u64::from(self.chunk_selector.total_chunks())
                * self.chunk_selector.get_chunk_size(),
            ..Default::default()
        };
        for pg in pgs.values() {
            stats.num_pgs += 1;
            stats.num_open_shards += pg.open_shards();
            stats.used_capacity_bytes += pg
                .durable
                .total_occupied_blk_count
                .load(std::sync::atomic::Ordering::Relaxed)
                * u64::from(pg.repl_dev.blk_size());
        }
        stats
    }

    pub(crate) fn get_pg(&self, pg_id: PgId) -> Option<Arc<PgEntry>> {
        self.pgs.read().get(&pg_id).cloned()
    }

    pub(crate) fn get_shard_entry(&self, shard_id: ShardId) -> Option<Arc<ShardEntry>> {
        self.shards.read().get(&shard_id).cloned()
    }

    pub(crate) fn pg_for_group(&self, group_id: Uuid) -> Option<Arc<PgEntry>> {
        self.pgs
            .read()
            .values()
            .find(|pg| pg.repl_dev.group_id() == group_id)
            .cloned()
    }

    /// Pre-allocated zero buffer of length `pad_len`
    pub(crate) fn get_pad_buf(&self, pad_len: usize) -> Bytes {
        debug_assert_eq!(pad_len % IO_ALIGN, 0);
        self.zpad_bufs[pad_len / IO_ALIGN].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{BlobHeader, PgSuperblk, PG_META_NAME};
    use crate::snapshot::{PgBlobIterator, SnapshotBatch};
    use crate::wire::{build_msg, ReplicationMessageType};
    use blobgrid_common::{
        Blob, BlobError, CheckpointConfig, DeviceConfig, HashAlgorithm, PeerId, PgError, PgInfo,
        PgMember, ShardError, ShardState,
    };
    use blobgrid_repl::{
        MemIndexService, MemMetaBlkService, MemReplDev, MemReplicationRuntime, ReplDev,
        ReplicationService,
    };
    use uuid::Uuid;

    const CHUNK_SIZE: u64 = 1 << 20;

    struct Harness {
        cfg: StoreConfig,
        runtime: Arc<MemReplicationRuntime>,
        meta: Arc<MemMetaBlkService>,
        index: Arc<MemIndexService>,
        store: Arc<BlobStore>,
        local_peer: PeerId,
    }

    impl Harness {
        async fn new(num_chunks: u32, algo: HashAlgorithm) -> Self {
            let local_peer = Uuid::new_v4();
            let runtime = Arc::new(MemReplicationRuntime::new(local_peer, DATA_BLOCK_SIZE));
            let meta = Arc::new(MemMetaBlkService::new());
            let index = Arc::new(MemIndexService::new());
            let cfg = StoreConfig {
                devices: vec![DeviceConfig {
                    dev_id: 0,
                    num_chunks,
                }],
                chunk_size: CHUNK_SIZE,
                blob_hash_algorithm: algo,
                checkpoint: CheckpointConfig {
                    enabled: false,
                    interval_secs: 3600,
                },
            };
            let store = BlobStore::start(
                cfg.clone(),
                runtime.clone(),
                meta.clone(),
                index.clone(),
            )
            .await;
            Self {
                cfg,
                runtime,
                meta,
                index,
                store,
                local_peer,
            }
        }

        /// Recover a fresh store over the same persisted services
        async fn restart(&mut self) {
            self.store = BlobStore::start(
                self.cfg.clone(),
                self.runtime.clone(),
                self.meta.clone(),
                self.index.clone(),
            )
            .await;
        }

        fn pg_info(&self, id: PgId, size: u64, extra_peers: &[PeerId]) -> (PgInfo, Vec<PeerId>) {
            let mut info = PgInfo::new(id, size);
            let mut peers = vec![self.local_peer];
            peers.extend_from_slice(extra_peers);
            info.members
                .insert(PgMember::new(self.local_peer, "replica-0", 1));
            for (i, &p) in extra_peers.iter().enumerate() {
                info.members
                    .insert(PgMember::new(p, format!("replica-{}", i + 1), 0));
            }
            (info, peers)
        }

        async fn create_pg(&self, id: PgId, size: u64, extra_peers: &[PeerId]) {
            let (info, peers) = self.pg_info(id, size, extra_peers);
            self.store.create_pg(info, &peers).await.unwrap();
        }

        fn dev(&self, pg_id: PgId) -> Arc<MemReplDev> {
            let group = self.store.get_pg_stats(pg_id).unwrap().replica_set_uuid;
            self.runtime.dev(group).unwrap()
        }
    }

    fn blob(body: &str, user_key: &str) -> Blob {
        Blob::new(Bytes::copy_from_slice(body.as_bytes()))
            .with_user_key(Bytes::copy_from_slice(user_key.as_bytes()))
    }

    // E1: PG creation reserves chunks and persists the superblock.
    #[tokio::test]
    async fn create_pg_reserves_chunks_and_persists() {
        let h = Harness::new(8, HashAlgorithm::Crc32).await;
        let peers = [Uuid::new_v4(), Uuid::new_v4()];
        h.create_pg(1, 4 * CHUNK_SIZE, &peers).await;

        let stats = h.store.get_pg_stats(1).unwrap();
        assert_eq!(stats.num_members, 3);
        assert_eq!(stats.avail_open_shards, 4);
        assert_eq!(h.store.list_pg_ids(), vec![1]);

        assert_eq!(h.meta.count(PG_META_NAME), 1);
        let sb = PgSuperblk::from_bytes(&h.meta.scan(PG_META_NAME)[0]).unwrap();
        assert_eq!(sb.id, 1);
        assert_eq!(sb.chunks.len(), 4);
        assert_eq!(sb.members.len(), 3);
        assert_eq!(sb.replica_set_uuid, stats.replica_set_uuid);
    }

    // Property 1: create_pg is idempotent, both API- and commit-level.
    #[tokio::test]
    async fn create_pg_is_idempotent() {
        let h = Harness::new(8, HashAlgorithm::Crc32).await;
        h.create_pg(1, 2 * CHUNK_SIZE, &[]).await;
        h.create_pg(1, 2 * CHUNK_SIZE, &[]).await;
        assert_eq!(h.store.list_pg_ids().len(), 1);

        // A second committed CREATE_PG (log replay) is a no-op as well.
        h.runtime.replay();
        assert_eq!(h.store.list_pg_ids().len(), 1);
        assert_eq!(h.store.get_pg_stats(1).unwrap().avail_open_shards, 2);
        assert_eq!(h.runtime.num_groups(), 1);
    }

    // Property 2: capacity is pre-checked before anything is proposed.
    #[tokio::test]
    async fn create_pg_capacity_precheck() {
        let h = Harness::new(4, HashAlgorithm::Crc32).await;
        let (info, peers) = h.pg_info(1, 5 * CHUNK_SIZE, &[]);
        let err = h.store.create_pg(info, &peers).await.unwrap_err();
        assert_eq!(err, PgError::NoSpaceLeft);
        // No replication group was created, nothing was persisted.
        assert_eq!(h.runtime.num_groups(), 0);
        assert_eq!(h.meta.count(PG_META_NAME), 0);

        let (info, peers) = h.pg_info(2, 0, &[]);
        assert_eq!(
            h.store.create_pg(info, &peers).await.unwrap_err(),
            PgError::InvalidArg
        );
    }

    // Property 3: a replica with a diverging chunk size drops the commit.
    #[tokio::test]
    async fn create_pg_rejects_foreign_chunk_size() {
        let h = Harness::new(4, HashAlgorithm::Crc32).await;
        let (mut info, peers) = h.pg_info(7, 2 * CHUNK_SIZE, &[]);
        info.chunk_size = CHUNK_SIZE * 2;
        info.replica_set_uuid = Uuid::new_v4();
        h.runtime
            .create_repl_dev(info.replica_set_uuid, &peers)
            .await
            .unwrap();

        let payload = serde_json::to_vec(&info).unwrap();
        let msg = build_msg(ReplicationMessageType::CreatePg, &payload);
        h.store.on_create_pg_commit(1, &msg, None);
        assert!(!h.store.pg_exists(7));
        assert_eq!(h.meta.count(PG_META_NAME), 0);
    }

    // Property 4: shard ids are strictly increasing and decode exactly.
    #[tokio::test]
    async fn shard_ids_are_monotonic_and_decodable() {
        let h = Harness::new(8, HashAlgorithm::Crc32).await;
        h.create_pg(3, 4 * CHUNK_SIZE, &[]).await;

        let mut last = 0u64;
        for _ in 0..3 {
            let info = h.store.create_shard(3, CHUNK_SIZE).await.unwrap();
            assert!(info.id.as_u64() > last);
            assert_eq!(info.id.pg_id(), 3);
            last = info.id.as_u64();
        }
        let seqs: Vec<u64> = h
            .store
            .list_shards(3)
            .unwrap()
            .iter()
            .map(|s| s.id.seq_num())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        assert_eq!(
            h.store.create_shard(99, CHUNK_SIZE).await.unwrap_err(),
            ShardError::UnknownPg
        );
    }

    // E2 + property 6: blob round-trip with the on-disk hash verifying.
    #[tokio::test]
    async fn blob_round_trip_with_sha1() {
        let h = Harness::new(8, HashAlgorithm::Sha1).await;
        h.create_pg(1, 4 * CHUNK_SIZE, &[]).await;
        let shard = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();

        let id = h.store.put_blob(shard.id, blob("hello", "k")).await.unwrap();
        let got = h.store.get_blob(shard.id, id, 0, 0).await.unwrap();
        assert_eq!(&got.body[..], b"hello");
        assert_eq!(&got.user_key[..], b"k");

        // Verify the stored header hash against an independent digest.
        let group = h.store.get_pg_stats(1).unwrap().replica_set_uuid;
        let mut iter = PgBlobIterator::new(h.store.clone(), group, 0).unwrap();
        let mut pbas = None;
        while let Some(batch) = iter.next_batch(16, 1 << 20).await.unwrap() {
            if let SnapshotBatch::Blobs { entries, .. } = batch {
                if let Some(e) = entries.iter().find(|e| e.blob_id == id) {
                    pbas = Some(e.pbas.clone());
                }
            }
        }
        let pbas = pbas.unwrap();
        let dev = h.dev(1);
        let raw = dev
            .async_read(&pbas, DATA_BLOCK_SIZE as usize)
            .await
            .unwrap();
        let header = BlobHeader::from_bytes(&raw).unwrap();
        use sha1::{Digest, Sha1};
        let expected = Sha1::digest(b"hellok");
        assert_eq!(&header.hash[..20], expected.as_slice());
        assert_eq!(header.blob_size, 5);
        assert_eq!(header.user_key_size, 1);

        // Slicing: explicit ranges and the len == 0 "to end" contract.
        let slice = h.store.get_blob(shard.id, id, 1, 3).await.unwrap();
        assert_eq!(&slice.body[..], b"ell");
        let tail = h.store.get_blob(shard.id, id, 2, 0).await.unwrap();
        assert_eq!(&tail.body[..], b"llo");
        assert_eq!(
            h.store.get_blob(shard.id, id, 6, 0).await.unwrap_err(),
            BlobError::InvalidArg
        );
        // An oversized len clamps to the end instead of overflowing.
        let clamped = h.store.get_blob(shard.id, id, 1, u64::MAX - 10).await.unwrap();
        assert_eq!(&clamped.body[..], b"ello");
    }

    // E3 + property 5: sealing is terminal for writes.
    #[tokio::test]
    async fn sealed_shard_rejects_writes() {
        let h = Harness::new(8, HashAlgorithm::Crc32).await;
        h.create_pg(1, 2 * CHUNK_SIZE, &[]).await;
        let shard = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();
        h.store.put_blob(shard.id, blob("before", "")).await.unwrap();

        let sealed = h.store.seal_shard(shard.id).await.unwrap();
        assert_eq!(sealed.state, ShardState::Sealed);

        assert_eq!(
            h.store.put_blob(shard.id, blob("after", "")).await.unwrap_err(),
            BlobError::SealedShard
        );
        // Sealed shards remain readable, and sealing again is a no-op.
        assert!(h.store.get_blob(shard.id, 0, 0, 0).await.is_ok());
        assert_eq!(
            h.store.seal_shard(shard.id).await.unwrap().state,
            ShardState::Sealed
        );
    }

    // E4 + property 7: tombstones are sticky and deletes idempotent.
    #[tokio::test]
    async fn delete_is_sticky_and_idempotent() {
        let h = Harness::new(8, HashAlgorithm::Crc32).await;
        h.create_pg(1, 2 * CHUNK_SIZE, &[]).await;
        let shard = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();
        let id = h.store.put_blob(shard.id, blob("hello", "k")).await.unwrap();

        h.store.del_blob(shard.id, id).await.unwrap();
        assert_eq!(
            h.store.get_blob(shard.id, id, 0, 0).await.unwrap_err(),
            BlobError::UnknownBlob
        );
        // Second delete is a no-op success; counters move exactly once.
        h.store.del_blob(shard.id, id).await.unwrap();
        let stats = h.store.get_pg_stats(1).unwrap();
        assert_eq!(stats.num_active_objects, 0);
        assert_eq!(stats.num_tombstone_objects, 1);

        assert_eq!(
            h.store.del_blob(shard.id, 999).await.unwrap_err(),
            BlobError::UnknownBlob
        );
    }

    // Property 8: a rolled-back CREATE_SHARD returns its chunk.
    #[tokio::test]
    async fn create_shard_rollback_releases_chunk() {
        let h = Harness::new(8, HashAlgorithm::Crc32).await;
        h.create_pg(1, 2 * CHUNK_SIZE, &[]).await;
        let _first = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();
        let avail_before = h.store.get_pg_stats(1).unwrap().avail_open_shards;
        assert_eq!(avail_before, 1);

        h.dev(1).inject_rollback_next();
        let err = h.store.create_shard(1, CHUNK_SIZE).await.unwrap_err();
        assert_eq!(err, ShardError::Timeout);
        assert_eq!(
            h.store.get_pg_stats(1).unwrap().avail_open_shards,
            avail_before
        );

        // The retry succeeds on the released chunk.
        let retried = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();
        assert_eq!(retried.state, ShardState::Open);
        assert_eq!(h.store.get_pg_stats(1).unwrap().avail_open_shards, 0);
    }

    // Leadership is enforced on every mutating surface.
    #[tokio::test]
    async fn follower_rejects_mutations() {
        let h = Harness::new(8, HashAlgorithm::Crc32).await;
        h.create_pg(1, 2 * CHUNK_SIZE, &[]).await;
        let shard = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();
        let id = h.store.put_blob(shard.id, blob("x", "")).await.unwrap();

        h.dev(1).set_leader(false);
        assert_eq!(
            h.store.create_shard(1, CHUNK_SIZE).await.unwrap_err(),
            ShardError::NotLeader
        );
        assert_eq!(
            h.store.put_blob(shard.id, blob("y", "")).await.unwrap_err(),
            BlobError::NotLeader
        );
        assert_eq!(
            h.store.del_blob(shard.id, id).await.unwrap_err(),
            BlobError::NotLeader
        );
        assert_eq!(
            h.store
                .replace_member(1, h.local_peer, PgMember::new(Uuid::new_v4(), "n", 0), 0)
                .await
                .unwrap_err(),
            PgError::NotLeader
        );
        // Reads still serve on a follower.
        assert!(h.store.get_blob(shard.id, id, 0, 0).await.is_ok());
    }

    // E5: membership replacement rewrites the superblock member array.
    #[tokio::test]
    async fn replace_member_updates_superblock() {
        let h = Harness::new(8, HashAlgorithm::Crc32).await;
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        h.create_pg(1, 2 * CHUNK_SIZE, &[b, c]).await;

        let d = PgMember::new(Uuid::new_v4(), "replica-d", 2);
        h.store.replace_member(1, c, d.clone(), 0).await.unwrap();

        let stats = h.store.get_pg_stats(1).unwrap();
        let ids: Vec<PeerId> = stats.members.iter().map(|m| m.id).collect();
        assert!(ids.contains(&d.id));
        assert!(!ids.contains(&c));

        let sb = PgSuperblk::from_bytes(&h.meta.scan(PG_META_NAME)[0]).unwrap();
        let sb_ids: Vec<PeerId> = sb.members.iter().map(|m| m.id).collect();
        assert_eq!(sb.members.len(), 3);
        assert!(sb_ids.contains(&h.local_peer));
        assert!(sb_ids.contains(&b));
        assert!(sb_ids.contains(&d.id));

        assert_eq!(
            h.store
                .replace_member(42, c, d, 0)
                .await
                .unwrap_err(),
            PgError::UnknownPg
        );
    }

    // Property 9 + parts of E5: recovery from a crash-consistent image.
    #[tokio::test]
    async fn recovery_restores_equivalent_state() {
        let mut h = Harness::new(8, HashAlgorithm::Sha1).await;
        h.create_pg(1, 4 * CHUNK_SIZE, &[Uuid::new_v4()]).await;
        let s1 = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();
        let s2 = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();

        let a = h.store.put_blob(s1.id, blob("alpha", "ka")).await.unwrap();
        let b = h.store.put_blob(s1.id, blob("beta", "kb")).await.unwrap();
        let c = h.store.put_blob(s2.id, blob("gamma", "kc")).await.unwrap();
        h.store.del_blob(s1.id, b).await.unwrap();
        h.store.seal_shard(s2.id).await.unwrap();

        // Crash-consistent image: counters flushed, then the process dies
        // without a clean shutdown.
        h.store.checkpoint_flush(None);
        let seq_before = h.store.pg_blob_sequence_num(1).unwrap();
        let before = h.store.get_pg_stats(1).unwrap();
        let shards_before: Vec<_> = h
            .store
            .list_shards(1)
            .unwrap()
            .iter()
            .map(|s| (s.id, s.state))
            .collect();

        h.restart().await;

        let after = h.store.get_pg_stats(1).unwrap();
        assert_eq!(h.store.pg_blob_sequence_num(1).unwrap(), seq_before);
        assert_eq!(after.replica_set_uuid, before.replica_set_uuid);
        assert_eq!(after.num_members, before.num_members);
        assert_eq!(after.total_shards, before.total_shards);
        assert_eq!(after.open_shards, before.open_shards);
        assert_eq!(after.num_active_objects, before.num_active_objects);
        assert_eq!(after.num_tombstone_objects, before.num_tombstone_objects);
        assert_eq!(after.avail_open_shards, before.avail_open_shards);
        assert_eq!(after.used_bytes, before.used_bytes);
        let shards_after: Vec<_> = h
            .store
            .list_shards(1)
            .unwrap()
            .iter()
            .map(|s| (s.id, s.state))
            .collect();
        assert_eq!(shards_after, shards_before);

        // Data survives; the tombstone stays a tombstone.
        let got = h.store.get_blob(s1.id, a, 0, 0).await.unwrap();
        assert_eq!(&got.body[..], b"alpha");
        let got = h.store.get_blob(s2.id, c, 0, 0).await.unwrap();
        assert_eq!(&got.body[..], b"gamma");
        assert_eq!(
            h.store.get_blob(s1.id, b, 0, 0).await.unwrap_err(),
            BlobError::UnknownBlob
        );

        // New writes pick up after the recovered sequence number.
        let next = h.store.put_blob(s1.id, blob("delta", "")).await.unwrap();
        assert!(next >= 3);
    }

    // E6: a put that never commits leaves no partial state.
    #[tokio::test]
    async fn interrupted_put_leaves_no_partial_state() {
        let h = Harness::new(8, HashAlgorithm::Crc32).await;
        h.create_pg(1, 2 * CHUNK_SIZE, &[]).await;
        let shard = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();
        let committed = h.store.put_blob(shard.id, blob("keep", "")).await.unwrap();
        let stats_before = h.store.get_pg_stats(1).unwrap();

        h.dev(1).inject_rollback_next();
        let err = h.store.put_blob(shard.id, blob("lost", "")).await.unwrap_err();
        assert_eq!(err, BlobError::Timeout);

        let stats_after = h.store.get_pg_stats(1).unwrap();
        assert_eq!(stats_after.num_active_objects, stats_before.num_active_objects);
        assert_eq!(stats_after.used_bytes, stats_before.used_bytes);

        // The burned id is never readable; the next put moves past it.
        let burned = committed + 1;
        assert_eq!(
            h.store.get_blob(shard.id, burned, 0, 0).await.unwrap_err(),
            BlobError::UnknownBlob
        );
        let next = h.store.put_blob(shard.id, blob("again", "")).await.unwrap();
        assert!(next > burned);
        assert!(h.store.get_blob(shard.id, next, 0, 0).await.is_ok());
    }

    // Property 10: the snapshot iterator is complete and deterministic.
    #[tokio::test]
    async fn snapshot_iterator_is_complete_and_deterministic() {
        let h = Harness::new(8, HashAlgorithm::Crc32).await;
        h.create_pg(1, 4 * CHUNK_SIZE, &[]).await;
        let s1 = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();
        let s2 = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();

        let mut alive = Vec::new();
        for i in 0..5 {
            let id = h
                .store
                .put_blob(s1.id, blob(&format!("one-{i}"), ""))
                .await
                .unwrap();
            alive.push((s1.id, id));
        }
        let dead = h.store.put_blob(s2.id, blob("two-dead", "")).await.unwrap();
        let kept = h.store.put_blob(s2.id, blob("two-kept", "")).await.unwrap();
        h.store.del_blob(s2.id, dead).await.unwrap();
        alive.push((s2.id, kept));

        let group = h.store.get_pg_stats(1).unwrap().replica_set_uuid;
        let collect = |max_blobs: u64| {
            let store = h.store.clone();
            async move {
                let mut iter = PgBlobIterator::new(store, group, 0).unwrap();
                let meta = iter.get_pg_metadata();
                let mut emitted = Vec::new();
                let mut shard_metas = Vec::new();
                let mut end_marks = 0;
                while let Some(batch) = iter.next_batch(max_blobs, 1 << 20).await.unwrap() {
                    match batch {
                        SnapshotBatch::PgMeta(_) => {}
                        SnapshotBatch::ShardMeta(info) => shard_metas.push(info.id),
                        SnapshotBatch::Blobs {
                            entries,
                            end_of_shard,
                        } => {
                            for e in &entries {
                                emitted.push((e.shard_id, e.blob_id));
                            }
                            if end_of_shard {
                                end_marks += 1;
                            }
                        }
                    }
                }
                assert!(iter.end_of_scan());
                (meta, emitted, shard_metas, end_marks)
            }
        };

        let (meta, emitted, shard_metas, end_marks) = collect(2).await;
        assert_eq!(meta.total_blobs_to_transfer, alive.len() as u64);
        assert_eq!(meta.shard_ids.len(), 2);
        assert_eq!(shard_metas, vec![s1.id, s2.id]);
        assert_eq!(emitted, alive);
        // One end-of-shard signal per shard so the receiver can flush.
        assert_eq!(end_marks, 2);

        // Same upto-state, different batch size: identical blob sequence.
        let (_, emitted_again, _, _) = collect(1).await;
        assert_eq!(emitted_again, alive);
        let (_, emitted_third, _, _) = collect(2).await;
        assert_eq!(emitted_third, emitted);
    }

    // Checkpoint progress stays within [0, 100] and flushes dirty PGs.
    #[tokio::test]
    async fn checkpoint_flush_persists_counters() {
        let h = Harness::new(8, HashAlgorithm::Crc32).await;
        h.create_pg(1, 2 * CHUNK_SIZE, &[]).await;
        let shard = h.store.create_shard(1, CHUNK_SIZE).await.unwrap();
        h.store.put_blob(shard.id, blob("hello", "")).await.unwrap();

        // The commit dirtied the PG but did not rewrite the superblock.
        let sb = PgSuperblk::from_bytes(&h.meta.scan(PG_META_NAME)[0]).unwrap();
        assert_eq!(sb.active_blob_count, 0);

        assert_eq!(h.store.checkpoint_flush(None), 1);
        let sb = PgSuperblk::from_bytes(&h.meta.scan(PG_META_NAME)[0]).unwrap();
        assert_eq!(sb.active_blob_count, 1);
        assert_eq!(sb.blob_sequence_num, 1);
        assert!(sb.total_occupied_blk_count > 0);

        // Nothing dirty: a second flush writes nothing.
        assert_eq!(h.store.checkpoint_flush(None), 0);
        assert_eq!(h.store.cp_progress_percent(), 100);
    }
}

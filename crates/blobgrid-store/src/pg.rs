//! Placement-group lifecycle
//!
//! PG creation travels through the replicated log: the proposer serializes
//! the `PgInfo` as a JSON record behind a CRC-sealed header, and every
//! replica materializes the PG at commit time (chunk reservation, index
//! table, superblock). Membership replacement delegates to the replication
//! service and rewrites the superblock member array on commit.

use crate::index::BlobIndexTable;
use crate::records::{PgSuperblk, PG_META_NAME};
use crate::shard::ShardEntry;
use crate::store::{BlobStore, PgIndexSlot};
use crate::wire::{build_msg, crc32_ieee, split_msg, ReplicationMessageType, INIT_CRC32};
use blobgrid_common::{ChunkNum, PeerId, PgError, PgId, PgInfo, PgMember, PgMemberStats, PgStats};
use blobgrid_repl::{ReplCtx, ReplDev, ReplServiceError, ReplicaMember};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Fixed translation of replication-service errors for PG callers
pub(crate) fn to_pg_error(e: ReplServiceError) -> PgError {
    match e {
        ReplServiceError::NotLeader => PgError::NotLeader,
        ReplServiceError::CannotRemoveLeader => PgError::UnknownPeer,
        ReplServiceError::Timeout => PgError::Timeout,
        ReplServiceError::ServerNotFound => PgError::UnknownPg,
        ReplServiceError::NoSpaceLeft => PgError::NoSpaceLeft,
        ReplServiceError::DriveWriteError => PgError::DriveWriteError,
        ReplServiceError::RetryRequest => PgError::RetryRequest,
        ReplServiceError::Failed => PgError::Unknown,
        ReplServiceError::BadRequest
        | ReplServiceError::Cancelled
        | ReplServiceError::ConfigChanging
        | ReplServiceError::ServerAlreadyExists
        | ReplServiceError::ServerIsJoining
        | ReplServiceError::ServerIsLeaving
        | ReplServiceError::ResultNotExistYet
        | ReplServiceError::TermMismatch
        | ReplServiceError::NotImplemented => PgError::InvalidArg,
    }
}

/// Durable counters of one PG, flushed with the superblock
#[derive(Default)]
pub struct DurableEntities {
    pub blob_sequence_num: AtomicU64,
    pub active_blob_count: AtomicU64,
    pub tombstone_blob_count: AtomicU64,
    pub total_occupied_blk_count: AtomicU64,
}

/// In-memory state of one hosted PG
pub struct PgEntry {
    pub(crate) info: RwLock<PgInfo>,
    pub(crate) repl_dev: Arc<dyn ReplDev>,
    pub(crate) index_table: Arc<BlobIndexTable>,
    /// v_chunk -> p_chunk, fixed at creation/recovery
    pub(crate) chunks: Vec<ChunkNum>,
    /// Shards keyed by sequence number
    pub(crate) shards: RwLock<BTreeMap<u64, Arc<ShardEntry>>>,
    /// Highest shard sequence number handed out
    pub(crate) shard_seq_num: AtomicU64,
    pub(crate) durable: DurableEntities,
    /// Superblock needs a checkpoint flush
    pub(crate) dirty: AtomicBool,
}

impl PgEntry {
    pub(crate) fn new(
        info: PgInfo,
        repl_dev: Arc<dyn ReplDev>,
        index_table: Arc<BlobIndexTable>,
        chunks: Vec<ChunkNum>,
    ) -> Self {
        assert_eq!(
            info.replica_set_uuid,
            repl_dev.group_id(),
            "PG replica set uuid mismatches its repl dev group"
        );
        Self {
            info: RwLock::new(info),
            repl_dev,
            index_table,
            chunks,
            shards: RwLock::new(BTreeMap::new()),
            shard_seq_num: AtomicU64::new(0),
            durable: DurableEntities::default(),
            dirty: AtomicBool::new(false),
        }
    }

    pub(crate) fn from_superblk(
        sb: &PgSuperblk,
        chunk_size: u64,
        repl_dev: Arc<dyn ReplDev>,
        index_table: Arc<BlobIndexTable>,
    ) -> Self {
        let info = PgInfo {
            id: sb.id,
            size: sb.pg_size,
            chunk_size,
            replica_set_uuid: sb.replica_set_uuid,
            members: sb.members.iter().cloned().collect(),
        };
        let entry = Self::new(info, repl_dev, index_table, sb.chunks.clone());
        entry
            .durable
            .blob_sequence_num
            .store(sb.blob_sequence_num, Ordering::Relaxed);
        entry
            .durable
            .active_blob_count
            .store(sb.active_blob_count, Ordering::Relaxed);
        entry
            .durable
            .tombstone_blob_count
            .store(sb.tombstone_blob_count, Ordering::Relaxed);
        entry
            .durable
            .total_occupied_blk_count
            .store(sb.total_occupied_blk_count, Ordering::Relaxed);
        entry
    }

    /// Total shards ever created on this PG
    #[must_use]
    pub fn total_shards(&self) -> u32 {
        self.shards.read().len() as u32
    }

    /// Shards currently open for writes
    #[must_use]
    pub fn open_shards(&self) -> u32 {
        self.shards
            .read()
            .values()
            .filter(|s| s.info.read().state.is_open())
            .count() as u32
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Materialize the current superblock contents
    pub(crate) fn superblk_snapshot(&self) -> PgSuperblk {
        let info = self.info.read();
        PgSuperblk {
            id: info.id,
            replica_set_uuid: info.replica_set_uuid,
            pg_size: info.size,
            index_table_uuid: self.index_table.uuid(),
            blob_sequence_num: self.durable.blob_sequence_num.load(Ordering::Relaxed),
            active_blob_count: self.durable.active_blob_count.load(Ordering::Relaxed),
            tombstone_blob_count: self.durable.tombstone_blob_count.load(Ordering::Relaxed),
            total_occupied_blk_count: self
                .durable
                .total_occupied_blk_count
                .load(Ordering::Relaxed),
            members: info.members.iter().cloned().collect(),
            chunks: self.chunks.clone(),
        }
    }
}

/// Proposer-side context of an in-flight PG message
pub(crate) struct PgReplCtx {
    tx: Mutex<Option<oneshot::Sender<Result<(), PgError>>>>,
}

impl PgReplCtx {
    pub(crate) fn make() -> (Arc<Self>, oneshot::Receiver<Result<(), PgError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub(crate) fn complete(&self, res: Result<(), PgError>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(res);
        }
    }
}

fn pg_ctx(ctx: Option<&ReplCtx>) -> Option<&PgReplCtx> {
    ctx.and_then(|c| c.downcast_ref::<PgReplCtx>())
}

impl BlobStore {
    /// Create a placement group across `peers`.
    ///
    /// Idempotent by `pg_id`: a PG that already exists locally reports
    /// success. Capacity is pre-checked before anything is proposed.
    pub async fn create_pg(&self, mut pg_info: PgInfo, peers: &[PeerId]) -> Result<(), PgError> {
        let pg_id = pg_info.id;
        if self.pg_exists(pg_id) {
            return Ok(());
        }
        if pg_info.size == 0 {
            warn!(pg_id, "refusing to create an empty PG");
            return Err(PgError::InvalidArg);
        }

        let chunk_size = self.chunk_selector.get_chunk_size();
        let needed_chunks = pg_info.size / chunk_size;
        let most_avail = u64::from(self.chunk_selector.most_avail_num_chunks());
        if needed_chunks > most_avail {
            warn!(pg_id, needed_chunks, most_avail, "not enough chunks for PG");
            return Err(PgError::NoSpaceLeft);
        }

        pg_info.chunk_size = chunk_size;
        pg_info.replica_set_uuid = Uuid::new_v4();
        let repl_dev = self
            .repl_service
            .create_repl_dev(pg_info.replica_set_uuid, peers)
            .await
            .map_err(to_pg_error)?;
        // Once the group exists, a committed CREATE_PG materializes the PG
        // and its index table on every member.
        self.do_create_pg(repl_dev, pg_info).await
    }

    async fn do_create_pg(
        &self,
        repl_dev: Arc<dyn ReplDev>,
        pg_info: PgInfo,
    ) -> Result<(), PgError> {
        let payload = serde_json::to_vec(&pg_info).map_err(|_| PgError::InvalidArg)?;
        let msg = build_msg(ReplicationMessageType::CreatePg, &payload);
        let (ctx, rx) = PgReplCtx::make();
        repl_dev.async_alloc_write(msg, Bytes::new(), Vec::new(), ctx);
        rx.await.unwrap_or(Err(PgError::Unknown))
    }

    /// `CREATE_PG` committed; executes on every replica
    pub(crate) fn on_create_pg_commit(&self, lsn: u64, header_blob: &[u8], ctx: Option<&ReplCtx>) {
        let ctx = pg_ctx(ctx);
        let complete = |res: Result<(), PgError>| {
            if let Some(c) = ctx {
                c.complete(res);
            }
        };

        let Ok((msg_header, payload)) = split_msg(header_blob) else {
            error!(lsn, "malformed create PG message");
            complete(Err(PgError::Unknown));
            return;
        };
        if msg_header.corrupted() {
            error!(lsn, "create PG message header is corrupted");
            complete(Err(PgError::CrcMismatch));
            return;
        }
        if crc32_ieee(INIT_CRC32, payload) != msg_header.payload_crc {
            error!(lsn, "create PG message payload mismatches its crc");
            complete(Err(PgError::CrcMismatch));
            return;
        }
        let Ok(pg_info) = serde_json::from_slice::<PgInfo>(payload) else {
            error!(lsn, "create PG payload does not deserialize");
            complete(Err(PgError::Unknown));
            return;
        };

        let pg_id = pg_info.id;
        if self.pg_exists(pg_id) {
            warn!(lsn, pg_id, "PG already exists");
            complete(Ok(()));
            return;
        }

        let local_chunk_size = self.chunk_selector.get_chunk_size();
        if pg_info.chunk_size != local_chunk_size {
            error!(
                leader_chunk_size = pg_info.chunk_size,
                local_chunk_size, "chunk sizes are inconsistent across replicas"
            );
            complete(Err(PgError::Unknown));
            return;
        }

        if self
            .chunk_selector
            .select_chunks_for_pg(pg_id, pg_info.size)
            .is_none()
        {
            warn!(pg_id, "failed to select chunks for PG");
            complete(Err(PgError::NoSpaceLeft));
            return;
        }
        let Some(chunks) = self.chunk_selector.get_pg_chunks(pg_id) else {
            warn!(pg_id, "failed to fetch PG chunks");
            complete(Err(PgError::NoSpaceLeft));
            return;
        };

        let Ok(repl_dev) = self.repl_service.get_repl_dev(pg_info.replica_set_uuid) else {
            error!(pg_id, group = %pg_info.replica_set_uuid, "repl dev missing at commit");
            complete(Err(PgError::Unknown));
            return;
        };

        let index_table = self.create_index_table();
        let uuid = index_table.uuid();
        {
            let mut tables = self.index_tables.lock();
            assert!(!tables.contains_key(&uuid), "duplicate index table found");
            tables.insert(
                uuid,
                PgIndexSlot {
                    pg_id: Some(pg_id),
                    table: index_table.clone(),
                },
            );
        }
        info!(pg_id, index_uuid = %uuid, "index table created for PG");

        let entry = Arc::new(PgEntry::new(pg_info, repl_dev, index_table, chunks));
        self.persist_pg_superblk(&entry);
        self.add_pg_to_map(entry);
        complete(Ok(()));
    }

    /// Replace `member_out` with `member_in` in the PG's replica set.
    ///
    /// Leader-only unless `commit_quorum` overrides; the actual membership
    /// change is the replication service's to make.
    pub async fn replace_member(
        &self,
        pg_id: PgId,
        member_out: PeerId,
        member_in: PgMember,
        commit_quorum: u32,
    ) -> Result<(), PgError> {
        let group_id = {
            let pgs = self.pgs.read();
            let pg = pgs.get(&pg_id).ok_or(PgError::UnknownPg)?;
            if !pg.repl_dev.is_leader() && commit_quorum == 0 {
                return Err(PgError::NotLeader);
            }
            pg.repl_dev.group_id()
        };

        info!(pg_id, out = %member_out, inn = %member_in.id, "PG replace member initiated");
        self.repl_service
            .replace_member(
                group_id,
                ReplicaMember::new(member_out, "", 0),
                ReplicaMember::new(member_in.id, member_in.name, member_in.priority),
                commit_quorum,
            )
            .await
            .map_err(to_pg_error)
    }

    /// Membership change committed; update the member set and superblock
    pub(crate) fn on_pg_replace_member(
        &self,
        group_id: Uuid,
        member_out: &ReplicaMember,
        member_in: &ReplicaMember,
    ) {
        let Some(pg) = self.pg_for_group(group_id) else {
            error!(group = %group_id, out = %member_out.id, inn = %member_in.id,
                "PG replace member failed, no PG for group");
            return;
        };
        {
            let mut info = pg.info.write();
            info.members.remove(&PgMember::new(member_out.id, "", 0));
            info.members.insert(PgMember::new(
                member_in.id,
                member_in.name.clone(),
                member_in.priority,
            ));
        }
        self.persist_pg_superblk(&pg);
        info!(out = %member_out.id, inn = %member_in.id, "PG replace member done");
    }

    /// Ids of all PGs hosted here
    #[must_use]
    pub fn list_pg_ids(&self) -> Vec<PgId> {
        self.pgs.read().keys().copied().collect()
    }

    /// Statistics of one PG
    #[must_use]
    pub fn get_pg_stats(&self, pg_id: PgId) -> Option<PgStats> {
        let pg = self.get_pg(pg_id)?;
        let blk_size = u64::from(pg.repl_dev.blk_size());
        let info = pg.info.read();

        let replication_status = pg.repl_dev.get_replication_status();
        let members = info
            .members
            .iter()
            .map(|m| {
                // Status can be empty on a follower.
                let status = replication_status.iter().find(|r| r.id == m.id);
                PgMemberStats {
                    id: m.id,
                    name: m.name.clone(),
                    last_commit_lsn: status.map_or(0, |r| r.replication_idx),
                    last_succ_resp_us: status.map_or(0, |r| r.last_succ_resp_us),
                }
            })
            .collect();

        Some(PgStats {
            id: info.id,
            replica_set_uuid: info.replica_set_uuid,
            leader_id: pg.repl_dev.leader_id(),
            num_members: info.members.len() as u32,
            total_shards: pg.total_shards(),
            open_shards: pg.open_shards(),
            num_active_objects: pg.durable.active_blob_count.load(Ordering::Relaxed),
            num_tombstone_objects: pg.durable.tombstone_blob_count.load(Ordering::Relaxed),
            avail_open_shards: self.chunk_selector.avail_num_chunks(pg_id),
            avail_bytes: self.chunk_selector.avail_blks(pg_id) * blk_size,
            used_bytes: pg.durable.total_occupied_blk_count.load(Ordering::Relaxed) * blk_size,
            members,
        })
    }

    pub(crate) fn add_pg_to_map(&self, pg: Arc<PgEntry>) {
        let id = pg.info.read().id;
        let mut pgs = self.pgs.write();
        let inserted = pgs.insert(id, pg).is_none();
        assert!(inserted, "PG {id} inserted twice");
    }

    /// Write the PG superblock through the meta-blk service
    pub(crate) fn persist_pg_superblk(&self, pg: &PgEntry) {
        let sb = pg.superblk_snapshot();
        self.meta_service
            .write(PG_META_NAME, u64::from(sb.id), sb.to_bytes());
        pg.dirty.store(false, Ordering::Release);
    }
}

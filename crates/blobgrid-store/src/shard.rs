//! Shard lifecycle
//!
//! Shards are created and sealed through the replicated log. The leader
//! stamps a shard superblock into the message; each replica resolves the
//! virtual chunk to its local physical chunk at commit and pins it. A
//! pre-commit hook vetoes a create whose chunk was consumed by a racing
//! shard, and rollback returns the reservation so a retry can succeed.

use crate::records::{ShardSuperblk, SHARD_META_NAME};
use crate::store::BlobStore;
use crate::wire::{build_msg, crc32_ieee, split_msg, ReplicationMessageType, INIT_CRC32};
use blobgrid_common::{ChunkNum, PgId, ShardError, ShardId, ShardInfo, ShardState};
use blobgrid_repl::{ReplCtx, ReplServiceError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::pg::PgEntry;

/// Translation of replication-service errors for shard callers
pub(crate) fn to_shard_error(e: ReplServiceError) -> ShardError {
    match e {
        ReplServiceError::NotLeader => ShardError::NotLeader,
        ReplServiceError::Timeout
        | ReplServiceError::RetryRequest
        | ReplServiceError::Cancelled => ShardError::Timeout,
        ReplServiceError::ServerNotFound => ShardError::UnknownPg,
        _ => ShardError::InvalidArg,
    }
}

/// In-memory state of one shard
pub struct ShardEntry {
    pub(crate) info: RwLock<ShardInfo>,
    /// Physical chunk on this replica
    pub(crate) p_chunk_id: ChunkNum,
    /// Virtual chunk within the owning PG
    pub(crate) v_chunk_id: ChunkNum,
}

impl ShardEntry {
    pub(crate) fn new(info: ShardInfo, p_chunk_id: ChunkNum, v_chunk_id: ChunkNum) -> Self {
        Self {
            info: RwLock::new(info),
            p_chunk_id,
            v_chunk_id,
        }
    }
}

/// Proposer-side context of an in-flight shard message
pub(crate) struct ShardReplCtx {
    tx: Mutex<Option<oneshot::Sender<Result<ShardInfo, ShardError>>>>,
}

impl ShardReplCtx {
    pub(crate) fn make() -> (
        Arc<Self>,
        oneshot::Receiver<Result<ShardInfo, ShardError>>,
    ) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub(crate) fn complete(&self, res: Result<ShardInfo, ShardError>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(res);
        }
    }
}

fn shard_ctx(ctx: Option<&ReplCtx>) -> Option<&ShardReplCtx> {
    ctx.and_then(|c| c.downcast_ref::<ShardReplCtx>())
}

impl BlobStore {
    /// Allocate the next shard id of the PG
    pub(crate) fn generate_new_shard_id(&self, pg: &PgEntry) -> ShardId {
        let pg_id = pg.info.read().id;
        let seq = pg.shard_seq_num.fetch_add(1, Ordering::Relaxed) + 1;
        ShardId::from_parts(pg_id, seq)
    }

    /// Create an open shard on `pg_id`; leader-only
    pub async fn create_shard(
        &self,
        pg_id: PgId,
        size_bytes: u64,
    ) -> Result<ShardInfo, ShardError> {
        if size_bytes == 0 {
            return Err(ShardError::InvalidArg);
        }
        let pg = self.get_pg(pg_id).ok_or(ShardError::UnknownPg)?;
        if !pg.repl_dev.is_leader() {
            return Err(ShardError::NotLeader);
        }
        let Some(v_chunk_id) = self.chunk_selector.preselect_v_chunk(pg_id) else {
            warn!(pg_id, "no free chunk for a new shard");
            return Err(ShardError::InvalidArg);
        };

        let shard_id = self.generate_new_shard_id(&pg);
        let now = chrono::Utc::now().timestamp() as u64;
        let info = ShardInfo {
            id: shard_id,
            placement_group: pg_id,
            state: ShardState::Open,
            created_time: now,
            last_modified_time: now,
            total_capacity_bytes: size_bytes,
            used_capacity_bytes: 0,
            deleted_capacity_bytes: 0,
        };
        // p_chunk is replica-local; each member resolves it at commit.
        let sb = ShardSuperblk::new(info, 0, v_chunk_id);
        let msg = build_msg(ReplicationMessageType::CreateShard, &sb.to_bytes());

        let (ctx, rx) = ShardReplCtx::make();
        pg.repl_dev
            .async_alloc_write(msg, Bytes::new(), Vec::new(), ctx);
        rx.await.unwrap_or(Err(ShardError::Timeout))
    }

    /// Seal a shard against further writes; leader-only
    pub async fn seal_shard(&self, shard_id: ShardId) -> Result<ShardInfo, ShardError> {
        let shard = self
            .get_shard_entry(shard_id)
            .ok_or(ShardError::UnknownShard)?;
        let pg = self
            .get_pg(shard_id.pg_id())
            .ok_or(ShardError::UnknownPg)?;
        if !pg.repl_dev.is_leader() {
            return Err(ShardError::NotLeader);
        }

        let mut info = shard.info.read().clone();
        if info.state == ShardState::Sealed {
            return Ok(info);
        }
        if info.state == ShardState::Deleted {
            return Err(ShardError::InvalidArg);
        }
        info.state = ShardState::Sealed;
        info.last_modified_time = chrono::Utc::now().timestamp() as u64;
        let sb = ShardSuperblk::new(info, shard.p_chunk_id, shard.v_chunk_id);
        let msg = build_msg(ReplicationMessageType::SealShard, &sb.to_bytes());

        let (ctx, rx) = ShardReplCtx::make();
        pg.repl_dev
            .async_alloc_write(msg, Bytes::new(), Vec::new(), ctx);
        rx.await.unwrap_or(Err(ShardError::Timeout))
    }

    /// Shard metadata lookup
    pub fn get_shard(&self, shard_id: ShardId) -> Result<ShardInfo, ShardError> {
        self.get_shard_entry(shard_id)
            .map(|s| s.info.read().clone())
            .ok_or(ShardError::UnknownShard)
    }

    /// All shards of a PG in ascending sequence order
    pub fn list_shards(&self, pg_id: PgId) -> Result<Vec<ShardInfo>, ShardError> {
        let pg = self.get_pg(pg_id).ok_or(ShardError::UnknownPg)?;
        let shards = pg.shards.read();
        Ok(shards.values().map(|s| s.info.read().clone()).collect())
    }

    /// Physical chunk pinned by a shard on this replica
    #[must_use]
    pub fn get_shard_p_chunk_id(&self, shard_id: ShardId) -> Option<ChunkNum> {
        self.get_shard_entry(shard_id).map(|s| s.p_chunk_id)
    }

    /// Virtual chunk of a shard within its PG
    #[must_use]
    pub fn get_shard_v_chunk_id(&self, shard_id: ShardId) -> Option<ChunkNum> {
        self.get_shard_entry(shard_id).map(|s| s.v_chunk_id)
    }

    /// Virtual chunk recorded in a CREATE_SHARD message
    #[must_use]
    pub fn resolve_v_chunk_id_from_msg(&self, header_blob: &[u8]) -> Option<ChunkNum> {
        let (_, payload) = split_msg(header_blob).ok()?;
        let sb = ShardSuperblk::from_bytes(payload).ok()?;
        Some(sb.v_chunk_id)
    }

    /// Return the chunk reserved by a CREATE_SHARD message to its PG.
    ///
    /// Invoked on log rollback and on proposer-side errors; release is
    /// idempotent so repeated invocations are safe.
    pub(crate) fn release_chunk_based_on_create_shard_message(&self, header_blob: &[u8]) -> bool {
        let Ok((_, payload)) = split_msg(header_blob) else {
            return false;
        };
        let Ok(sb) = ShardSuperblk::from_bytes(payload) else {
            return false;
        };
        self.chunk_selector
            .release_v_chunk(sb.info.placement_group, sb.v_chunk_id)
    }

    /// Veto a CREATE_SHARD whose chunk was consumed by a racing shard
    pub(crate) fn on_shard_message_pre_commit(&self, lsn: u64, header_blob: &[u8]) -> bool {
        let Ok((msg_header, payload)) = split_msg(header_blob) else {
            return false;
        };
        if msg_header.msg_type != ReplicationMessageType::CreateShard {
            return true;
        }
        let Ok(sb) = ShardSuperblk::from_bytes(payload) else {
            return false;
        };
        let pg_id = sb.info.placement_group;
        if self.get_shard_entry(sb.info.id).is_some() {
            return true;
        }
        let ok = self.chunk_selector.try_mark_busy(pg_id, sb.v_chunk_id);
        if !ok {
            warn!(
                lsn,
                pg_id,
                v_chunk = sb.v_chunk_id,
                "chunk already consumed, vetoing shard create"
            );
        }
        ok
    }

    /// Undo the pre-commit chunk reservation of a rolled-back CREATE_SHARD
    pub(crate) fn on_shard_message_rollback(
        &self,
        lsn: u64,
        header_blob: &[u8],
        ctx: Option<&ReplCtx>,
    ) {
        if let Ok((msg_header, _)) = split_msg(header_blob) {
            if msg_header.msg_type == ReplicationMessageType::CreateShard {
                self.release_chunk_based_on_create_shard_message(header_blob);
            }
        }
        warn!(lsn, "shard message rolled back");
        if let Some(c) = shard_ctx(ctx) {
            c.complete(Err(ShardError::Timeout));
        }
    }

    /// CREATE_SHARD / SEAL_SHARD committed; executes on every replica
    pub(crate) fn on_shard_message_commit(
        &self,
        lsn: u64,
        header_blob: &[u8],
        ctx: Option<&ReplCtx>,
    ) {
        let ctx = shard_ctx(ctx);
        let complete = |res: Result<ShardInfo, ShardError>| {
            if let Some(c) = ctx {
                c.complete(res);
            }
        };

        let Ok((msg_header, payload)) = split_msg(header_blob) else {
            error!(lsn, "malformed shard message");
            complete(Err(ShardError::InvalidArg));
            return;
        };
        if msg_header.corrupted()
            || crc32_ieee(INIT_CRC32, payload) != msg_header.payload_crc
        {
            error!(lsn, "shard message failed crc validation");
            complete(Err(ShardError::InvalidArg));
            return;
        }
        let Ok(sb) = ShardSuperblk::from_bytes(payload) else {
            error!(lsn, "shard superblock does not parse");
            complete(Err(ShardError::InvalidArg));
            return;
        };

        match msg_header.msg_type {
            ReplicationMessageType::CreateShard => {
                complete(self.on_create_shard_commit(lsn, sb));
            }
            ReplicationMessageType::SealShard => {
                complete(self.on_seal_shard_commit(lsn, sb));
            }
            other => {
                error!(lsn, ?other, "unexpected message type in shard commit");
                complete(Err(ShardError::InvalidArg));
            }
        }
    }

    fn on_create_shard_commit(&self, lsn: u64, sb: ShardSuperblk) -> Result<ShardInfo, ShardError> {
        let shard_id = sb.info.id;
        let pg_id = sb.info.placement_group;
        let Some(pg) = self.get_pg(pg_id) else {
            warn!(lsn, pg_id, "create shard commit for unknown PG");
            return Err(ShardError::UnknownPg);
        };
        if let Some(existing) = self.get_shard_entry(shard_id) {
            // Replayed entry; the shard was already materialized.
            return Ok(existing.info.read().clone());
        }
        let Some(p_chunk_id) = self.chunk_selector.v_to_p(pg_id, sb.v_chunk_id) else {
            error!(lsn, pg_id, v_chunk = sb.v_chunk_id, "v_chunk out of range");
            return Err(ShardError::InvalidArg);
        };
        // Already busy when this replica ran pre-commit; claim it otherwise.
        self.chunk_selector.try_mark_busy(pg_id, sb.v_chunk_id);

        let persisted = ShardSuperblk::new(sb.info.clone(), p_chunk_id, sb.v_chunk_id);
        self.meta_service.write(
            SHARD_META_NAME,
            shard_id.as_u64(),
            persisted.to_bytes(),
        );

        let entry = Arc::new(ShardEntry::new(sb.info.clone(), p_chunk_id, sb.v_chunk_id));
        self.add_new_shard_to_map(&pg, entry);
        info!(lsn, %shard_id, pg_id, p_chunk_id, v_chunk = sb.v_chunk_id, "shard created");
        Ok(sb.info)
    }

    fn on_seal_shard_commit(&self, lsn: u64, sb: ShardSuperblk) -> Result<ShardInfo, ShardError> {
        let shard_id = sb.info.id;
        let Some(shard) = self.get_shard_entry(shard_id) else {
            warn!(lsn, %shard_id, "seal commit for unknown shard");
            return Err(ShardError::UnknownShard);
        };
        let updated = {
            let mut info = shard.info.write();
            match info.state {
                ShardState::Open => {
                    // Timestamps come from the replicated record so all
                    // replicas persist identical metadata.
                    info.state = ShardState::Sealed;
                    info.last_modified_time = sb.info.last_modified_time;
                    Some(info.clone())
                }
                ShardState::Sealed => None,
                ShardState::Deleted => {
                    return Err(ShardError::InvalidArg);
                }
            }
        };
        match updated {
            Some(info) => {
                let persisted =
                    ShardSuperblk::new(info.clone(), shard.p_chunk_id, shard.v_chunk_id);
                self.meta_service.write(
                    SHARD_META_NAME,
                    shard_id.as_u64(),
                    persisted.to_bytes(),
                );
                info!(lsn, %shard_id, "shard sealed");
                Ok(info)
            }
            // Replayed seal; already terminal for writes.
            None => Ok(shard.info.read().clone()),
        }
    }

    pub(crate) fn add_new_shard_to_map(&self, pg: &PgEntry, shard: Arc<ShardEntry>) {
        let (shard_id, seq) = {
            let info = shard.info.read();
            (info.id, info.id.seq_num())
        };
        pg.shards.write().insert(seq, shard.clone());
        pg.shard_seq_num.fetch_max(seq, Ordering::Relaxed);
        self.shards.write().insert(shard_id, shard);
    }
}

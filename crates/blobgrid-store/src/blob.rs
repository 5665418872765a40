//! Blob engine: put / get / delete
//!
//! A blob payload is written as a single replicated entry whose data is the
//! scatter-gather list `header+user_key | data | zero padding`, with each
//! region aligned to `IO_ALIGN` and the whole payload padded to
//! `DATA_BLOCK_SIZE`. Commit inserts the blob route into the owning PG's
//! index table and advances the durable counters; delete swaps the route to
//! the tombstone sentinel.

use crate::index::BlobRouteKey;
use crate::records::{
    round_up, BlobHeader, DataHeader, DataType, DATA_BLOCK_SIZE, IO_ALIGN,
};
use crate::store::BlobStore;
use crate::wire::{build_msg, crc32_ieee, split_msg, ReplicationMessageType, INIT_CRC32};
use blobgrid_common::{
    compute_blob_hash, Blob, BlobError, BlobId, HashAlgorithm, ShardId, ShardState,
    BLOB_MAX_HASH_LEN,
};
use blobgrid_repl::{BlkAllocHints, MultiBlkId, ReplCtx, ReplServiceError};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, warn};

/// Translation of replication-service errors for blob callers
pub(crate) fn to_blob_error(e: ReplServiceError) -> BlobError {
    match e {
        ReplServiceError::NotLeader => BlobError::NotLeader,
        ReplServiceError::Timeout
        | ReplServiceError::RetryRequest
        | ReplServiceError::Cancelled => BlobError::Timeout,
        ReplServiceError::NoSpaceLeft => BlobError::NoSpaceLeft,
        _ => BlobError::InvalidArg,
    }
}

/// Proposer-side context of an in-flight blob message
pub(crate) struct BlobReplCtx {
    tx: Mutex<Option<oneshot::Sender<Result<(), BlobError>>>>,
}

impl BlobReplCtx {
    pub(crate) fn make() -> (Arc<Self>, oneshot::Receiver<Result<(), BlobError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub(crate) fn complete(&self, res: Result<(), BlobError>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(res);
        }
    }
}

fn blob_ctx(ctx: Option<&ReplCtx>) -> Option<&BlobReplCtx> {
    ctx.and_then(|c| c.downcast_ref::<BlobReplCtx>())
}

impl BlobStore {
    /// Write a blob into an open shard; returns the assigned blob id
    pub async fn put_blob(&self, shard_id: ShardId, blob: Blob) -> Result<BlobId, BlobError> {
        let shard = self
            .get_shard_entry(shard_id)
            .ok_or(BlobError::InvalidArg)?;
        {
            let info = shard.info.read();
            if info.state == ShardState::Sealed {
                return Err(BlobError::SealedShard);
            }
            if info.state != ShardState::Open {
                return Err(BlobError::InvalidArg);
            }
        }
        let pg = self.get_pg(shard_id.pg_id()).ok_or(BlobError::InvalidArg)?;
        if !pg.repl_dev.is_leader() {
            return Err(BlobError::NotLeader);
        }
        if blob.body.len() > u32::MAX as usize || blob.user_key.len() > u32::MAX as usize {
            return Err(BlobError::InvalidArg);
        }

        // The leader stamps the blob id; followers replay it from the header.
        let blob_id = pg.durable.blob_sequence_num.fetch_add(1, Ordering::Relaxed);

        let hash = compute_blob_hash(
            self.cfg.blob_hash_algorithm,
            &blob.body,
            &blob.user_key,
        );
        let header_region = round_up(BlobHeader::SIZE + blob.user_key.len(), IO_ALIGN);
        let header = BlobHeader {
            header: DataHeader::new(DataType::BlobInfo),
            hash_algorithm: self.cfg.blob_hash_algorithm,
            hash,
            shard_id,
            blob_id,
            blob_size: blob.body.len() as u32,
            object_offset: blob.object_offset,
            data_offset: header_region as u32,
            user_key_size: blob.user_key.len() as u32,
        };

        let mut header_buf = BytesMut::zeroed(header_region);
        header_buf[..BlobHeader::SIZE].copy_from_slice(&header.to_bytes());
        header_buf[BlobHeader::SIZE..BlobHeader::SIZE + blob.user_key.len()]
            .copy_from_slice(&blob.user_key);

        let data_region = round_up(blob.body.len(), IO_ALIGN);
        let data_buf = if data_region == blob.body.len() {
            blob.body.clone()
        } else {
            let mut buf = BytesMut::zeroed(data_region);
            buf[..blob.body.len()].copy_from_slice(&blob.body);
            buf.freeze()
        };

        let total = header_region + data_region;
        let pad = round_up(total, DATA_BLOCK_SIZE as usize) - total;
        let mut sgl = vec![header_buf.freeze(), data_buf];
        if pad > 0 {
            sgl.push(self.get_pad_buf(pad));
        }

        let msg = build_msg(ReplicationMessageType::PutBlob, &header.to_bytes());
        let key = BlobRouteKey::new(shard_id, blob_id).to_bytes();
        let (ctx, rx) = BlobReplCtx::make();
        pg.repl_dev.async_alloc_write(msg, key, sgl, ctx);
        rx.await.unwrap_or(Err(BlobError::Timeout))?;
        Ok(blob_id)
    }

    /// Route a blob write's allocation to its shard's pinned chunk
    pub(crate) fn blob_put_get_blk_alloc_hints(
        &self,
        header_blob: &[u8],
        _data_size: u64,
    ) -> Result<BlkAllocHints, ReplServiceError> {
        let (_, payload) = split_msg(header_blob).map_err(|_| ReplServiceError::BadRequest)?;
        let header =
            BlobHeader::from_bytes(payload).map_err(|_| ReplServiceError::BadRequest)?;
        let shard = self
            .get_shard_entry(header.shard_id)
            .ok_or(ReplServiceError::ServerNotFound)?;
        if !shard.info.read().state.is_open() {
            // Lost a race with a seal; fail the write before replication.
            return Err(ReplServiceError::BadRequest);
        }
        Ok(BlkAllocHints::for_chunk(shard.p_chunk_id))
    }

    /// PUT_BLOB committed; executes on every replica
    pub(crate) fn on_blob_put_commit(
        &self,
        lsn: u64,
        header_blob: &[u8],
        _key: &[u8],
        pbas: &MultiBlkId,
        ctx: Option<&ReplCtx>,
    ) {
        let ctx = blob_ctx(ctx);
        let complete = |res: Result<(), BlobError>| {
            if let Some(c) = ctx {
                c.complete(res);
            }
        };

        let Ok((msg_header, payload)) = split_msg(header_blob) else {
            error!(lsn, "malformed blob put message");
            complete(Err(BlobError::InvalidArg));
            return;
        };
        if msg_header.corrupted()
            || crc32_ieee(INIT_CRC32, payload) != msg_header.payload_crc
        {
            error!(lsn, "blob put message failed crc validation");
            complete(Err(BlobError::CrcMismatch));
            return;
        }
        let Ok(header) = BlobHeader::from_bytes(payload) else {
            error!(lsn, "blob header does not parse");
            complete(Err(BlobError::CrcMismatch));
            return;
        };

        let shard_id = header.shard_id;
        let blob_id = header.blob_id;
        let Some(pg) = self.get_pg(shard_id.pg_id()) else {
            error!(lsn, %shard_id, "blob put commit for unknown PG");
            complete(Err(BlobError::InvalidArg));
            return;
        };

        let key = BlobRouteKey::new(shard_id, blob_id);
        if !self.add_to_index_table(&pg.index_table, key, pbas) {
            // Replayed entry; counters were advanced on the first commit.
            complete(Ok(()));
            return;
        }

        pg.durable
            .blob_sequence_num
            .fetch_max(blob_id + 1, Ordering::Relaxed);
        pg.durable.active_blob_count.fetch_add(1, Ordering::Relaxed);
        pg.durable
            .total_occupied_blk_count
            .fetch_add(u64::from(pbas.total_blks()), Ordering::Relaxed);
        pg.mark_dirty();

        if let Some(shard) = self.get_shard_entry(shard_id) {
            let mut info = shard.info.write();
            info.used_capacity_bytes +=
                u64::from(pbas.total_blks()) * u64::from(pg.repl_dev.blk_size());
            info.last_modified_time = chrono::Utc::now().timestamp() as u64;
        } else {
            warn!(lsn, %shard_id, "blob committed against a shard not in the map");
        }
        complete(Ok(()));
    }

    /// Read a blob (or a slice of it); `len == 0` means "to the end"
    pub async fn get_blob(
        &self,
        shard_id: ShardId,
        blob_id: BlobId,
        off: u64,
        len: u64,
    ) -> Result<Blob, BlobError> {
        let shard = self
            .get_shard_entry(shard_id)
            .ok_or(BlobError::InvalidArg)?;
        if shard.info.read().state == ShardState::Deleted {
            return Err(BlobError::InvalidArg);
        }
        let pg = self.get_pg(shard_id.pg_id()).ok_or(BlobError::InvalidArg)?;
        let pbas = self.get_blob_from_index_table(&pg.index_table, shard_id, blob_id)?;

        let read_size = u64::from(pbas.total_blks()) * u64::from(pg.repl_dev.blk_size());
        let buf = pg
            .repl_dev
            .async_read(&pbas, read_size as usize)
            .await
            .map_err(to_blob_error)?;

        let header = BlobHeader::from_bytes(&buf).map_err(|_| {
            error!(%shard_id, blob_id, "stored blob header fails validation");
            BlobError::CrcMismatch
        })?;
        if header.shard_id != shard_id || header.blob_id != blob_id {
            error!(%shard_id, blob_id, "stored blob header identifies a different blob");
            return Err(BlobError::CrcMismatch);
        }

        let data_start = header.data_offset as usize;
        let data_end = data_start + header.blob_size as usize;
        let key_start = BlobHeader::SIZE;
        let key_end = key_start + header.user_key_size as usize;
        if data_end > buf.len() || key_end > data_start {
            error!(%shard_id, blob_id, "stored blob layout is inconsistent");
            return Err(BlobError::CrcMismatch);
        }
        let user_key = buf.slice(key_start..key_end);
        let data = buf.slice(data_start..data_end);

        let expected = compute_blob_hash(header.hash_algorithm, &data, &user_key);
        if expected != header.hash {
            error!(%shard_id, blob_id, "blob payload hash mismatch");
            return Err(BlobError::CrcMismatch);
        }

        let size = header.blob_size as u64;
        if off > size {
            return Err(BlobError::InvalidArg);
        }
        let end = if len == 0 {
            size
        } else {
            size.min(off.saturating_add(len))
        };
        Ok(Blob {
            body: data.slice(off as usize..end as usize),
            user_key,
            object_offset: header.object_offset,
        })
    }

    /// Tombstone a blob; idempotent once committed
    pub async fn del_blob(&self, shard_id: ShardId, blob_id: BlobId) -> Result<(), BlobError> {
        let shard = self
            .get_shard_entry(shard_id)
            .ok_or(BlobError::InvalidArg)?;
        if shard.info.read().state == ShardState::Deleted {
            return Err(BlobError::InvalidArg);
        }
        let pg = self.get_pg(shard_id.pg_id()).ok_or(BlobError::InvalidArg)?;
        if !pg.repl_dev.is_leader() {
            return Err(BlobError::NotLeader);
        }

        // Resolve liveness up front: deleting a deleted blob is a no-op
        // success, deleting a never-written id is an error.
        let key = BlobRouteKey::new(shard_id, blob_id);
        match pg.index_table.get(&key) {
            None => return Err(BlobError::UnknownBlob),
            Some(v) if v.is_tombstone() => return Ok(()),
            Some(_) => {}
        }

        let header = BlobHeader {
            header: DataHeader::new(DataType::BlobInfo),
            hash_algorithm: HashAlgorithm::None,
            hash: [0u8; BLOB_MAX_HASH_LEN],
            shard_id,
            blob_id,
            blob_size: 0,
            object_offset: 0,
            data_offset: 0,
            user_key_size: 0,
        };
        let msg = build_msg(ReplicationMessageType::DelBlob, &header.to_bytes());
        let (ctx, rx) = BlobReplCtx::make();
        pg.repl_dev
            .async_alloc_write(msg, key.to_bytes(), Vec::new(), ctx);
        rx.await.unwrap_or(Err(BlobError::Timeout))
    }

    /// DEL_BLOB committed; executes on every replica
    pub(crate) fn on_blob_del_commit(
        &self,
        lsn: u64,
        header_blob: &[u8],
        _key: &[u8],
        ctx: Option<&ReplCtx>,
    ) {
        let ctx = blob_ctx(ctx);
        let complete = |res: Result<(), BlobError>| {
            if let Some(c) = ctx {
                c.complete(res);
            }
        };

        let Ok((msg_header, payload)) = split_msg(header_blob) else {
            error!(lsn, "malformed blob delete message");
            complete(Err(BlobError::InvalidArg));
            return;
        };
        if msg_header.corrupted()
            || crc32_ieee(INIT_CRC32, payload) != msg_header.payload_crc
        {
            error!(lsn, "blob delete message failed crc validation");
            complete(Err(BlobError::CrcMismatch));
            return;
        }
        let Ok(header) = BlobHeader::from_bytes(payload) else {
            error!(lsn, "blob delete header does not parse");
            complete(Err(BlobError::CrcMismatch));
            return;
        };

        let shard_id = header.shard_id;
        let blob_id = header.blob_id;
        let Some(pg) = self.get_pg(shard_id.pg_id()) else {
            error!(lsn, %shard_id, "blob delete commit for unknown PG");
            complete(Err(BlobError::InvalidArg));
            return;
        };

        let key = BlobRouteKey::new(shard_id, blob_id);
        match self.move_to_tombstone(&pg.index_table, key) {
            Ok(Some(pbas)) => {
                pg.durable.active_blob_count.fetch_sub(1, Ordering::Relaxed);
                pg.durable
                    .tombstone_blob_count
                    .fetch_add(1, Ordering::Relaxed);
                pg.mark_dirty();
                if let Some(shard) = self.get_shard_entry(shard_id) {
                    let mut info = shard.info.write();
                    info.deleted_capacity_bytes +=
                        u64::from(pbas.total_blks()) * u64::from(pg.repl_dev.blk_size());
                }
                complete(Ok(()));
            }
            // Already a tombstone: replayed delete.
            Ok(None) => complete(Ok(())),
            Err(e) => {
                warn!(lsn, %shard_id, blob_id, "delete commit for unknown blob route");
                complete(Err(e));
            }
        }
    }
}

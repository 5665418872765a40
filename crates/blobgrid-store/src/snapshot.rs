//! PG resync snapshot iterator
//!
//! Streams one PG's state to a joining replica in bounded batches: a
//! `ResyncPgMetaData` preamble first, then for each shard (ascending
//! sequence number) a shard-metadata batch followed by blob batches in
//! ascending blob id. `end_of_shard` tells the receiver when it can flush
//! the shard it is rebuilding. Iteration is deterministic: the same state
//! yields the same batches.

use crate::store::BlobStore;
use blobgrid_common::{
    Blob, BlobError, BlobId, GroupId, PgId, PgMember, ShardId, ShardInfo,
};
use blobgrid_repl::MultiBlkId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Preamble of a PG resync stream (batch 0)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResyncPgMetaData {
    pub pg_id: PgId,
    pub replica_set_uuid: uuid::Uuid,
    pub pg_size: u64,
    pub chunk_size: u64,
    pub blob_seq_num: u64,
    pub shard_seq_num: u64,
    pub members: Vec<PgMember>,
    pub shard_ids: Vec<u64>,
    pub total_blobs_to_transfer: u64,
    pub total_bytes_to_transfer: u64,
}

/// One blob in a resync data batch
#[derive(Clone, Debug)]
pub struct BlobInfoData {
    pub shard_id: ShardId,
    pub blob_id: BlobId,
    pub pbas: MultiBlkId,
    pub blob: Blob,
}

/// One unit of the resync stream
#[derive(Clone, Debug)]
pub enum SnapshotBatch {
    /// Batch 0: PG-wide metadata
    PgMeta(ResyncPgMetaData),
    /// Metadata of the shard whose blobs follow
    ShardMeta(ShardInfo),
    /// Blob payloads; `end_of_shard` flags the shard's last batch
    Blobs {
        entries: Vec<BlobInfoData>,
        end_of_shard: bool,
    },
}

/// Iterator over a PG's alive blobs for resync
pub struct PgBlobIterator {
    store: Arc<BlobStore>,
    pg_id: PgId,
    group_id: GroupId,
    /// Log index the stream is consistent with
    upto_lsn: u64,
    shard_seqs: Vec<u64>,
    shard_idx: usize,
    next_blob: BlobId,
    emitted_pg_meta: bool,
    entered_shard: bool,
    batch_num: u64,
    total_blobs: u64,
    total_bytes: u64,
}

impl PgBlobIterator {
    /// Open an iterator over the PG owning `group_id`
    pub fn new(store: Arc<BlobStore>, group_id: GroupId, upto_lsn: u64) -> Option<Self> {
        let pg = store.pg_for_group(group_id)?;
        let pg_id = pg.info.read().id;
        let shard_seqs: Vec<u64> = pg.shards.read().keys().copied().collect();

        let mut total_blobs = 0u64;
        let mut total_bytes = 0u64;
        let blk_size = u64::from(pg.repl_dev.blk_size());
        for &seq in &shard_seqs {
            let shard_id = ShardId::from_parts(pg_id, seq);
            for (_, pbas) in
                store.query_blobs_in_shard(&pg.index_table, shard_id, 0, usize::MAX)
            {
                total_blobs += 1;
                total_bytes += u64::from(pbas.total_blks()) * blk_size;
            }
        }

        Some(Self {
            store,
            pg_id,
            group_id,
            upto_lsn,
            shard_seqs,
            shard_idx: 0,
            next_blob: 0,
            emitted_pg_meta: false,
            entered_shard: false,
            batch_num: 0,
            total_blobs,
            total_bytes,
        })
    }

    /// The group this iterator streams
    #[must_use]
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Log index the stream is consistent with
    #[must_use]
    pub fn upto_lsn(&self) -> u64 {
        self.upto_lsn
    }

    /// Batches emitted so far
    #[must_use]
    pub fn cur_batch_num(&self) -> u64 {
        self.batch_num
    }

    /// Whether every shard has been fully emitted
    #[must_use]
    pub fn end_of_scan(&self) -> bool {
        self.emitted_pg_meta && self.shard_idx >= self.shard_seqs.len()
    }

    /// Build the stream preamble
    #[must_use]
    pub fn get_pg_metadata(&self) -> ResyncPgMetaData {
        let pg = self
            .store
            .pg_for_group(self.group_id)
            .expect("PG disappeared under its iterator");
        let info = pg.info.read();
        ResyncPgMetaData {
            pg_id: info.id,
            replica_set_uuid: info.replica_set_uuid,
            pg_size: info.size,
            chunk_size: info.chunk_size,
            blob_seq_num: pg.durable.blob_sequence_num.load(Ordering::Relaxed),
            shard_seq_num: pg.shard_seq_num.load(Ordering::Relaxed),
            members: info.members.iter().cloned().collect(),
            shard_ids: self
                .shard_seqs
                .iter()
                .map(|&seq| ShardId::from_parts(info.id, seq).as_u64())
                .collect(),
            total_blobs_to_transfer: self.total_blobs,
            total_bytes_to_transfer: self.total_bytes,
        }
    }

    /// Produce the next batch, bounded by the smaller of `max_num_blobs`
    /// and `max_bytes`; `None` once the scan is complete
    pub async fn next_batch(
        &mut self,
        max_num_blobs: u64,
        max_bytes: u64,
    ) -> Result<Option<SnapshotBatch>, BlobError> {
        if !self.emitted_pg_meta {
            self.emitted_pg_meta = true;
            self.batch_num += 1;
            return Ok(Some(SnapshotBatch::PgMeta(self.get_pg_metadata())));
        }
        let Some(&seq) = self.shard_seqs.get(self.shard_idx) else {
            return Ok(None);
        };
        let shard_id = ShardId::from_parts(self.pg_id, seq);

        if !self.entered_shard {
            let info = self
                .store
                .get_shard(shard_id)
                .map_err(|_| BlobError::UnknownBlob)?;
            self.entered_shard = true;
            self.next_blob = 0;
            self.batch_num += 1;
            return Ok(Some(SnapshotBatch::ShardMeta(info)));
        }

        let pg = self
            .store
            .pg_for_group(self.group_id)
            .ok_or(BlobError::InvalidArg)?;
        let blk_size = u64::from(pg.repl_dev.blk_size());
        let routes = self.store.query_blobs_in_shard(
            &pg.index_table,
            shard_id,
            self.next_blob,
            max_num_blobs.min(usize::MAX as u64) as usize,
        );

        let mut entries = Vec::new();
        let mut bytes = 0u64;
        for (key, pbas) in routes {
            let blob = self.store.get_blob(shard_id, key.blob, 0, 0).await?;
            bytes += u64::from(pbas.total_blks()) * blk_size;
            self.next_blob = key.blob + 1;
            entries.push(BlobInfoData {
                shard_id,
                blob_id: key.blob,
                pbas,
                blob,
            });
            if bytes >= max_bytes {
                break;
            }
        }

        let end_of_shard = self
            .store
            .query_blobs_in_shard(&pg.index_table, shard_id, self.next_blob, 1)
            .is_empty();
        if end_of_shard {
            self.shard_idx += 1;
            self.entered_shard = false;
        }
        self.batch_num += 1;
        Ok(Some(SnapshotBatch::Blobs {
            entries,
            end_of_shard,
        }))
    }
}

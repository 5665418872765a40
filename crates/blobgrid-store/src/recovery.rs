//! Crash recovery
//!
//! Startup order is fixed:
//! 1. the index service hands back every index table by uuid,
//! 2. the PG superblock scan rebuilds each PG (its index table must already
//!    be known, anything else is corruption),
//! 3. the shard superblock scan attaches shards and pins their chunks,
//! 4. the per-device chunk free lists are finalized,
//! 5. the replication service replays the log tail; commit handlers are
//!    idempotent against state the scans already restored.

use crate::index::BlobIndexTable;
use crate::pg::PgEntry;
use crate::records::{PgSuperblk, ShardSuperblk, PG_META_NAME, SHARD_META_NAME};
use crate::shard::ShardEntry;
use crate::store::{BlobStore, PgIndexSlot};
use blobgrid_repl::IndexTableSb;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

impl BlobStore {
    /// Rebuild all in-memory state from persisted superblocks and the log
    pub(crate) fn on_replica_restart(&self) {
        let mut tables = 0usize;
        for (sb, table) in self.index_service.recovered_tables() {
            let Ok(table) = table.downcast::<BlobIndexTable>() else {
                panic!("index table {} has a foreign type", sb.uuid);
            };
            self.on_index_table_found(sb, table);
            tables += 1;
        }

        let mut pgs = 0usize;
        for buf in self.meta_service.scan(PG_META_NAME) {
            match PgSuperblk::from_bytes(&buf) {
                Ok(sb) => {
                    self.on_pg_meta_blk_found(sb);
                    pgs += 1;
                }
                Err(e) => error!(?e, "dropping undecodable PG superblock"),
            }
        }

        let mut shards = 0usize;
        for buf in self.meta_service.scan(SHARD_META_NAME) {
            match ShardSuperblk::from_bytes(&buf) {
                Ok(sb) => {
                    self.on_shard_meta_blk_found(sb);
                    shards += 1;
                }
                Err(e) => error!(?e, "dropping undecodable shard superblock"),
            }
        }

        self.chunk_selector.recover_per_dev_chunk_heap();
        self.repl_service.replay_log();

        // Reconciliation invariant: a recovered table nobody claimed is
        // stale; a PG without a table was already a fatal assert above.
        self.index_tables
            .lock()
            .retain(|uuid, slot| {
                if slot.pg_id.is_none() {
                    warn!(%uuid, "dropping index table with no owning PG");
                    false
                } else {
                    true
                }
            });

        info!(tables, pgs, shards, "replica recovery complete");
    }

    /// Index table discovered by the index service (before any PG scan)
    pub(crate) fn on_index_table_found(&self, sb: IndexTableSb, table: Arc<BlobIndexTable>) {
        info!(uuid = %sb.uuid, "recovered index table");
        self.index_tables.lock().insert(
            sb.uuid,
            PgIndexSlot {
                pg_id: None,
                table,
            },
        );
    }

    /// PG superblock discovered by the meta-blk scan
    pub(crate) fn on_pg_meta_blk_found(&self, sb: PgSuperblk) {
        let pg_id = sb.id;
        let repl_dev = match self.repl_service.get_repl_dev(sb.replica_set_uuid) {
            Ok(dev) => dev,
            Err(_) => {
                // Without the repl dev every operation on this PG would
                // fail; surface loudly and skip the PG.
                error!(pg_id, group = %sb.replica_set_uuid, "no repl dev for recovered PG");
                return;
            }
        };

        let recovered = self
            .chunk_selector
            .recover_pg_chunks(pg_id, sb.chunks.clone());
        assert!(recovered, "failed to restore chunks of PG {pg_id}");

        let table = {
            let mut tables = self.index_tables.lock();
            let slot = tables
                .get_mut(&sb.index_table_uuid)
                .unwrap_or_else(|| panic!("index table must be recovered before PG {pg_id}"));
            slot.pg_id = Some(pg_id);
            slot.table.clone()
        };

        let chunk_size = self.chunk_selector.get_chunk_size();
        let entry = Arc::new(PgEntry::from_superblk(&sb, chunk_size, repl_dev, table));
        self.add_pg_to_map(entry);
        info!(pg_id, "recovered PG");
    }

    /// Shard superblock discovered by the meta-blk scan
    pub(crate) fn on_shard_meta_blk_found(&self, sb: ShardSuperblk) {
        let shard_id = sb.info.id;
        let pg_id = sb.info.placement_group;
        let Some(pg) = self.get_pg(pg_id) else {
            error!(%shard_id, pg_id, "recovered shard without its PG");
            return;
        };
        self.chunk_selector.try_mark_busy(pg_id, sb.v_chunk_id);
        let entry = Arc::new(ShardEntry::new(sb.info, sb.p_chunk_id, sb.v_chunk_id));
        self.add_new_shard_to_map(&pg, entry);
    }

    /// Highest blob sequence number the PG has handed out (recovery aid)
    #[must_use]
    pub fn pg_blob_sequence_num(&self, pg_id: blobgrid_common::PgId) -> Option<u64> {
        self.get_pg(pg_id)
            .map(|pg| pg.durable.blob_sequence_num.load(Ordering::Relaxed))
    }
}

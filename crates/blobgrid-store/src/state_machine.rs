//! Replication state machine
//!
//! The single dispatch point for replicated log callbacks. It reads the
//! message type off the sealed header and routes to the PG, shard, or blob
//! handlers. Pre-commit may veto an entry; rollback undoes exactly the
//! side effects pre-commit took (chunk reservations). The store is held
//! through a weak reference and looked up per callback, never cached.

use crate::blob::{to_blob_error, BlobReplCtx};
use crate::pg::{to_pg_error, PgReplCtx};
use crate::shard::{to_shard_error, ShardReplCtx};
use crate::store::BlobStore;
use crate::wire::{ReplicationMessageHeader, ReplicationMessageType};
use blobgrid_common::GroupId;
use blobgrid_repl::{
    BlkAllocHints, MultiBlkId, ReplCtx, ReplListener, ReplServiceError, ReplicaMember,
};
use std::sync::{Arc, Weak};
use tracing::warn;

/// Dispatches committed log entries into the store
pub struct ReplStateMachine {
    store: Weak<BlobStore>,
}

impl ReplStateMachine {
    /// Create a state machine bound to a store
    #[must_use]
    pub fn new(store: Weak<BlobStore>) -> Self {
        Self { store }
    }

    fn store(&self) -> Option<Arc<BlobStore>> {
        let store = self.store.upgrade();
        if store.is_none() {
            warn!("replication callback after store shutdown");
        }
        store
    }

    /// Fail the proposer's future with the translated domain error
    fn fail_ctx(msg_type: ReplicationMessageType, err: ReplServiceError, ctx: Option<&ReplCtx>) {
        let Some(ctx) = ctx else { return };
        match msg_type {
            ReplicationMessageType::CreatePg => {
                if let Some(c) = ctx.downcast_ref::<PgReplCtx>() {
                    c.complete(Err(to_pg_error(err)));
                }
            }
            ReplicationMessageType::CreateShard | ReplicationMessageType::SealShard => {
                if let Some(c) = ctx.downcast_ref::<ShardReplCtx>() {
                    c.complete(Err(to_shard_error(err)));
                }
            }
            ReplicationMessageType::PutBlob | ReplicationMessageType::DelBlob => {
                if let Some(c) = ctx.downcast_ref::<BlobReplCtx>() {
                    c.complete(Err(to_blob_error(err)));
                }
            }
        }
    }
}

impl ReplListener for ReplStateMachine {
    fn on_commit(
        &self,
        lsn: u64,
        header: &[u8],
        key: &[u8],
        blkids: &MultiBlkId,
        ctx: Option<&ReplCtx>,
    ) {
        let Some(store) = self.store() else { return };
        let Ok(msg_header) = ReplicationMessageHeader::from_bytes(header) else {
            warn!(lsn, "dropping commit with unparseable header");
            return;
        };
        match msg_header.msg_type {
            ReplicationMessageType::CreatePg => store.on_create_pg_commit(lsn, header, ctx),
            ReplicationMessageType::CreateShard | ReplicationMessageType::SealShard => {
                store.on_shard_message_commit(lsn, header, ctx);
            }
            ReplicationMessageType::PutBlob => {
                store.on_blob_put_commit(lsn, header, key, blkids, ctx);
            }
            ReplicationMessageType::DelBlob => store.on_blob_del_commit(lsn, header, key, ctx),
        }
    }

    fn on_pre_commit(&self, lsn: u64, header: &[u8], _key: &[u8], _ctx: Option<&ReplCtx>) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        let Ok(msg_header) = ReplicationMessageHeader::from_bytes(header) else {
            warn!(lsn, "vetoing entry with unparseable header");
            return false;
        };
        match msg_header.msg_type {
            ReplicationMessageType::CreateShard => store.on_shard_message_pre_commit(lsn, header),
            _ => true,
        }
    }

    fn on_rollback(&self, lsn: u64, header: &[u8], _key: &[u8], ctx: Option<&ReplCtx>) {
        let Some(store) = self.store() else { return };
        let Ok(msg_header) = ReplicationMessageHeader::from_bytes(header) else {
            warn!(lsn, "rollback of entry with unparseable header");
            return;
        };
        match msg_header.msg_type {
            ReplicationMessageType::CreateShard | ReplicationMessageType::SealShard => {
                store.on_shard_message_rollback(lsn, header, ctx);
            }
            other => {
                warn!(lsn, ?other, "entry rolled back");
                Self::fail_ctx(other, ReplServiceError::RetryRequest, ctx);
            }
        }
    }

    fn get_blk_alloc_hints(
        &self,
        header: &[u8],
        data_size: u64,
    ) -> Result<BlkAllocHints, ReplServiceError> {
        let Some(store) = self.store() else {
            return Err(ReplServiceError::Cancelled);
        };
        let msg_header = ReplicationMessageHeader::from_bytes(header)
            .map_err(|_| ReplServiceError::BadRequest)?;
        match msg_header.msg_type {
            ReplicationMessageType::PutBlob => {
                store.blob_put_get_blk_alloc_hints(header, data_size)
            }
            _ => Ok(BlkAllocHints::default()),
        }
    }

    fn on_error(&self, err: ReplServiceError, header: &[u8], _key: &[u8], ctx: Option<&ReplCtx>) {
        if let Ok(msg_header) = ReplicationMessageHeader::from_bytes(header) {
            warn!(?err, msg_type = ?msg_header.msg_type, "replicated request failed");
            // A failed CREATE_SHARD proposal must hand its chunk back.
            if msg_header.msg_type == ReplicationMessageType::CreateShard {
                if let Some(store) = self.store() {
                    store.release_chunk_based_on_create_shard_message(header);
                }
            }
            Self::fail_ctx(msg_header.msg_type, err, ctx);
        }
    }

    fn on_replace_member(&self, group_id: GroupId, out: &ReplicaMember, inn: &ReplicaMember) {
        if let Some(store) = self.store() {
            store.on_pg_replace_member(group_id, out, inn);
        }
    }
}

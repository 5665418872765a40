//! Public manager surfaces
//!
//! The store exposes three contracts: placement groups, shards, and blobs.
//! `BlobStore` implements all of them; consumers that only need one facet
//! can hold the corresponding trait object.

use crate::store::BlobStore;
use async_trait::async_trait;
use blobgrid_common::{
    Blob, BlobError, BlobId, PeerId, PgError, PgId, PgInfo, PgMember, PgStats, ShardError,
    ShardId, ShardInfo,
};

/// Placement-group operations
#[async_trait]
pub trait PgManager: Send + Sync {
    /// Create a PG across `peers`; idempotent by id
    async fn create_pg(&self, pg_info: PgInfo, peers: &[PeerId]) -> Result<(), PgError>;

    /// Replace one replica-set member
    async fn replace_member(
        &self,
        pg_id: PgId,
        member_out: PeerId,
        member_in: PgMember,
        commit_quorum: u32,
    ) -> Result<(), PgError>;

    /// Ids of all PGs hosted here
    fn list_pg_ids(&self) -> Vec<PgId>;

    /// Statistics of one PG
    fn get_pg_stats(&self, pg_id: PgId) -> Option<PgStats>;
}

/// Shard operations
#[async_trait]
pub trait ShardManager: Send + Sync {
    /// Create an open shard on the PG
    async fn create_shard(&self, pg_id: PgId, size_bytes: u64) -> Result<ShardInfo, ShardError>;

    /// Shard metadata lookup
    fn get_shard(&self, shard_id: ShardId) -> Result<ShardInfo, ShardError>;

    /// All shards of the PG in ascending sequence order
    fn list_shards(&self, pg_id: PgId) -> Result<Vec<ShardInfo>, ShardError>;

    /// Seal a shard against further writes
    async fn seal_shard(&self, shard_id: ShardId) -> Result<ShardInfo, ShardError>;
}

/// Blob operations
#[async_trait]
pub trait BlobManager: Send + Sync {
    /// Write a blob into an open shard
    async fn put_blob(&self, shard_id: ShardId, blob: Blob) -> Result<BlobId, BlobError>;

    /// Read a blob slice; `len == 0` reads to the end
    async fn get_blob(
        &self,
        shard_id: ShardId,
        blob_id: BlobId,
        off: u64,
        len: u64,
    ) -> Result<Blob, BlobError>;

    /// Tombstone a blob
    async fn del_blob(&self, shard_id: ShardId, blob_id: BlobId) -> Result<(), BlobError>;
}

#[async_trait]
impl PgManager for BlobStore {
    async fn create_pg(&self, pg_info: PgInfo, peers: &[PeerId]) -> Result<(), PgError> {
        BlobStore::create_pg(self, pg_info, peers).await
    }

    async fn replace_member(
        &self,
        pg_id: PgId,
        member_out: PeerId,
        member_in: PgMember,
        commit_quorum: u32,
    ) -> Result<(), PgError> {
        BlobStore::replace_member(self, pg_id, member_out, member_in, commit_quorum).await
    }

    fn list_pg_ids(&self) -> Vec<PgId> {
        BlobStore::list_pg_ids(self)
    }

    fn get_pg_stats(&self, pg_id: PgId) -> Option<PgStats> {
        BlobStore::get_pg_stats(self, pg_id)
    }
}

#[async_trait]
impl ShardManager for BlobStore {
    async fn create_shard(&self, pg_id: PgId, size_bytes: u64) -> Result<ShardInfo, ShardError> {
        BlobStore::create_shard(self, pg_id, size_bytes).await
    }

    fn get_shard(&self, shard_id: ShardId) -> Result<ShardInfo, ShardError> {
        BlobStore::get_shard(self, shard_id)
    }

    fn list_shards(&self, pg_id: PgId) -> Result<Vec<ShardInfo>, ShardError> {
        BlobStore::list_shards(self, pg_id)
    }

    async fn seal_shard(&self, shard_id: ShardId) -> Result<ShardInfo, ShardError> {
        BlobStore::seal_shard(self, shard_id).await
    }
}

#[async_trait]
impl BlobManager for BlobStore {
    async fn put_blob(&self, shard_id: ShardId, blob: Blob) -> Result<BlobId, BlobError> {
        BlobStore::put_blob(self, shard_id, blob).await
    }

    async fn get_blob(
        &self,
        shard_id: ShardId,
        blob_id: BlobId,
        off: u64,
        len: u64,
    ) -> Result<Blob, BlobError> {
        BlobStore::get_blob(self, shard_id, blob_id, off, len).await
    }

    async fn del_blob(&self, shard_id: ShardId, blob_id: BlobId) -> Result<(), BlobError> {
        BlobStore::del_blob(self, shard_id, blob_id).await
    }
}

//! Replication service and replicated-device interfaces
//!
//! These traits model the replicated block device consumed by the store:
//! group lifecycle, leadership, log writes with block allocation, and the
//! listener through which committed entries are delivered back. Commit
//! delivery is synchronous from the replication layer's commit path and must
//! not block.

use crate::blk::{BlkAllocHints, MultiBlkId};
use async_trait::async_trait;
use blobgrid_common::{GroupId, PeerId};
use bytes::Bytes;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Closed error set of the replication service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ReplServiceError {
    #[error("bad request")]
    BadRequest,
    #[error("request cancelled")]
    Cancelled,
    #[error("membership change in progress")]
    ConfigChanging,
    #[error("server already exists")]
    ServerAlreadyExists,
    #[error("server is joining")]
    ServerIsJoining,
    #[error("server is leaving")]
    ServerIsLeaving,
    #[error("result does not exist yet")]
    ResultNotExistYet,
    #[error("term mismatch")]
    TermMismatch,
    #[error("not implemented")]
    NotImplemented,
    #[error("not the leader")]
    NotLeader,
    #[error("cannot remove the leader")]
    CannotRemoveLeader,
    #[error("timed out")]
    Timeout,
    #[error("server not found")]
    ServerNotFound,
    #[error("no space left")]
    NoSpaceLeft,
    #[error("drive write error")]
    DriveWriteError,
    #[error("retry the request")]
    RetryRequest,
    #[error("replication failed")]
    Failed,
}

/// A replica-set member as the replication service sees it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaMember {
    /// Peer identity
    pub id: PeerId,
    /// Member name
    pub name: String,
    /// Election priority
    pub priority: i32,
}

impl ReplicaMember {
    /// Create a member record
    #[must_use]
    pub fn new(id: PeerId, name: impl Into<String>, priority: i32) -> Self {
        Self {
            id,
            name: name.into(),
            priority,
        }
    }
}

/// Replication progress of one member
#[derive(Clone, Debug)]
pub struct ReplicaStatus {
    /// Peer identity
    pub id: PeerId,
    /// Last committed log index
    pub replication_idx: u64,
    /// Microseconds since the last successful response
    pub last_succ_resp_us: u64,
}

/// Opaque per-request context threaded from a proposer through to its commit
///
/// Present only on the proposing replica; commit handlers downcast it to the
/// operation-specific context to resolve the caller's future.
pub type ReplCtx = Arc<dyn Any + Send + Sync>;

/// Scatter-gather list of payload buffers
pub type SgList = Vec<Bytes>;

/// Callbacks delivered by the replication layer
///
/// `on_commit` runs on every replica once an entry reaches quorum;
/// `on_pre_commit` may veto an entry before it commits locally, and
/// `on_rollback` must undo exactly the side effects `on_pre_commit` took.
pub trait ReplListener: Send + Sync {
    /// An entry committed locally
    fn on_commit(
        &self,
        lsn: u64,
        header: &[u8],
        key: &[u8],
        blkids: &MultiBlkId,
        ctx: Option<&ReplCtx>,
    );

    /// An entry is about to commit; returning false vetoes it
    fn on_pre_commit(&self, lsn: u64, header: &[u8], key: &[u8], ctx: Option<&ReplCtx>) -> bool;

    /// An entry was rolled back after pre-commit
    fn on_rollback(&self, lsn: u64, header: &[u8], key: &[u8], ctx: Option<&ReplCtx>);

    /// Resolve allocation hints for a data-carrying entry
    fn get_blk_alloc_hints(
        &self,
        header: &[u8],
        data_size: u64,
    ) -> Result<BlkAllocHints, ReplServiceError>;

    /// A proposed entry failed before committing (allocation, replication)
    fn on_error(&self, err: ReplServiceError, header: &[u8], key: &[u8], ctx: Option<&ReplCtx>);

    /// A membership change committed on the group
    fn on_replace_member(&self, group_id: GroupId, out: &ReplicaMember, inn: &ReplicaMember);
}

/// One replicated device (log + block allocator) backing a single group
#[async_trait]
pub trait ReplDev: Send + Sync {
    /// Replication group id
    fn group_id(&self) -> GroupId;

    /// Whether this replica currently leads the group
    fn is_leader(&self) -> bool;

    /// Current leader peer
    fn leader_id(&self) -> PeerId;

    /// Device block size in bytes
    fn blk_size(&self) -> u32;

    /// Allocate blocks for `value`, write them, and replicate the entry.
    ///
    /// Completion is delivered through the listener: `on_commit` with `ctx`
    /// on success, `on_rollback` with `ctx` otherwise.
    fn async_alloc_write(&self, header: Bytes, key: Bytes, value: SgList, ctx: ReplCtx);

    /// Read `size` bytes starting at `blkid`
    async fn async_read(&self, blkid: &MultiBlkId, size: usize) -> Result<Bytes, ReplServiceError>;

    /// Per-member replication progress (meaningful on the leader)
    fn get_replication_status(&self) -> Vec<ReplicaStatus>;
}

/// The replication service owning all groups on this node
#[async_trait]
pub trait ReplicationService: Send + Sync {
    /// Register the listener that receives commit callbacks for all groups
    fn register_listener(&self, listener: Arc<dyn ReplListener>);

    /// Re-deliver the committed log tail to the registered listener.
    ///
    /// Invoked as the last step of recovery; commit handlers must be
    /// idempotent against entries whose effects were already recovered.
    fn replay_log(&self);

    /// Create a replication group across `members` and open its device
    async fn create_repl_dev(
        &self,
        group_id: GroupId,
        members: &[PeerId],
    ) -> Result<Arc<dyn ReplDev>, ReplServiceError>;

    /// Look up an already-open device
    fn get_repl_dev(&self, group_id: GroupId) -> Result<Arc<dyn ReplDev>, ReplServiceError>;

    /// Replace `member_out` with `member_in` in the group
    async fn replace_member(
        &self,
        group_id: GroupId,
        member_out: ReplicaMember,
        member_in: ReplicaMember,
        commit_quorum: u32,
    ) -> Result<(), ReplServiceError>;
}

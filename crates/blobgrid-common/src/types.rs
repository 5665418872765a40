//! Core type definitions for BlobGrid
//!
//! This module defines the fundamental identifiers and metadata structures
//! shared by the placement-group, shard, and blob layers.

use bytes::Bytes;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Placement group identifier
pub type PgId = u16;

/// Blob identifier, monotonic per PG (assigned by the leader)
pub type BlobId = u64;

/// Peer (storage node) identifier
pub type PeerId = Uuid;

/// Replication group identifier
pub type GroupId = Uuid;

/// Physical or virtual chunk number
pub type ChunkNum = u16;

/// Number of bits of a shard id holding the per-PG sequence number
const SHARD_SEQ_BITS: u32 = 48;

/// Mask covering the sequence-number bits of a shard id
const SHARD_SEQ_MASK: u64 = (1u64 << SHARD_SEQ_BITS) - 1;

/// Shard identifier
///
/// The upper 16 bits encode the owning `PgId`, the lower 48 bits a per-PG
/// monotonically increasing sequence number. Both halves are recoverable
/// from the id alone.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0:#x}")]
pub struct ShardId(u64);

impl ShardId {
    /// Compose a shard id from its PG and sequence number
    #[must_use]
    pub const fn from_parts(pg_id: PgId, seq_num: u64) -> Self {
        Self(((pg_id as u64) << SHARD_SEQ_BITS) | (seq_num & SHARD_SEQ_MASK))
    }

    /// The PG this shard belongs to
    #[must_use]
    pub const fn pg_id(&self) -> PgId {
        (self.0 >> SHARD_SEQ_BITS) as PgId
    }

    /// The per-PG sequence number of this shard
    #[must_use]
    pub const fn seq_num(&self) -> u64 {
        self.0 & SHARD_SEQ_MASK
    }

    /// Raw 64-bit value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId(pg={}, seq={})", self.pg_id(), self.seq_num())
    }
}

/// A member of a placement group's replica set
///
/// Ordering and equality consider the peer id only; name and priority are
/// attributes of the membership, not part of the identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PgMember {
    /// Peer identity
    pub id: PeerId,
    /// Human-readable member name, at most `MAX_NAME_LEN` bytes
    pub name: String,
    /// Election priority
    pub priority: i32,
}

impl PgMember {
    /// Maximum stored length of a member name in bytes
    pub const MAX_NAME_LEN: usize = 32;

    /// Create a member, truncating the name to `MAX_NAME_LEN` bytes
    #[must_use]
    pub fn new(id: PeerId, name: impl Into<String>, priority: i32) -> Self {
        let mut name = name.into();
        name.truncate(Self::MAX_NAME_LEN);
        Self { id, name, priority }
    }
}

impl PartialEq for PgMember {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PgMember {}

impl PartialOrd for PgMember {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PgMember {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// Creation-time description of a placement group
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PgInfo {
    /// PG identifier
    pub id: PgId,
    /// Provisioned size in bytes
    pub size: u64,
    /// Chunk size of the hosting device pool; replicas must agree
    pub chunk_size: u64,
    /// Replication group uuid; equals the owning repl-dev group id
    pub replica_set_uuid: GroupId,
    /// Replica set, ordered by peer id
    pub members: BTreeSet<PgMember>,
}

impl PgInfo {
    /// Create a PG description with no members yet
    #[must_use]
    pub fn new(id: PgId, size: u64) -> Self {
        Self {
            id,
            size,
            chunk_size: 0,
            replica_set_uuid: Uuid::nil(),
            members: BTreeSet::new(),
        }
    }
}

/// Shard lifecycle state
///
/// ```text
/// Open ──seal──► Sealed ──delete──► Deleted
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ShardState {
    /// Accepting blob writes
    Open = 0,
    /// Closed for writes, readable
    Sealed = 1,
    /// Logically removed; never physically reclaimed here
    Deleted = 2,
}

impl ShardState {
    /// Decode from the on-disk byte
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Open),
            1 => Some(Self::Sealed),
            2 => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Whether blob writes may target this shard
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Shard metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Shard identifier
    pub id: ShardId,
    /// Owning PG
    pub placement_group: PgId,
    /// Lifecycle state
    pub state: ShardState,
    /// Creation timestamp (Unix epoch seconds)
    pub created_time: u64,
    /// Last modification timestamp (Unix epoch seconds)
    pub last_modified_time: u64,
    /// Provisioned capacity in bytes
    pub total_capacity_bytes: u64,
    /// Bytes consumed by committed blobs (rounded to block size)
    pub used_capacity_bytes: u64,
    /// Bytes referenced by tombstoned blobs
    pub deleted_capacity_bytes: u64,
}

/// A blob payload as handed in by / returned to the client
#[derive(Clone, Debug, Default)]
pub struct Blob {
    /// Blob body
    pub body: Bytes,
    /// Optional user key, hashed together with the body
    pub user_key: Bytes,
    /// Offset of this blob within the client's logical object
    pub object_offset: u64,
}

impl Blob {
    /// Create a blob from body bytes
    #[must_use]
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            user_key: Bytes::new(),
            object_offset: 0,
        }
    }

    /// Attach a user key
    #[must_use]
    pub fn with_user_key(mut self, user_key: Bytes) -> Self {
        self.user_key = user_key;
        self
    }
}

/// Replication progress of one PG member, as reported in stats
#[derive(Clone, Debug)]
pub struct PgMemberStats {
    /// Peer identity
    pub id: PeerId,
    /// Member name
    pub name: String,
    /// Last log index this member has committed
    pub last_commit_lsn: u64,
    /// Microseconds since the last successful response from this member
    pub last_succ_resp_us: u64,
}

/// Point-in-time statistics of one placement group
#[derive(Clone, Debug)]
pub struct PgStats {
    /// PG identifier
    pub id: PgId,
    /// Replication group uuid
    pub replica_set_uuid: GroupId,
    /// Current leader of the replica set
    pub leader_id: PeerId,
    /// Number of replica-set members
    pub num_members: u32,
    /// Total shards ever created on this PG
    pub total_shards: u32,
    /// Shards currently open for writes
    pub open_shards: u32,
    /// Live (non-tombstoned) blobs
    pub num_active_objects: u64,
    /// Tombstoned blobs awaiting reclamation
    pub num_tombstone_objects: u64,
    /// Chunks still unassigned to any shard
    pub avail_open_shards: u32,
    /// Free bytes across the PG's chunks
    pub avail_bytes: u64,
    /// Bytes occupied by committed blob payloads
    pub used_bytes: u64,
    /// Per-member replication progress
    pub members: Vec<PgMemberStats>,
}

impl Default for PgStats {
    fn default() -> Self {
        Self {
            id: 0,
            replica_set_uuid: Uuid::nil(),
            leader_id: Uuid::nil(),
            num_members: 0,
            total_shards: 0,
            open_shards: 0,
            num_active_objects: 0,
            num_tombstone_objects: 0,
            avail_open_shards: 0,
            avail_bytes: 0,
            used_bytes: 0,
            members: Vec::new(),
        }
    }
}

/// Store-wide statistics
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreStats {
    /// Total capacity across all registered chunks
    pub total_capacity_bytes: u64,
    /// Bytes occupied by committed blob payloads
    pub used_capacity_bytes: u64,
    /// Open shards across all PGs
    pub num_open_shards: u32,
    /// PGs hosted on this node
    pub num_pgs: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_id_roundtrip() {
        let id = ShardId::from_parts(42, 7);
        assert_eq!(id.pg_id(), 42);
        assert_eq!(id.seq_num(), 7);

        let max_seq = (1u64 << 48) - 1;
        let id = ShardId::from_parts(u16::MAX, max_seq);
        assert_eq!(id.pg_id(), u16::MAX);
        assert_eq!(id.seq_num(), max_seq);
    }

    #[test]
    fn pg_member_identity_is_peer_id() {
        let id = Uuid::new_v4();
        let a = PgMember::new(id, "alpha", 1);
        let b = PgMember::new(id, "beta", -3);
        assert_eq!(a, b);

        let mut set = BTreeSet::new();
        set.insert(a);
        assert!(!set.insert(b));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn pg_member_name_truncated() {
        let m = PgMember::new(Uuid::new_v4(), "x".repeat(100), 0);
        assert_eq!(m.name.len(), PgMember::MAX_NAME_LEN);
    }

    #[test]
    fn shard_state_from_u8() {
        assert_eq!(ShardState::from_u8(0), Some(ShardState::Open));
        assert_eq!(ShardState::from_u8(1), Some(ShardState::Sealed));
        assert_eq!(ShardState::from_u8(2), Some(ShardState::Deleted));
        assert_eq!(ShardState::from_u8(3), None);
        assert!(ShardState::Open.is_open());
        assert!(!ShardState::Sealed.is_open());
    }
}

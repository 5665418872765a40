//! BlobGrid replication runtime interfaces
//!
//! The store core consumes a replicated storage runtime: replicated log
//! commits, chunked block allocation, superblock persistence, and persistent
//! indexed tables. This crate defines those interfaces and ships a
//! deterministic in-memory runtime (`mem`) used by the test suites.

pub mod blk;
pub mod index;
pub mod mem;
pub mod meta;
pub mod service;

pub use blk::{BlkAllocHints, BlkExtent, MultiBlkId};
pub use index::{IndexService, IndexTable, IndexTableSb, MemIndexService};
pub use mem::{MemReplDev, MemReplicationRuntime};
pub use meta::{MemMetaBlkService, MetaBlkService};
pub use service::{
    ReplCtx, ReplDev, ReplListener, ReplServiceError, ReplicaMember, ReplicaStatus,
    ReplicationService, SgList,
};

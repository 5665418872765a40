//! BlobGrid Store - replicated PG/shard/blob engine
//!
//! This crate implements the control and data path of the blob store:
//! - Chunk selection and per-PG chunk ownership
//! - On-disk record codecs (PG superblock, shard superblock, blob header)
//! - PG lifecycle across replicas (create, membership replacement)
//! - Shard lifecycle through the replicated log (create, seal)
//! - The blob write/read/delete path with per-PG indexing
//! - Crash recovery and the PG resync snapshot iterator
//!
//! The replicated block device, superblock persistence, and index-table
//! engine are consumed through the `blobgrid-repl` interfaces.

pub mod api;
pub mod blob;
pub mod checkpoint;
pub mod chunk_selector;
pub mod index;
pub mod pg;
pub mod records;
pub mod recovery;
pub mod shard;
pub mod snapshot;
pub mod state_machine;
pub mod store;
pub mod wire;

pub use api::{BlobManager, PgManager, ShardManager};
pub use chunk_selector::ChunkSelector;
pub use index::{BlobRouteKey, BlobRouteValue};
pub use records::{BlobHeader, DataHeader, PgSuperblk, ShardSuperblk, DATA_BLOCK_SIZE, IO_ALIGN};
pub use snapshot::{PgBlobIterator, ResyncPgMetaData, SnapshotBatch};
pub use store::BlobStore;
pub use wire::{ReplicationMessageHeader, ReplicationMessageType};

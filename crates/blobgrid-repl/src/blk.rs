//! Block identifiers handed out by the replication layer
//!
//! A committed write is addressed by a `MultiBlkId`: the chunk it landed in
//! plus one or more contiguous block extents. The all-zero id doubles as the
//! tombstone sentinel in the blob index.

use blobgrid_common::ChunkNum;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A contiguous run of blocks within a chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlkExtent {
    /// First block number
    pub blk_num: u64,
    /// Number of blocks
    pub nblks: u16,
}

impl BlkExtent {
    /// Create an extent
    #[must_use]
    pub const fn new(blk_num: u64, nblks: u16) -> Self {
        Self { blk_num, nblks }
    }
}

/// Location of one committed payload: a chunk plus contiguous extents
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MultiBlkId {
    /// Chunk the blocks live in
    pub chunk: ChunkNum,
    /// Ordered block extents
    pub extents: Vec<BlkExtent>,
}

impl MultiBlkId {
    /// The tombstone sentinel `{0, 0, 0}`
    #[must_use]
    pub fn tombstone() -> Self {
        Self {
            chunk: 0,
            extents: vec![BlkExtent::new(0, 0)],
        }
    }

    /// Single-extent id
    #[must_use]
    pub fn single(chunk: ChunkNum, blk_num: u64, nblks: u16) -> Self {
        Self {
            chunk,
            extents: vec![BlkExtent::new(blk_num, nblks)],
        }
    }

    /// Whether this id is the tombstone sentinel
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.chunk == 0 && self.extents.iter().all(|e| e.blk_num == 0 && e.nblks == 0)
    }

    /// Total number of blocks across all extents
    #[must_use]
    pub fn total_blks(&self) -> u32 {
        self.extents.iter().map(|e| u32::from(e.nblks)).sum()
    }

    /// Serialize for storage as an index value (little-endian)
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.extents.len() * 10);
        buf.put_u16_le(self.chunk);
        buf.put_u16_le(self.extents.len() as u16);
        for e in &self.extents {
            buf.put_u64_le(e.blk_num);
            buf.put_u16_le(e.nblks);
        }
        buf.freeze()
    }

    /// Parse from index-value bytes
    #[must_use]
    pub fn from_bytes(mut data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let chunk = data.get_u16_le();
        let n = data.get_u16_le() as usize;
        if data.len() < n * 10 {
            return None;
        }
        let mut extents = Vec::with_capacity(n);
        for _ in 0..n {
            let blk_num = data.get_u64_le();
            let nblks = data.get_u16_le();
            extents.push(BlkExtent::new(blk_num, nblks));
        }
        Some(Self { chunk, extents })
    }
}

/// Hints the state machine hands to the block allocator for a replicated write
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlkAllocHints {
    /// Allocate inside this chunk (the shard's pinned chunk)
    pub preferred_chunk: Option<ChunkNum>,
}

impl BlkAllocHints {
    /// Pin allocation to one chunk
    #[must_use]
    pub fn for_chunk(chunk: ChunkNum) -> Self {
        Self {
            preferred_chunk: Some(chunk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_sentinel() {
        let t = MultiBlkId::tombstone();
        assert!(t.is_tombstone());
        assert_eq!(t.total_blks(), 0);

        let real = MultiBlkId::single(0, 0, 4);
        assert!(!real.is_tombstone());
        let real = MultiBlkId::single(3, 0, 0);
        assert!(!real.is_tombstone());
    }

    #[test]
    fn bytes_roundtrip() {
        let id = MultiBlkId {
            chunk: 7,
            extents: vec![BlkExtent::new(128, 4), BlkExtent::new(512, 2)],
        };
        let parsed = MultiBlkId::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.total_blks(), 6);

        assert!(MultiBlkId::from_bytes(&[1, 2]).is_none());
    }
}

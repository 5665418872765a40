//! On-disk record codecs
//!
//! Three record families share the 16-byte `DataHeader`:
//!
//! ```text
//! +-------+---------+------+----------+
//! | magic | version | type | reserved |
//! | 8B    | 1B      | 1B   | 6B       |
//! +-------+---------+------+----------+
//! ```
//!
//! All multibyte fields are little-endian and layouts are packed. The
//! formats are a stable contract; any change requires a version bump and a
//! forward-only migration.

use blobgrid_common::{
    BlobId, ChunkNum, GroupId, HashAlgorithm, PgId, PgMember, ShardId, ShardInfo, ShardState,
    BLOB_MAX_HASH_LEN,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

/// Magic shared by all data records
pub const DATA_HEADER_MAGIC: u64 = 0x21fd_ffdb_a8d6_8fc6;

/// Current data record version
pub const DATA_HEADER_VERSION: u8 = 0x01;

/// Blob payloads are padded to a multiple of this size
pub const DATA_BLOCK_SIZE: u32 = 1024;

/// Alignment unit of payload buffers
pub const IO_ALIGN: usize = 512;

/// Number of pre-allocated zero-pad buffers (pad sizes 0 and 512)
pub const MAX_ZPAD_BUFS: usize = (DATA_BLOCK_SIZE as usize) / IO_ALIGN;

/// Meta-blk type name under which PG superblocks are registered
pub const PG_META_NAME: &str = "PGManager";

/// Meta-blk type name under which shard superblocks are registered
pub const SHARD_META_NAME: &str = "ShardManager";

/// Codec failures; at commit time these indicate corruption
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("record too short")]
    TooShort,
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version")]
    UnsupportedVersion,
    #[error("invalid field value")]
    InvalidField,
}

/// Round `v` up to the next multiple of `align`
#[inline]
#[must_use]
pub const fn round_up(v: usize, align: usize) -> usize {
    v.div_ceil(align) * align
}

/// Discriminates the record kinds behind a `DataHeader`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    /// Shard superblock
    ShardInfo = 1,
    /// Blob header
    BlobInfo = 2,
}

impl DataType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ShardInfo),
            2 => Some(Self::BlobInfo),
            _ => None,
        }
    }
}

/// Common header of every data record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    /// Record magic, `DATA_HEADER_MAGIC`
    pub magic: u64,
    /// Record version
    pub version: u8,
    /// Record kind
    pub dtype: DataType,
}

impl DataHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 16;

    /// Header for a new record of `dtype`
    #[must_use]
    pub const fn new(dtype: DataType) -> Self {
        Self {
            magic: DATA_HEADER_MAGIC,
            version: DATA_HEADER_VERSION,
            dtype,
        }
    }

    /// A record is valid iff the magic matches and the version is known
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == DATA_HEADER_MAGIC && self.version <= DATA_HEADER_VERSION
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.dtype as u8);
        buf.put_slice(&[0u8; 6]);
    }

    fn decode(data: &mut &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::SIZE {
            return Err(CodecError::TooShort);
        }
        let magic = data.get_u64_le();
        if magic != DATA_HEADER_MAGIC {
            return Err(CodecError::BadMagic);
        }
        let version = data.get_u8();
        if version > DATA_HEADER_VERSION {
            return Err(CodecError::UnsupportedVersion);
        }
        let dtype = DataType::from_u8(data.get_u8()).ok_or(CodecError::InvalidField)?;
        data.advance(6);
        Ok(Self {
            magic,
            version,
            dtype,
        })
    }
}

/// PG superblock: fixed head plus member and chunk arrays
///
/// ```text
/// | id | num_members | num_chunks | replica_set_uuid | pg_size |
/// | index_table_uuid | blob_seq | active | tombstone | occupied |
/// | pg_member[num_members] | chunk_num[num_chunks] |
/// ```
///
/// Chunk entry `i` is the physical chunk backing virtual chunk `i`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PgSuperblk {
    pub id: PgId,
    pub replica_set_uuid: GroupId,
    pub pg_size: u64,
    pub index_table_uuid: Uuid,
    pub blob_sequence_num: u64,
    pub active_blob_count: u64,
    pub tombstone_blob_count: u64,
    pub total_occupied_blk_count: u64,
    /// Replica set, ordered by peer id
    pub members: Vec<PgMember>,
    /// v_chunk -> p_chunk mapping
    pub chunks: Vec<ChunkNum>,
}

impl PgSuperblk {
    const FIXED_SIZE: usize = 2 + 4 + 4 + 16 + 8 + 16 + 8 + 8 + 8 + 8;
    const MEMBER_SIZE: usize = 16 + PgMember::MAX_NAME_LEN + 4;

    /// Serialize to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            Self::FIXED_SIZE + self.members.len() * Self::MEMBER_SIZE + self.chunks.len() * 2,
        );
        buf.put_u16_le(self.id);
        buf.put_u32_le(self.members.len() as u32);
        buf.put_u32_le(self.chunks.len() as u32);
        buf.put_slice(self.replica_set_uuid.as_bytes());
        buf.put_u64_le(self.pg_size);
        buf.put_slice(self.index_table_uuid.as_bytes());
        buf.put_u64_le(self.blob_sequence_num);
        buf.put_u64_le(self.active_blob_count);
        buf.put_u64_le(self.tombstone_blob_count);
        buf.put_u64_le(self.total_occupied_blk_count);
        for m in &self.members {
            buf.put_slice(m.id.as_bytes());
            let mut name = [0u8; PgMember::MAX_NAME_LEN];
            let len = m.name.len().min(PgMember::MAX_NAME_LEN);
            name[..len].copy_from_slice(&m.name.as_bytes()[..len]);
            buf.put_slice(&name);
            buf.put_i32_le(m.priority);
        }
        for &c in &self.chunks {
            buf.put_u16_le(c);
        }
        buf.freeze()
    }

    /// Parse from bytes; array offsets are derived from the two counts
    pub fn from_bytes(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::FIXED_SIZE {
            return Err(CodecError::TooShort);
        }
        let id = data.get_u16_le();
        let num_members = data.get_u32_le() as usize;
        let num_chunks = data.get_u32_le() as usize;
        let replica_set_uuid = get_uuid(&mut data);
        let pg_size = data.get_u64_le();
        let index_table_uuid = get_uuid(&mut data);
        let blob_sequence_num = data.get_u64_le();
        let active_blob_count = data.get_u64_le();
        let tombstone_blob_count = data.get_u64_le();
        let total_occupied_blk_count = data.get_u64_le();

        if data.len() < num_members * Self::MEMBER_SIZE + num_chunks * 2 {
            return Err(CodecError::TooShort);
        }
        let mut members = Vec::with_capacity(num_members);
        for _ in 0..num_members {
            let id = get_uuid(&mut data);
            let mut name = [0u8; PgMember::MAX_NAME_LEN];
            data.copy_to_slice(&mut name);
            let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
            let name = String::from_utf8_lossy(&name[..end]).into_owned();
            let priority = data.get_i32_le();
            members.push(PgMember::new(id, name, priority));
        }
        let mut chunks = Vec::with_capacity(num_chunks);
        for _ in 0..num_chunks {
            chunks.push(data.get_u16_le());
        }

        Ok(Self {
            id,
            replica_set_uuid,
            pg_size,
            index_table_uuid,
            blob_sequence_num,
            active_blob_count,
            tombstone_blob_count,
            total_occupied_blk_count,
            members,
            chunks,
        })
    }
}

/// Shard superblock: `DataHeader | ShardInfo | p_chunk_id | v_chunk_id`
#[derive(Clone, Debug, PartialEq)]
pub struct ShardSuperblk {
    pub header: DataHeader,
    pub info: ShardInfo,
    /// Physical chunk on this replica
    pub p_chunk_id: ChunkNum,
    /// Virtual chunk within the PG, stable across replicas
    pub v_chunk_id: ChunkNum,
}

impl ShardSuperblk {
    /// Encoded size in bytes
    pub const SIZE: usize = DataHeader::SIZE + 8 + 2 + 1 + 8 + 8 + 8 + 8 + 8 + 2 + 2;

    /// Build a superblock for `info`
    #[must_use]
    pub fn new(info: ShardInfo, p_chunk_id: ChunkNum, v_chunk_id: ChunkNum) -> Self {
        Self {
            header: DataHeader::new(DataType::ShardInfo),
            info,
            p_chunk_id,
            v_chunk_id,
        }
    }

    /// Serialize to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.header.encode(&mut buf);
        buf.put_u64_le(self.info.id.as_u64());
        buf.put_u16_le(self.info.placement_group);
        buf.put_u8(self.info.state as u8);
        buf.put_u64_le(self.info.created_time);
        buf.put_u64_le(self.info.last_modified_time);
        buf.put_u64_le(self.info.total_capacity_bytes);
        buf.put_u64_le(self.info.used_capacity_bytes);
        buf.put_u64_le(self.info.deleted_capacity_bytes);
        buf.put_u16_le(self.p_chunk_id);
        buf.put_u16_le(self.v_chunk_id);
        buf.freeze()
    }

    /// Parse and validate from bytes
    pub fn from_bytes(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::SIZE {
            return Err(CodecError::TooShort);
        }
        let header = DataHeader::decode(&mut data)?;
        if header.dtype != DataType::ShardInfo {
            return Err(CodecError::InvalidField);
        }
        let id = ShardId::from(data.get_u64_le());
        let placement_group = data.get_u16_le();
        let state = ShardState::from_u8(data.get_u8()).ok_or(CodecError::InvalidField)?;
        let created_time = data.get_u64_le();
        let last_modified_time = data.get_u64_le();
        let total_capacity_bytes = data.get_u64_le();
        let used_capacity_bytes = data.get_u64_le();
        let deleted_capacity_bytes = data.get_u64_le();
        let p_chunk_id = data.get_u16_le();
        let v_chunk_id = data.get_u16_le();
        Ok(Self {
            header,
            info: ShardInfo {
                id,
                placement_group,
                state,
                created_time,
                last_modified_time,
                total_capacity_bytes,
                used_capacity_bytes,
                deleted_capacity_bytes,
            },
            p_chunk_id,
            v_chunk_id,
        })
    }
}

/// Header stored in front of every blob payload
///
/// The full payload layout is
/// `BlobHeader | user_key | blob data | zero padding to DATA_BLOCK_SIZE`,
/// with the header+key and data regions each aligned to `IO_ALIGN`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobHeader {
    pub header: DataHeader,
    pub hash_algorithm: HashAlgorithm,
    /// Digest over `data ‖ user_key`, left-aligned
    pub hash: [u8; BLOB_MAX_HASH_LEN],
    pub shard_id: ShardId,
    pub blob_id: BlobId,
    /// Actual blob data length
    pub blob_size: u32,
    /// Offset of this blob in the client's logical object
    pub object_offset: u64,
    /// Offset of the data region within the payload
    pub data_offset: u32,
    /// Actual user key length
    pub user_key_size: u32,
}

impl BlobHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = DataHeader::SIZE + 1 + BLOB_MAX_HASH_LEN + 8 + 8 + 4 + 8 + 4 + 4;

    /// Serialize to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.header.encode(&mut buf);
        buf.put_u8(self.hash_algorithm as u8);
        buf.put_slice(&self.hash);
        buf.put_u64_le(self.shard_id.as_u64());
        buf.put_u64_le(self.blob_id);
        buf.put_u32_le(self.blob_size);
        buf.put_u64_le(self.object_offset);
        buf.put_u32_le(self.data_offset);
        buf.put_u32_le(self.user_key_size);
        buf.freeze()
    }

    /// Parse and validate from bytes
    pub fn from_bytes(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::SIZE {
            return Err(CodecError::TooShort);
        }
        let header = DataHeader::decode(&mut data)?;
        if header.dtype != DataType::BlobInfo {
            return Err(CodecError::InvalidField);
        }
        let hash_algorithm =
            HashAlgorithm::from_u8(data.get_u8()).ok_or(CodecError::InvalidField)?;
        let mut hash = [0u8; BLOB_MAX_HASH_LEN];
        data.copy_to_slice(&mut hash);
        let shard_id = ShardId::from(data.get_u64_le());
        let blob_id = data.get_u64_le();
        let blob_size = data.get_u32_le();
        let object_offset = data.get_u64_le();
        let data_offset = data.get_u32_le();
        let user_key_size = data.get_u32_le();
        Ok(Self {
            header,
            hash_algorithm,
            hash,
            shard_id,
            blob_id,
            blob_size,
            object_offset,
            data_offset,
            user_key_size,
        })
    }
}

fn get_uuid(data: &mut &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    data.copy_to_slice(&mut bytes);
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_shard_info() -> ShardInfo {
        ShardInfo {
            id: ShardId::from_parts(3, 11),
            placement_group: 3,
            state: ShardState::Open,
            created_time: 1000,
            last_modified_time: 1001,
            total_capacity_bytes: 1 << 20,
            used_capacity_bytes: 2048,
            deleted_capacity_bytes: 0,
        }
    }

    #[test]
    fn pg_superblk_roundtrip() {
        let sb = PgSuperblk {
            id: 9,
            replica_set_uuid: Uuid::new_v4(),
            pg_size: 64 << 20,
            index_table_uuid: Uuid::new_v4(),
            blob_sequence_num: 17,
            active_blob_count: 12,
            tombstone_blob_count: 5,
            total_occupied_blk_count: 99,
            members: vec![
                PgMember::new(Uuid::new_v4(), "replica-a", 1),
                PgMember::new(Uuid::new_v4(), "replica-b", 0),
            ],
            chunks: vec![4, 9, 2, 7],
        };
        let parsed = PgSuperblk::from_bytes(&sb.to_bytes()).unwrap();
        assert_eq!(parsed, sb);
    }

    #[test]
    fn pg_superblk_member_name_is_c_string() {
        let long_name = "n".repeat(PgMember::MAX_NAME_LEN + 10);
        let sb = PgSuperblk {
            id: 1,
            replica_set_uuid: Uuid::new_v4(),
            pg_size: 0,
            index_table_uuid: Uuid::new_v4(),
            blob_sequence_num: 0,
            active_blob_count: 0,
            tombstone_blob_count: 0,
            total_occupied_blk_count: 0,
            members: vec![PgMember::new(Uuid::new_v4(), long_name, 0)],
            chunks: vec![],
        };
        let parsed = PgSuperblk::from_bytes(&sb.to_bytes()).unwrap();
        assert_eq!(parsed.members[0].name.len(), PgMember::MAX_NAME_LEN);
    }

    #[test]
    fn shard_superblk_roundtrip() {
        let sb = ShardSuperblk::new(sample_shard_info(), 42, 1);
        assert_eq!(sb.to_bytes().len(), ShardSuperblk::SIZE);
        let parsed = ShardSuperblk::from_bytes(&sb.to_bytes()).unwrap();
        assert_eq!(parsed, sb);
    }

    #[test]
    fn blob_header_roundtrip() {
        let hdr = BlobHeader {
            header: DataHeader::new(DataType::BlobInfo),
            hash_algorithm: HashAlgorithm::Sha1,
            hash: [7u8; BLOB_MAX_HASH_LEN],
            shard_id: ShardId::from_parts(1, 2),
            blob_id: 33,
            blob_size: 512,
            object_offset: 4096,
            data_offset: 512,
            user_key_size: 5,
        };
        assert_eq!(hdr.to_bytes().len(), BlobHeader::SIZE);
        let parsed = BlobHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let sb = ShardSuperblk::new(sample_shard_info(), 0, 0);
        let mut bytes = sb.to_bytes().to_vec();
        bytes[0] ^= 0xff;
        assert_eq!(
            ShardSuperblk::from_bytes(&bytes),
            Err(CodecError::BadMagic)
        );

        let mut bytes = sb.to_bytes().to_vec();
        bytes[8] = DATA_HEADER_VERSION + 1;
        assert_eq!(
            ShardSuperblk::from_bytes(&bytes),
            Err(CodecError::UnsupportedVersion)
        );
    }

    #[test]
    fn round_up_alignment() {
        assert_eq!(round_up(0, IO_ALIGN), 0);
        assert_eq!(round_up(1, IO_ALIGN), 512);
        assert_eq!(round_up(512, IO_ALIGN), 512);
        assert_eq!(round_up(513, IO_ALIGN), 1024);
    }
}

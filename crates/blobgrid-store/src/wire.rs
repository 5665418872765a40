//! Replicated log message framing
//!
//! Every replicated entry carries a fixed header followed by the serialized
//! operation payload in the same blob:
//!
//! ```text
//! +-------+---------+----------+--------------+-------------+------------+
//! | magic | version | msg_type | payload_size | payload_crc | header_crc |
//! | 8B    | 1B      | 1B       | 4B           | 4B          | 4B         |
//! +-------+---------+----------+--------------+-------------+------------+
//! ```
//!
//! CRCs are CRC32-IEEE seeded with `INIT_CRC32`. `seal()` stamps
//! `header_crc` over all preceding header bytes; a header that fails the
//! magic, version, or seal check is treated as corrupted.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::records::CodecError;

/// Log header magic
pub const REPL_MSG_MAGIC: u64 = 0x61f6_b9d4_8a3e_10c7;

/// Log header version
pub const REPL_MSG_VERSION: u8 = 1;

/// Seed of all log CRC computations
pub const INIT_CRC32: u32 = 0x1234_5678;

/// CRC32-IEEE continuing from `seed`
#[must_use]
pub fn crc32_ieee(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

/// One-byte operation tag of a replicated entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicationMessageType {
    CreatePg = 1,
    CreateShard = 2,
    SealShard = 3,
    PutBlob = 4,
    DelBlob = 5,
}

impl ReplicationMessageType {
    /// Decode from the wire byte
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::CreatePg),
            2 => Some(Self::CreateShard),
            3 => Some(Self::SealShard),
            4 => Some(Self::PutBlob),
            5 => Some(Self::DelBlob),
            _ => None,
        }
    }
}

/// Fixed header of every replicated log entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicationMessageHeader {
    pub magic: u64,
    pub version: u8,
    pub msg_type: ReplicationMessageType,
    pub payload_size: u32,
    pub payload_crc: u32,
    pub header_crc: u32,
}

impl ReplicationMessageHeader {
    /// Encoded size in bytes
    pub const SIZE: usize = 8 + 1 + 1 + 4 + 4 + 4;

    /// Build a sealed header for `payload`
    #[must_use]
    pub fn new(msg_type: ReplicationMessageType, payload: &[u8]) -> Self {
        let mut header = Self {
            magic: REPL_MSG_MAGIC,
            version: REPL_MSG_VERSION,
            msg_type,
            payload_size: payload.len() as u32,
            payload_crc: crc32_ieee(INIT_CRC32, payload),
            header_crc: 0,
        };
        header.seal();
        header
    }

    /// Stamp `header_crc` over the preceding header fields
    pub fn seal(&mut self) {
        self.header_crc = 0;
        self.header_crc = crc32_ieee(INIT_CRC32, &self.to_bytes()[..Self::SIZE - 4]);
    }

    /// Whether the header fails magic, version, or seal verification
    #[must_use]
    pub fn corrupted(&self) -> bool {
        self.magic != REPL_MSG_MAGIC
            || self.version != REPL_MSG_VERSION
            || self.header_crc != crc32_ieee(INIT_CRC32, &self.to_bytes()[..Self::SIZE - 4])
    }

    /// Serialize to bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type as u8);
        buf.put_u32_le(self.payload_size);
        buf.put_u32_le(self.payload_crc);
        buf.put_u32_le(self.header_crc);
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse from bytes (without verifying the seal; see [`Self::corrupted`])
    pub fn from_bytes(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::SIZE {
            return Err(CodecError::TooShort);
        }
        let magic = data.get_u64_le();
        let version = data.get_u8();
        let msg_type =
            ReplicationMessageType::from_u8(data.get_u8()).ok_or(CodecError::InvalidField)?;
        let payload_size = data.get_u32_le();
        let payload_crc = data.get_u32_le();
        let header_crc = data.get_u32_le();
        Ok(Self {
            magic,
            version,
            msg_type,
            payload_size,
            payload_crc,
            header_crc,
        })
    }
}

/// Frame a payload into a single header blob: `header | payload`
#[must_use]
pub fn build_msg(msg_type: ReplicationMessageType, payload: &[u8]) -> Bytes {
    let header = ReplicationMessageHeader::new(msg_type, payload);
    let mut buf = BytesMut::with_capacity(ReplicationMessageHeader::SIZE + payload.len());
    buf.put_slice(&header.to_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a header blob into its verified-length header and payload.
///
/// Only structural length checks happen here; CRC verification is the
/// commit handler's responsibility so it can route the error to the
/// proposer.
pub fn split_msg(blob: &[u8]) -> Result<(ReplicationMessageHeader, &[u8]), CodecError> {
    let header = ReplicationMessageHeader::from_bytes(blob)?;
    let payload = &blob[ReplicationMessageHeader::SIZE..];
    if payload.len() < header.payload_size as usize {
        return Err(CodecError::TooShort);
    }
    Ok((header, &payload[..header.payload_size as usize]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_header_verifies() {
        let header = ReplicationMessageHeader::new(ReplicationMessageType::CreatePg, b"payload");
        assert!(!header.corrupted());
        assert_eq!(header.payload_size, 7);
        assert_eq!(header.payload_crc, crc32_ieee(INIT_CRC32, b"payload"));
    }

    #[test]
    fn tampered_header_is_corrupted() {
        let mut header =
            ReplicationMessageHeader::new(ReplicationMessageType::PutBlob, b"payload");
        header.payload_size += 1;
        assert!(header.corrupted());

        header.seal();
        assert!(!header.corrupted());
    }

    #[test]
    fn build_and_split_roundtrip() {
        let msg = build_msg(ReplicationMessageType::SealShard, b"shard-sb");
        let (header, payload) = split_msg(&msg).unwrap();
        assert!(!header.corrupted());
        assert_eq!(header.msg_type, ReplicationMessageType::SealShard);
        assert_eq!(payload, b"shard-sb");
        assert_eq!(crc32_ieee(INIT_CRC32, payload), header.payload_crc);
    }

    #[test]
    fn truncated_message_is_rejected() {
        let msg = build_msg(ReplicationMessageType::DelBlob, b"0123456789");
        assert_eq!(
            split_msg(&msg[..msg.len() - 4]).unwrap_err(),
            CodecError::TooShort
        );
        assert_eq!(split_msg(&msg[..8]).unwrap_err(), CodecError::TooShort);
    }
}

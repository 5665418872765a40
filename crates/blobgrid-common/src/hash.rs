//! Blob payload hashing
//!
//! Blobs carry an algorithm-tagged hash computed over the body followed by
//! the user key. The digest is stored left-aligned in a fixed 32-byte field;
//! algorithms with shorter output leave the tail zeroed.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Fixed width of the on-disk hash field
pub const BLOB_MAX_HASH_LEN: usize = 32;

/// Hash algorithm recorded in a blob header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HashAlgorithm {
    /// No integrity hash
    None = 0,
    /// CRC32 (IEEE), 4 bytes
    #[default]
    Crc32 = 1,
    /// MD5, 16 bytes
    Md5 = 2,
    /// SHA1, 20 bytes
    Sha1 = 3,
}

impl HashAlgorithm {
    /// Decode from the on-disk byte
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Crc32),
            2 => Some(Self::Md5),
            3 => Some(Self::Sha1),
            _ => None,
        }
    }

    /// Digest length in bytes
    #[must_use]
    pub const fn digest_len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Crc32 => 4,
            Self::Md5 => 16,
            Self::Sha1 => 20,
        }
    }
}

/// Compute the payload hash over `data ‖ user_key`
#[must_use]
pub fn compute_blob_hash(
    algorithm: HashAlgorithm,
    data: &[u8],
    user_key: &[u8],
) -> [u8; BLOB_MAX_HASH_LEN] {
    let mut out = [0u8; BLOB_MAX_HASH_LEN];
    match algorithm {
        HashAlgorithm::None => {}
        HashAlgorithm::Crc32 => {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(data);
            hasher.update(user_key);
            out[..4].copy_from_slice(&hasher.finalize().to_le_bytes());
        }
        HashAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            hasher.update(data);
            hasher.update(user_key);
            out[..16].copy_from_slice(&hasher.finalize());
        }
        HashAlgorithm::Sha1 => {
            let mut hasher = Sha1::new();
            hasher.update(data);
            hasher.update(user_key);
            out[..20].copy_from_slice(&hasher.finalize());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_all_zero() {
        let h = compute_blob_hash(HashAlgorithm::None, b"payload", b"key");
        assert_eq!(h, [0u8; BLOB_MAX_HASH_LEN]);
    }

    #[test]
    fn user_key_is_part_of_the_digest() {
        for algo in [HashAlgorithm::Crc32, HashAlgorithm::Md5, HashAlgorithm::Sha1] {
            let with_key = compute_blob_hash(algo, b"payload", b"key");
            let without_key = compute_blob_hash(algo, b"payload", b"");
            assert_ne!(with_key, without_key, "{algo:?}");

            // Concatenation order is data then key, not key then data.
            let swapped = compute_blob_hash(algo, b"key", b"payload");
            assert_ne!(with_key, swapped, "{algo:?}");
        }
    }

    #[test]
    fn digest_tail_is_zeroed() {
        let h = compute_blob_hash(HashAlgorithm::Sha1, b"hello", b"k");
        assert!(h[20..].iter().all(|&b| b == 0));
        let h = compute_blob_hash(HashAlgorithm::Crc32, b"hello", b"k");
        assert!(h[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn sha1_matches_direct_digest() {
        use sha1::{Digest, Sha1};
        let expected = Sha1::digest(b"hellok");
        let h = compute_blob_hash(HashAlgorithm::Sha1, b"hello", b"k");
        assert_eq!(&h[..20], expected.as_slice());
    }
}

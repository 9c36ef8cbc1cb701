//! Blob identity.
//!
//! Blobs are opaque encrypted buffers of up to [`MAX_BLOB_SIZE`] bytes,
//! addressed by the lowercase hexadecimal SHA-384 digest of their
//! contents. Since one byte of every blob is consumed by padding, the
//! plaintext chunk obtained by decrypting a full blob is exactly
//! [`CHUNK_SIZE`] bytes.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{de, Deserialize, Serialize};
use sha2::{Digest, Sha384};

use crate::error::{StrandError, StrandResult};

/// The maximum size of an encrypted blob, in bytes.
pub const MAX_BLOB_SIZE: usize = 2 * 1024 * 1024;

/// The size of the plaintext chunk produced by a full blob.
///
/// Every chunk of a stream except the final one is exactly this long.
pub const CHUNK_SIZE: usize = MAX_BLOB_SIZE - 1;

/// The length of a blob hash in hexadecimal form.
pub const BLOB_HASH_HEX_LEN: usize = 96;

lazy_static! {
    static ref BLOB_HASH_REGEX: Regex = Regex::new(r"^[0-9a-f]{96}$").unwrap();
}

/// The content address of a blob.
///
/// Always the 96-character lowercase hexadecimal SHA-384 digest of the
/// encrypted blob contents.
#[derive(Serialize, Deserialize, Clone, Hash, Eq, PartialEq)]
#[serde(transparent)]
pub struct BlobHash(#[serde(deserialize_with = "BlobHash::deserialize")] String);

impl BlobHash {
    /// Creates a blob hash from a hexadecimal string.
    pub fn new(hash: String) -> StrandResult<Self> {
        if hash.len() != BLOB_HASH_HEX_LEN {
            return Err(StrandError::InvalidBlobHash {
                hash,
                reason: "invalid length",
            });
        }

        if !BLOB_HASH_REGEX.is_match(&hash) {
            return Err(StrandError::InvalidBlobHash {
                hash,
                reason: "must be lowercase hexadecimal",
            });
        }

        Ok(Self(hash))
    }

    /// Computes the hash of a blob.
    pub fn from_blob(blob: &[u8]) -> Self {
        let mut hasher = Sha384::new();
        hasher.update(blob);
        Self(hex::encode(hasher.finalize()))
    }

    /// Returns whether `blob` actually hashes to this address.
    pub fn verify(&self, blob: &[u8]) -> bool {
        Self::from_blob(blob) == *self
    }

    /// Returns the two-character shard prefix of the hash.
    pub fn shard_prefix(&self) -> &str {
        &self.0[..2]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;

        let s = String::deserialize(deserializer)?;
        Self::new(s)
            .map(|h| h.0)
            .map_err(|e| Error::custom(e.to_string()))
    }
}

impl FromStr for BlobHash {
    type Err = StrandError;

    fn from_str(s: &str) -> StrandResult<Self> {
        Self::new(s.to_owned())
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BlobHash({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_hash_validation() {
        let valid = "a".repeat(96);
        assert!(BlobHash::new(valid).is_ok());

        assert!(BlobHash::new("deadbeef".to_string()).is_err());
        assert!(BlobHash::new("A".repeat(96)).is_err());
        assert!(BlobHash::new("z".repeat(96)).is_err());
    }

    #[test]
    fn test_blob_hash_digest() {
        let hash = BlobHash::from_blob(b"hello world");
        assert_eq!(hash.as_str().len(), BLOB_HASH_HEX_LEN);
        assert!(hash.verify(b"hello world"));
        assert!(!hash.verify(b"hello worle"));
    }

    #[test]
    fn test_shard_prefix() {
        let hash = BlobHash::from_blob(b"x");
        assert_eq!(hash.shard_prefix(), &hash.as_str()[..2]);
    }
}

//! Utilities for testing.
//!
//! An in-memory [`BlobOrigin`] and a fixture stream builder, so cache
//! and stream behavior can be exercised without a reflector or a disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{ServerError, ServerResult};
use crate::origin::{BlobOrigin, OriginError};
use crate::resolver::{Claim, Resolver};
use strand::blob::BlobHash;
use strand::descriptor::{encrypt_blob, BlobInfo, SdBlob, KEY_SIZE};

/// An in-memory origin.
///
/// Counts `get` calls so tests can assert on single-flight and caching
/// behavior.
#[derive(Default)]
pub struct MemoryOrigin {
    blobs: RwLock<HashMap<String, Bytes>>,
    gets: AtomicUsize,
}

impl MemoryOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a blob as-is and returns its hash.
    pub fn insert(&self, blob: Vec<u8>) -> BlobHash {
        let hash = BlobHash::from_blob(&blob);
        self.blobs
            .write()
            .insert(hash.as_str().to_owned(), Bytes::from(blob));
        hash
    }

    /// Encrypts `plaintext` and stores the resulting blob.
    pub fn insert_encrypted(
        &self,
        plaintext: &[u8],
        key: &[u8; KEY_SIZE],
        iv: &[u8; KEY_SIZE],
    ) -> BlobHash {
        self.insert(encrypt_blob(plaintext, key, iv))
    }

    /// Number of `get` calls served so far.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobOrigin for MemoryOrigin {
    async fn get(&self, hash: &BlobHash) -> Result<Bytes, OriginError> {
        self.gets.fetch_add(1, Ordering::SeqCst);

        self.blobs
            .read()
            .get(hash.as_str())
            .cloned()
            .ok_or(OriginError::NotFound)
    }

    async fn has(&self, hash: &BlobHash) -> Result<bool, OriginError> {
        Ok(self.blobs.read().contains_key(hash.as_str()))
    }
}

/// A resolver backed by a fixed table.
#[derive(Default)]
pub struct StaticResolver {
    claims: RwLock<HashMap<String, Claim>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uri: impl Into<String>, claim: Claim) {
        self.claims.write().insert(uri.into(), claim);
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, uri: &str) -> ServerResult<Claim> {
        self.claims
            .read()
            .get(uri)
            .cloned()
            .ok_or(ServerError::ClaimNotFound)
    }
}

/// A fixture stream: plaintext cut into chunks, encrypted per-chunk and
/// loaded into an origin, with a matching descriptor.
pub struct FixtureStream {
    pub plaintext: Vec<u8>,
    pub sd_blob: SdBlob,
    pub sd_hash: BlobHash,
}

impl FixtureStream {
    /// Builds a stream of `plaintext` cut into `chunk_size`-sized
    /// chunks and publishes it into `origin`.
    ///
    /// Real streams use [`strand::blob::CHUNK_SIZE`]; tests usually
    /// pick something small.
    pub fn publish(origin: &MemoryOrigin, plaintext: Vec<u8>, chunk_size: usize) -> Self {
        let key = [0x42u8; KEY_SIZE];
        let mut blob_infos = Vec::new();

        for (i, chunk) in plaintext.chunks(chunk_size).enumerate() {
            let mut iv = [0u8; KEY_SIZE];
            iv[0] = (i + 1) as u8;
            iv[1] = ((i + 1) >> 8) as u8;

            let blob = encrypt_blob(chunk, &key, &iv);
            let length = blob.len();
            let blob_hash = origin.insert(blob);

            blob_infos.push(BlobInfo {
                index: i as u32,
                length,
                iv,
                blob_hash: Some(blob_hash),
            });
        }

        blob_infos.push(BlobInfo {
            index: blob_infos.len() as u32,
            length: 0,
            iv: [0u8; KEY_SIZE],
            blob_hash: None,
        });

        let sd_blob = SdBlob {
            key,
            stream_name: "fixture".to_string(),
            suggested_file_name: "fixture.mp4".to_string(),
            stream_hash: "f".repeat(96),
            stream_type: "lbryfile".to_string(),
            blob_infos,
        };

        let sd_hash = origin.insert(sd_blob.to_bytes());

        Self {
            plaintext,
            sd_blob,
            sd_hash,
        }
    }
}

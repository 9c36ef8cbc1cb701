//! Stream descriptor codec.
//!
//! A stream descriptor ("SD blob") is an unencrypted blob produced by
//! the upstream origin. It names the AES key of the stream and the
//! ordered list of content blobs, each with its positional IV, length
//! and content hash. The wire form is a JSON document with all binary
//! fields encoded as lowercase hexadecimal.
//!
//! The final entry of the blob list is a terminator: it has a length of
//! zero and no content hash, and does not correspond to a chunk.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};

use crate::blob::BlobHash;
use crate::error::{StrandError, StrandResult};

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// The length of the stream key and of the per-blob IVs.
pub const KEY_SIZE: usize = 16;

/// A parsed stream descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdBlob {
    /// The AES key shared by all blobs of the stream.
    pub key: [u8; KEY_SIZE],

    /// Name of the stream.
    pub stream_name: String,

    /// File name suggested by the publisher.
    pub suggested_file_name: String,

    /// Hash identifying the stream as a whole.
    pub stream_hash: String,

    /// Stream type tag, `"lbryfile"` in practice.
    pub stream_type: String,

    /// Ordered blob list, terminator included.
    ///
    /// IVs are positional: entry `i` decrypts chunk `i`. Order must be
    /// preserved.
    pub blob_infos: Vec<BlobInfo>,
}

/// One entry of the descriptor's blob list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Position of the blob within the stream.
    pub index: u32,

    /// Length of the encrypted blob in bytes. Zero for the terminator.
    pub length: usize,

    /// Initialization vector for this blob.
    pub iv: [u8; KEY_SIZE],

    /// Content hash of the encrypted blob. `None` for the terminator.
    pub blob_hash: Option<BlobHash>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireSdBlob {
    stream_name: String,
    key: String,
    suggested_file_name: String,
    stream_hash: String,
    stream_type: String,
    blobs: Vec<WireBlobInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBlobInfo {
    blob_num: u32,
    length: usize,
    iv: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    blob_hash: Option<String>,
}

impl SdBlob {
    /// Parses a stream descriptor from its wire form.
    pub fn from_bytes(bytes: &[u8]) -> StrandResult<Self> {
        let wire: WireSdBlob =
            serde_json::from_slice(bytes).map_err(|e| StrandError::InvalidDescriptor {
                reason: e.to_string(),
            })?;

        let key = decode_fixed::<KEY_SIZE>("key", &wire.key)?;

        if wire.blobs.is_empty() {
            return Err(invalid("blob list is empty"));
        }

        let mut blob_infos = Vec::with_capacity(wire.blobs.len());
        for (position, blob) in wire.blobs.iter().enumerate() {
            if blob.blob_num as usize != position {
                return Err(invalid("blob list is not densely ordered"));
            }

            let terminal = position == wire.blobs.len() - 1;
            if terminal {
                if blob.length != 0 || blob.blob_hash.is_some() {
                    return Err(invalid("final blob info is not a terminator"));
                }
            } else if blob.length == 0 || blob.blob_hash.is_none() {
                return Err(invalid("non-terminal blob info lacks length or hash"));
            }

            let blob_hash = match &blob.blob_hash {
                Some(hash) => Some(
                    BlobHash::new(hash.clone()).map_err(|e| StrandError::InvalidDescriptor {
                        reason: e.to_string(),
                    })?,
                ),
                None => None,
            };

            blob_infos.push(BlobInfo {
                index: blob.blob_num,
                length: blob.length,
                iv: decode_fixed::<KEY_SIZE>("iv", &blob.iv)?,
                blob_hash,
            });
        }

        Ok(Self {
            key,
            stream_name: decode_hex_string("stream_name", &wire.stream_name)?,
            suggested_file_name: decode_hex_string("suggested_file_name", &wire.suggested_file_name)?,
            stream_hash: wire.stream_hash,
            stream_type: wire.stream_type,
            blob_infos,
        })
    }

    /// Serializes the descriptor back to its wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let wire = WireSdBlob {
            stream_name: hex::encode(self.stream_name.as_bytes()),
            key: hex::encode(self.key),
            suggested_file_name: hex::encode(self.suggested_file_name.as_bytes()),
            stream_hash: self.stream_hash.clone(),
            stream_type: self.stream_type.clone(),
            blobs: self
                .blob_infos
                .iter()
                .map(|info| WireBlobInfo {
                    blob_num: info.index,
                    length: info.length,
                    iv: hex::encode(info.iv),
                    blob_hash: info.blob_hash.as_ref().map(|h| h.as_str().to_owned()),
                })
                .collect(),
        };

        serde_json::to_vec(&wire).expect("descriptor serialization cannot fail")
    }

    /// Number of real chunks in the stream, terminator excluded.
    pub fn num_chunks(&self) -> usize {
        self.blob_infos.len() - 1
    }

    /// Returns the content hash of chunk `idx`, if it is a real chunk.
    pub fn chunk_hash(&self, idx: usize) -> Option<&BlobHash> {
        self.blob_infos.get(idx).and_then(|info| info.blob_hash.as_ref())
    }

    /// An upper bound of the descriptor's in-memory footprint.
    ///
    /// Used for cache accounting. 72 bytes per blob info covers the
    /// 48-byte hash, the IV and struct slack; the fixed 128 bytes cover
    /// the key and name fields.
    pub fn estimated_size(&self) -> usize {
        128 + self.stream_name.len()
            + self.suggested_file_name.len()
            + self.stream_hash.len()
            + self.blob_infos.len() * 72
    }
}

/// Encrypts a plaintext chunk into a blob.
///
/// The inverse of [`decrypt_blob`]; this is what the upstream producer
/// does when publishing a stream, and what tests use to build
/// fixtures.
pub fn encrypt_blob(chunk: &[u8], key: &[u8; KEY_SIZE], iv: &[u8; KEY_SIZE]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(chunk)
}

/// Decrypts a single blob into its plaintext chunk.
pub fn decrypt_blob(blob: &[u8], key: &[u8; KEY_SIZE], iv: &[u8; KEY_SIZE]) -> StrandResult<Vec<u8>> {
    if blob.is_empty() || blob.len() % KEY_SIZE != 0 {
        return Err(StrandError::DecryptionFailed {
            reason: "ciphertext length is not a multiple of the block size",
        });
    }

    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(blob)
        .map_err(|_| StrandError::DecryptionFailed {
            reason: "invalid padding",
        })
}

fn invalid(reason: &str) -> StrandError {
    StrandError::InvalidDescriptor {
        reason: reason.to_owned(),
    }
}

fn decode_fixed<const N: usize>(field: &str, s: &str) -> StrandResult<[u8; N]> {
    let bytes = hex::decode(s).map_err(|_| invalid(&format!("field {field} is not hexadecimal")))?;
    bytes
        .try_into()
        .map_err(|_| invalid(&format!("field {field} has the wrong length")))
}

fn decode_hex_string(field: &str, s: &str) -> StrandResult<String> {
    let bytes = hex::decode(s).map_err(|_| invalid(&format!("field {field} is not hexadecimal")))?;
    String::from_utf8(bytes).map_err(|_| invalid(&format!("field {field} is not valid UTF-8")))
}

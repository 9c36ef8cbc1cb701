//! Upstream blob origins.
//!
//! An origin is a byte-addressable source of encrypted blobs. The
//! capability surface is deliberately narrow: fetch by hash, existence
//! probe, best-effort delete. The cache tiers compose by wrapping an
//! origin, never by inheriting from one.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use displaydoc::Display;
use reqwest::{Client as HttpClient, StatusCode, Url};

use strand::blob::BlobHash;

/// An origin error.
///
/// Payloads are plain strings so results can be fanned out to
/// single-flight joiners by value.
#[derive(Debug, Clone, Display)]
pub enum OriginError {
    /// blob not found
    NotFound,

    /// hash in response does not match the requested hash
    HashMismatch,

    /// origin transport error: {0}
    Transport(String),

    /// operation not implemented
    NotImplemented,
}

impl OriginError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::HashMismatch => "HashMismatch",
            Self::Transport(_) => "Transport",
            Self::NotImplemented => "NotImplemented",
        }
    }
}

impl StdError for OriginError {}

/// A byte-addressable source of encrypted blobs.
#[async_trait]
pub trait BlobOrigin: Send + Sync {
    /// Fetches an encrypted blob by hash.
    ///
    /// Implementations must verify that the returned bytes actually
    /// hash to `hash` and return [`OriginError::HashMismatch`]
    /// otherwise.
    async fn get(&self, hash: &BlobHash) -> Result<Bytes, OriginError>;

    /// Returns whether the origin has a blob.
    ///
    /// The default implementation simply tries to fetch it.
    async fn has(&self, hash: &BlobHash) -> Result<bool, OriginError> {
        match self.get(hash).await {
            Ok(_) => Ok(true),
            Err(OriginError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Deletes a blob from the origin. Best-effort; origins may not
    /// support deletion at all.
    async fn delete(&self, _hash: &BlobHash) -> Result<(), OriginError> {
        Err(OriginError::NotImplemented)
    }
}

/// An origin reachable over plain HTTP.
///
/// Blobs are fetched as `GET {endpoint}/{hash}`. The origin is remote;
/// latency dominates, so responses are buffered whole.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    endpoint: Url,
    client: HttpClient,
}

impl HttpOrigin {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, OriginError> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OriginError::Transport(e.to_string()))?;

        Ok(Self { endpoint, client })
    }

    fn blob_url(&self, hash: &BlobHash) -> Result<Url, OriginError> {
        self.endpoint
            .join(hash.as_str())
            .map_err(|e| OriginError::Transport(e.to_string()))
    }
}

#[async_trait]
impl BlobOrigin for HttpOrigin {
    async fn get(&self, hash: &BlobHash) -> Result<Bytes, OriginError> {
        let res = self
            .client
            .get(self.blob_url(hash)?)
            .send()
            .await
            .map_err(|e| OriginError::Transport(e.to_string()))?;

        match res.status() {
            StatusCode::NOT_FOUND => return Err(OriginError::NotFound),
            s if !s.is_success() => {
                return Err(OriginError::Transport(format!(
                    "origin returned HTTP {s} for {hash}"
                )));
            }
            _ => {}
        }

        let blob = res
            .bytes()
            .await
            .map_err(|e| OriginError::Transport(e.to_string()))?;

        if !hash.verify(&blob) {
            return Err(OriginError::HashMismatch);
        }

        Ok(blob)
    }

    async fn has(&self, hash: &BlobHash) -> Result<bool, OriginError> {
        let res = self
            .client
            .head(self.blob_url(hash)?)
            .send()
            .await
            .map_err(|e| OriginError::Transport(e.to_string()))?;

        match res.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(OriginError::Transport(format!(
                "origin returned HTTP {s} for {hash}"
            ))),
        }
    }
}

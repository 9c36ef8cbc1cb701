//! Transcoded-HLS redirection.
//!
//! Adaptive playback lives in a separate transcoding service. When a
//! request is fit for it (video content on the route shapes that
//! understand HLS) the handler asks this client for a playlist path
//! and redirects instead of streaming the original. The branch is
//! pluggable; a server without a transcoder endpoint simply never
//! redirects.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Url};

/// Looks up transcoded playback paths.
#[async_trait]
pub trait TranscoderClient: Send + Sync {
    /// Returns the HLS playlist path for a stream, or `None` when the
    /// stream has not been transcoded.
    async fn playback_path(&self, claim_id: &str, sd_hash: &str) -> Option<String>;
}

/// The HTTP transcoder lookup.
#[derive(Debug, Clone)]
pub struct HttpTranscoderClient {
    endpoint: Url,
    client: HttpClient,
}

impl HttpTranscoderClient {
    pub fn new(endpoint: Url, timeout: Duration) -> reqwest::Result<Self> {
        let client = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl TranscoderClient for HttpTranscoderClient {
    async fn playback_path(&self, claim_id: &str, sd_hash: &str) -> Option<String> {
        let url = self
            .endpoint
            .join(&format!("api/v1/video/{claim_id}/{sd_hash}"))
            .ok()?;

        let res = self.client.get(url).send().await.ok()?;
        if !res.status().is_success() {
            return None;
        }

        let path = res.text().await.ok()?;
        let path = path.trim();

        if path.is_empty() {
            None
        } else {
            Some(path.to_owned())
        }
    }
}

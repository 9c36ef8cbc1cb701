//! Claim resolution.
//!
//! The resolver maps a content identifier ("claim") to stream metadata:
//! the descriptor hash, the declared size and content type, fees and
//! tags. It lives in a separate service reached over JSON-RPC; the
//! server only depends on the narrow [`Resolver`] capability so tests
//! can substitute a table lookup.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client as HttpClient, Url};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ServerError, ServerResult};
use strand::media_type::patch_media_type;

/// Resolved stream metadata.
#[derive(Debug, Clone, Default)]
pub struct Claim {
    pub claim_id: String,
    pub name: String,

    /// Hex hash of the stream descriptor blob.
    pub sd_hash: String,

    /// Normalised content type.
    pub content_type: String,

    /// Declared stream size; 0 when the publisher did not declare one.
    pub size: u64,

    /// Release timestamp as Unix time.
    pub release_time: i64,

    /// Stream fee; anything above zero makes this a paid stream.
    pub fee_amount: f64,

    pub tags: Vec<String>,
    pub channel_id: Option<String>,

    /// Original file name as published.
    pub source_name: Option<String>,
}

impl Claim {
    /// The stream identifier paid tokens are bound to.
    pub fn stream_id(&self) -> String {
        format!("{}/{}", self.name, self.claim_id)
    }

    pub fn release_date(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.release_time, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Maps content identifiers to claims.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, uri: &str) -> ServerResult<Claim>;
}

/// A resolver backed by the upstream JSON-RPC API.
#[derive(Debug, Clone)]
pub struct JsonRpcResolver {
    endpoint: Url,
    client: HttpClient,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: HashMap<String, RpcClaim>,
}

#[derive(Debug, Deserialize)]
struct RpcClaim {
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    claim_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    value: RpcClaimValue,
    #[serde(default)]
    signing_channel: Option<RpcChannel>,
}

#[derive(Debug, Default, Deserialize)]
struct RpcClaimValue {
    #[serde(default)]
    source: Option<RpcSource>,
    #[serde(default)]
    fee: Option<RpcFee>,
    #[serde(default, deserialize_with = "lenient_i64")]
    release_time: i64,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RpcSource {
    #[serde(default)]
    media_type: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    size: u64,
    #[serde(default)]
    sd_hash: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RpcFee {
    #[serde(default, deserialize_with = "lenient_f64")]
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct RpcChannel {
    #[serde(default)]
    claim_id: String,
}

// The upstream API is loose with numeric types and emits both strings
// and numbers depending on the claim's age.

fn lenient_u64<'de, D: serde::Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(match v {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    })
}

fn lenient_i64<'de, D: serde::Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(match v {
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    })
}

fn lenient_f64<'de, D: serde::Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(match v {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

impl JsonRpcResolver {
    pub fn new(endpoint: Url, timeout: std::time::Duration) -> ServerResult<Self> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(ServerError::request_error)?;

        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl Resolver for JsonRpcResolver {
    async fn resolve(&self, uri: &str) -> ServerResult<Claim> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "resolve",
            "params": { "urls": [uri] },
            "id": 1,
        });

        let res = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("resolver request failed: {e}");
                ServerError::InternalServerError
            })?;

        let mut response: RpcResponse = res.json().await.map_err(|e| {
            tracing::error!("resolver returned garbage: {e}");
            ServerError::InternalServerError
        })?;

        let rpc_claim = response
            .result
            .remove(uri)
            .ok_or(ServerError::ClaimNotFound)?;

        if rpc_claim.error.is_some() || rpc_claim.claim_id.is_empty() {
            return Err(ServerError::ClaimNotFound);
        }

        let source = rpc_claim.value.source.unwrap_or_default();
        if source.sd_hash.is_empty() {
            // Not a stream claim (e.g. a channel or a repost shell)
            return Err(ServerError::ClaimNotFound);
        }

        let release_time = if rpc_claim.value.release_time != 0 {
            rpc_claim.value.release_time
        } else {
            rpc_claim.timestamp
        };

        Ok(Claim {
            claim_id: rpc_claim.claim_id,
            name: rpc_claim.name,
            sd_hash: source.sd_hash,
            content_type: patch_media_type(&source.media_type).to_owned(),
            size: source.size,
            release_time,
            fee_amount: rpc_claim.value.fee.map(|f| f.amount).unwrap_or(0.0),
            tags: rpc_claim.value.tags,
            channel_id: rpc_claim.signing_channel.map(|c| c.claim_id),
            source_name: source.name,
        })
    }
}

//! Server configuration.

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;

use crate::access::HotlinkPolicy;

/// Environment variable storing the Base64-encoded TOML configuration.
///
/// This is useful for deploying to application platforms where mounting
/// a config file is inconvenient.
const ENV_CONFIG_BASE64: &str = "STRAND_SERVER_CONFIG_BASE64";

/// Environment variable storing the Base64-encoded PEM public key used
/// to verify paid-stream tokens.
const ENV_PAID_PUBKEY_BASE64: &str = "STRAND_PAID_TOKEN_PUBKEY_BASE64";

/// Environment variable storing the edge credential for protected
/// content.
const ENV_EDGE_TOKEN: &str = "STRAND_EDGE_TOKEN";

/// Environment variable overriding the advertised player name.
const ENV_PLAYER_NAME: &str = "PLAYER_NAME";

/// Configuration for the strand server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to listen on.
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,

    /// Name advertised in the `X-Powered-By` header.
    #[serde(rename = "player-name")]
    #[serde(default = "default_player_name")]
    pub player_name: String,

    /// Whether `?download=true` requests are honored.
    #[serde(rename = "downloads-enabled")]
    #[serde(default = "default_true")]
    pub downloads_enabled: bool,

    /// How long to wait for open connections on shutdown.
    #[serde(rename = "stop-wait")]
    #[serde(with = "humantime_serde", default = "default_stop_wait")]
    pub stop_wait: Duration,

    /// Upper bound on how long one response body may take to stream,
    /// so abandoned downloads don't pin connections forever.
    #[serde(rename = "stream-write-timeout")]
    #[serde(with = "humantime_serde", default = "default_stream_write_timeout")]
    pub stream_write_timeout: Duration,

    /// Claim resolver.
    pub resolver: ResolverConfig,

    /// Upstream blob origin.
    pub origin: OriginConfig,

    /// On-disk decrypted cache (L2).
    #[serde(rename = "disk-cache")]
    pub disk_cache: DiskCacheConfig,

    /// In-memory hot cache (L1).
    #[serde(rename = "hot-cache")]
    #[serde(default)]
    pub hot_cache: HotCacheConfig,

    /// Chunk prefetch.
    #[serde(default)]
    pub prefetch: PrefetchConfig,

    /// Outgoing bandwidth throttle.
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Paid-stream token verification.
    #[serde(default)]
    pub paid: PaidConfig,

    /// Edge credential for protected content.
    #[serde(rename = "edge-token")]
    #[serde(default = "load_edge_token_from_env")]
    pub edge_token: Option<String>,

    /// Basic-auth credentials of the live-config endpoint.
    #[serde(default)]
    pub admin: Option<AdminConfig>,

    /// IP/ASN bans and rate limits.
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Anti-hot-linking allow lists.
    #[serde(default)]
    pub hotlink: HotlinkConfig,

    /// Transcoded-HLS redirection.
    #[serde(default)]
    pub transcoder: Option<TranscoderConfig>,
}

/// Claim resolver connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// JSON-RPC endpoint.
    pub url: String,

    #[serde(with = "humantime_serde", default = "default_upstream_timeout")]
    pub timeout: Duration,
}

/// Blob origin connection.
#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    /// Base URL blobs are fetched under, ending with a slash.
    pub endpoint: String,

    #[serde(with = "humantime_serde", default = "default_upstream_timeout")]
    pub timeout: Duration,
}

/// On-disk cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskCacheConfig {
    /// The directory to store decrypted objects under.
    pub path: PathBuf,

    /// Size quota in bytes.
    #[serde(rename = "max-bytes")]
    pub max_bytes: u64,

    /// Reaping starts above `max-bytes * high-watermark`.
    #[serde(rename = "high-watermark")]
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,

    /// Reaping stops below `max-bytes * low-watermark`.
    #[serde(rename = "low-watermark")]
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,

    /// Interval between reaper runs. Zero disables the reaper.
    #[serde(rename = "reap-interval")]
    #[serde(with = "humantime_serde", default = "default_reap_interval")]
    pub reap_interval: Duration,

    /// Catalog connection URL. Defaults to a SQLite database inside
    /// the cache directory.
    #[serde(rename = "database-url")]
    #[serde(default)]
    pub database_url: Option<String>,
}

impl DiskCacheConfig {
    pub fn effective_database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!(
                "sqlite://{}?mode=rwc",
                self.path.join("catalog.db").to_string_lossy()
            ),
        }
    }
}

/// In-memory cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HotCacheConfig {
    /// Size quota in bytes.
    #[serde(rename = "max-bytes")]
    pub max_bytes: usize,
}

impl Default for HotCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Prefetch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PrefetchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How many chunks to warm ahead of a read.
    #[serde(default = "default_prefetch_count")]
    pub count: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            count: default_prefetch_count(),
        }
    }
}

/// Throttle configuration; both knobs stay adjustable at runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Outgoing budget per response in MiB/s.
    #[serde(default = "default_throttle_scale")]
    pub scale: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scale: default_throttle_scale(),
        }
    }
}

/// Paid-stream token verification.
#[derive(Debug, Clone, Deserialize)]
pub struct PaidConfig {
    /// Base64 of the PEM-encoded RSA public key of the purchase API.
    #[serde(rename = "token-pubkey-pem-base64")]
    #[serde(default = "load_paid_pubkey_from_env")]
    pub token_pubkey_pem_base64: Option<String>,
}

impl Default for PaidConfig {
    fn default() -> Self {
        Self {
            token_pubkey_pem_base64: load_paid_pubkey_from_env(),
        }
    }
}

impl PaidConfig {
    /// Decodes the configured public key PEM.
    pub fn pubkey_pem(&self) -> Result<Option<Vec<u8>>> {
        match &self.token_pubkey_pem_base64 {
            None => Ok(None),
            Some(b64) => Ok(Some(BASE64_STANDARD.decode(b64)?)),
        }
    }
}

/// Live-config endpoint credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
}

/// Firewall configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallConfig {
    /// Path of the reloadable ban list.
    #[serde(rename = "blacklist-path")]
    #[serde(default = "default_blacklist_path")]
    pub blacklist_path: PathBuf,

    /// IPs exempt from rate limiting.
    #[serde(default)]
    pub whitelist: Vec<IpAddr>,

    /// Statically blocked claim and channel IDs.
    #[serde(rename = "blocked-content")]
    #[serde(default)]
    pub blocked_content: Vec<String>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            blacklist_path: default_blacklist_path(),
            whitelist: Vec::new(),
            blocked_content: Vec::new(),
        }
    }
}

/// Anti-hot-linking allow lists.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HotlinkConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(rename = "allowed-origins")]
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(rename = "allowed-referrers")]
    #[serde(default)]
    pub allowed_referrers: Vec<String>,

    #[serde(rename = "allowed-tld-referrers")]
    #[serde(default)]
    pub allowed_tld_referrers: Vec<String>,

    #[serde(rename = "allowed-user-agents")]
    #[serde(default)]
    pub allowed_user_agents: Vec<String>,

    #[serde(rename = "allowed-special-headers")]
    #[serde(default)]
    pub allowed_special_headers: Vec<String>,

    #[serde(rename = "allowed-x-requested-with")]
    #[serde(default)]
    pub allowed_x_requested_with: Option<String>,
}

impl From<HotlinkConfig> for HotlinkPolicy {
    fn from(config: HotlinkConfig) -> Self {
        Self {
            enabled: config.enabled,
            allowed_origins: config.allowed_origins,
            allowed_referrers: config.allowed_referrers,
            allowed_tld_referrers: config.allowed_tld_referrers,
            allowed_user_agents: config.allowed_user_agents,
            allowed_special_headers: config.allowed_special_headers,
            allowed_x_requested_with: config.allowed_x_requested_with,
        }
    }
}

/// Transcoder connection.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscoderConfig {
    pub endpoint: String,

    #[serde(with = "humantime_serde", default = "default_upstream_timeout")]
    pub timeout: Duration,
}

fn default_listen_address() -> SocketAddr {
    "[::]:8080".parse().unwrap()
}

fn default_player_name() -> String {
    env::var(ENV_PLAYER_NAME).unwrap_or_else(|_| "unknown-player".to_string())
}

fn default_true() -> bool {
    true
}

fn default_stop_wait() -> Duration {
    Duration::from_secs(15)
}

fn default_stream_write_timeout() -> Duration {
    Duration::from_secs(86400)
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_high_watermark() -> f64 {
    0.9
}

fn default_low_watermark() -> f64 {
    0.8
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_prefetch_count() -> usize {
    crate::stream::DEFAULT_PREFETCH_COUNT
}

fn default_throttle_scale() -> f64 {
    1.5
}

fn default_blacklist_path() -> PathBuf {
    PathBuf::from("blacklist.json")
}

fn load_paid_pubkey_from_env() -> Option<String> {
    env::var(ENV_PAID_PUBKEY_BASE64).ok().filter(|s| !s.is_empty())
}

fn load_edge_token_from_env() -> Option<String> {
    env::var(ENV_EDGE_TOKEN).ok().filter(|s| !s.is_empty())
}

pub fn load_config_from_path(path: &Path) -> Result<Config> {
    tracing::info!("Using configurations: {:?}", path);

    let config = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&config)?)
}

pub fn load_config_from_str(s: &str) -> Result<Config> {
    tracing::info!("Using configurations from environment variable");
    Ok(toml::from_str(s)?)
}

/// Loads the configuration in the standard order: the path given on
/// the command line, then the environment variable.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    if let Some(config_path) = config_path {
        load_config_from_path(config_path)
    } else if let Ok(config_env) = env::var(ENV_CONFIG_BASE64) {
        let decoded = String::from_utf8(BASE64_STANDARD.decode(config_env.as_bytes())?)?;
        load_config_from_str(&decoded)
    } else {
        anyhow::bail!(
            "No configuration: pass --config or set {ENV_CONFIG_BASE64} in the environment"
        );
    }
}

//! Request firewalling.
//!
//! Three independent mechanisms consulted by the HTTP handler before a
//! stream is served:
//!
//! - A ban list of IP prefixes and autonomous systems, loaded from
//!   `blacklist.json` and reloadable at runtime. Reads are lock-free
//!   against an immutable snapshot that reloads swap out wholesale.
//! - A content block list of claim and channel IDs.
//! - A sliding-window rate limiter that flags IPs touching too many
//!   distinct resources at once.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

/// Sliding window of the per-IP rate limiter.
pub const WINDOW_SIZE: Duration = Duration::from_secs(120);

/// Distinct resources one IP may touch within the window before being
/// flagged.
pub const MAX_RESOURCES_PER_IP: usize = 4;

/// Flagged IPs above this count are refused outright.
pub const REFUSAL_THRESHOLD: usize = 10;

/// How many IPs the rate-limit window tracks at once.
const RATE_LIMIT_CAPACITY: usize = 1000;

/// `blacklist.json` on-disk schema.
#[derive(Debug, Default, Deserialize)]
pub struct BlacklistFile {
    #[serde(default)]
    pub blacklisted_asn: Vec<u32>,

    #[serde(default)]
    pub blacklisted_ips: Vec<String>,
}

/// An immutable ban-list snapshot.
#[derive(Debug, Default)]
struct BanList {
    prefixes: Vec<IpNet>,
    asns: Vec<u32>,
}

/// Resolves an IP to its autonomous system number.
///
/// The production implementation wraps a GeoIP database; it is an
/// external collaborator, so the firewall only depends on this
/// capability.
pub trait AsnResolver: Send + Sync {
    fn asn_of(&self, ip: IpAddr) -> Option<u32>;
}

/// A resolver that knows nothing; ASN bans are inert with it.
pub struct NoAsnResolver;

impl AsnResolver for NoAsnResolver {
    fn asn_of(&self, _ip: IpAddr) -> Option<u32> {
        None
    }
}

pub struct Firewall {
    blacklist_path: PathBuf,
    bans: RwLock<Arc<BanList>>,
    asn_resolver: Box<dyn AsnResolver>,

    /// IPs exempt from rate limiting.
    whitelist: Vec<IpAddr>,

    /// ip -> (resource -> last touch)
    window: Mutex<LruCache<IpAddr, HashMap<String, Instant>>>,

    /// Blocked claim and channel IDs.
    blocked_content: RwLock<Arc<HashSet<String>>>,
}

impl Firewall {
    pub fn new(
        blacklist_path: PathBuf,
        whitelist: Vec<IpAddr>,
        asn_resolver: Box<dyn AsnResolver>,
    ) -> Self {
        let firewall = Self {
            blacklist_path,
            bans: RwLock::new(Arc::new(BanList::default())),
            asn_resolver,
            whitelist,
            window: Mutex::new(LruCache::new(
                NonZeroUsize::new(RATE_LIMIT_CAPACITY).unwrap(),
            )),
            blocked_content: RwLock::new(Arc::new(HashSet::new())),
        };

        firewall.reload_blacklist();
        firewall
    }

    /// Re-reads `blacklist.json` and swaps in a new snapshot.
    ///
    /// A missing file simply leaves the ban list empty; a malformed
    /// one keeps the previous snapshot.
    pub fn reload_blacklist(&self) {
        let raw = match std::fs::read(&self.blacklist_path) {
            Ok(raw) => raw,
            Err(_) => {
                tracing::warn!(
                    path = %self.blacklist_path.display(),
                    "no blacklist file found, skipping blacklist"
                );
                *self.bans.write() = Arc::new(BanList::default());
                return;
            }
        };

        let parsed: BlacklistFile = match serde_json::from_slice(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!("failed to parse blacklist: {e}");
                return;
            }
        };

        let mut prefixes = Vec::new();
        for entry in &parsed.blacklisted_ips {
            match entry.parse::<IpNet>() {
                Ok(net) => prefixes.push(net),
                // Bare addresses are accepted as /32 (or /128) bans
                Err(_) => match entry.parse::<IpAddr>() {
                    Ok(ip) => prefixes.push(IpNet::from(ip)),
                    Err(e) => tracing::warn!("skipping unparsable ban entry {entry}: {e}"),
                },
            }
        }

        let bans = BanList {
            prefixes,
            asns: parsed.blacklisted_asn,
        };

        tracing::info!(
            prefixes = bans.prefixes.len(),
            asns = bans.asns.len(),
            "loaded blacklist"
        );

        *self.bans.write() = Arc::new(bans);
    }

    /// Returns whether an IP is banned, either directly or through its
    /// autonomous system.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let bans = self.bans.read().clone();

        if bans.prefixes.iter().any(|net| net.contains(&ip)) {
            tracing::warn!(%ip, "IP matches an entry in the banned list");
            return true;
        }

        if !bans.asns.is_empty() {
            if let Some(asn) = self.asn_resolver.asn_of(ip) {
                if bans.asns.contains(&asn) {
                    tracing::warn!(%ip, asn, "IP belongs to a banned AS");
                    return true;
                }
            }
        }

        false
    }

    /// Replaces the content block list.
    pub fn set_blocked_content(&self, ids: impl IntoIterator<Item = String>) {
        let blocked: HashSet<String> = ids.into_iter().collect();
        tracing::info!(entries = blocked.len(), "loaded content block list");
        *self.blocked_content.write() = Arc::new(blocked);
    }

    /// Returns whether a claim, or the channel it belongs to, is
    /// blocked.
    pub fn is_stream_blocked(&self, claim_id: &str, channel_id: Option<&str>) -> bool {
        let blocked = self.blocked_content.read().clone();

        if blocked.contains(claim_id) {
            return true;
        }

        matches!(channel_id, Some(channel) if blocked.contains(channel))
    }

    /// Records a touch of `resource` by `ip` and reports whether the
    /// IP is over its distinct-resource budget, along with the current
    /// count.
    pub fn check_rate_limit(&self, ip: IpAddr, resource: &str) -> (bool, usize) {
        if self.whitelist.contains(&ip) {
            return (false, 0);
        }

        let now = Instant::now();
        let mut window = self.window.lock();

        if !window.contains(&ip) {
            let mut touches = HashMap::new();
            touches.insert(resource.to_owned(), now);
            window.put(ip, touches);
            return (false, 1);
        }

        let touches = window.get_mut(&ip).unwrap();
        touches.insert(resource.to_owned(), now);
        touches.retain(|_, last| now.duration_since(*last) <= WINDOW_SIZE);

        let count = touches.len();
        (count > MAX_RESOURCES_PER_IP, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn firewall_with(blacklist: &str) -> (Firewall, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(blacklist.as_bytes()).unwrap();

        let fw = Firewall::new(path, vec![], Box::new(NoAsnResolver));
        (fw, dir)
    }

    #[test]
    fn test_cidr_bans() {
        let (fw, _dir) = firewall_with(
            r#"{"blacklisted_asn": [], "blacklisted_ips": ["10.1.0.0/16", "192.168.7.9"]}"#,
        );

        assert!(fw.is_banned("10.1.2.3".parse().unwrap()));
        assert!(fw.is_banned("192.168.7.9".parse().unwrap()));
        assert!(!fw.is_banned("10.2.0.1".parse().unwrap()));
        assert!(!fw.is_banned("192.168.7.10".parse().unwrap()));
    }

    #[test]
    fn test_asn_bans() {
        struct FixedAsn;
        impl AsnResolver for FixedAsn {
            fn asn_of(&self, _ip: IpAddr) -> Option<u32> {
                Some(64512)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        std::fs::write(
            &path,
            r#"{"blacklisted_asn": [64512], "blacklisted_ips": []}"#,
        )
        .unwrap();

        let fw = Firewall::new(path, vec![], Box::new(FixedAsn));
        assert!(fw.is_banned("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_reload_replaces_snapshot() {
        let (fw, dir) = firewall_with(r#"{"blacklisted_asn": [], "blacklisted_ips": ["10.0.0.0/8"]}"#);
        assert!(fw.is_banned("10.0.0.1".parse().unwrap()));

        std::fs::write(
            dir.path().join("blacklist.json"),
            r#"{"blacklisted_asn": [], "blacklisted_ips": []}"#,
        )
        .unwrap();
        fw.reload_blacklist();

        assert!(!fw.is_banned("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_rate_limit_window() {
        let (fw, _dir) = firewall_with(r#"{}"#);
        let ip: IpAddr = "198.51.100.4".parse().unwrap();

        for i in 0..MAX_RESOURCES_PER_IP {
            let (flagged, _) = fw.check_rate_limit(ip, &format!("claim-{i}"));
            assert!(!flagged);
        }

        let (flagged, count) = fw.check_rate_limit(ip, "one-too-many");
        assert!(flagged);
        assert_eq!(count, MAX_RESOURCES_PER_IP + 1);

        // Repeat touches of the same resources stay flagged but don't
        // grow the count
        let (_, count_again) = fw.check_rate_limit(ip, "one-too-many");
        assert_eq!(count_again, count);
    }

    #[test]
    fn test_content_blocklist() {
        let (fw, _dir) = firewall_with(r#"{}"#);
        fw.set_blocked_content(["bad-claim".to_string(), "bad-channel".to_string()]);

        assert!(fw.is_stream_blocked("bad-claim", None));
        assert!(fw.is_stream_blocked("fine-claim", Some("bad-channel")));
        assert!(!fw.is_stream_blocked("fine-claim", Some("fine-channel")));
    }

    #[test]
    fn test_whitelisted_ip_is_never_limited() {
        let dir = tempfile::tempdir().unwrap();
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        let fw = Firewall::new(
            dir.path().join("blacklist.json"),
            vec![ip],
            Box::new(NoAsnResolver),
        );

        for i in 0..100 {
            let (flagged, _) = fw.check_rate_limit(ip, &format!("claim-{i}"));
            assert!(!flagged);
        }
    }
}

//! Access predicates.
//!
//! An ordered list of per-request checks composed in front of the
//! streaming path: paid-stream tokens, edge credentials for protected
//! content and an anti-hot-linking allow list. Each predicate either
//! passes or fails with the error kind that maps to the right HTTP
//! status; the handler applies them in order and stops at the first
//! failure.

use axum::http::HeaderMap;
use chrono::Utc;

use crate::error::{ServerError, ServerResult};
use crate::resolver::Claim;
use strand_token::TokenVerifier;

/// Header carrying the edge credential for protected content.
pub const EDGE_TOKEN_HEADER: &str = "x-edge-token";

/// Tags that gate a claim behind the edge credential.
const PROTECTED_TAGS: &[&str] = &["members-only", "rental", "purchase", "unlisted"];

/// Everything a predicate may look at.
pub struct AccessRequest<'a> {
    pub claim: &'a Claim,

    /// Paid token taken from the request path, if the route carries
    /// one.
    pub token: Option<&'a str>,

    pub headers: &'a HeaderMap,
    pub path: &'a str,

    /// Whether the `magic` bypass parameter was valid.
    pub magic_pass: bool,

    /// Speech shortlinks are exempt from hot-link enforcement.
    pub is_speech: bool,
}

/// A per-request access check.
pub trait AccessCheck: Send + Sync {
    fn check(&self, req: &AccessRequest<'_>) -> ServerResult<()>;
}

/// Requires a valid purchase token for streams with a fee.
pub struct PaidAccess {
    verifier: Option<TokenVerifier>,
}

impl PaidAccess {
    pub fn new(verifier: Option<TokenVerifier>) -> Self {
        Self { verifier }
    }
}

impl AccessCheck for PaidAccess {
    fn check(&self, req: &AccessRequest<'_>) -> ServerResult<()> {
        if req.claim.fee_amount <= 0.0 {
            return Ok(());
        }

        tracing::info!(claim_id = %req.claim.claim_id, "paid stream requested");

        let token = match req.token {
            Some(token) if !token.is_empty() => token,
            _ => return Err(ServerError::PaidStream),
        };

        let verifier = self.verifier.as_ref().ok_or_else(|| {
            tracing::error!("paid stream requested but no token pubkey is configured");
            ServerError::InternalServerError
        })?;

        verifier.verify(token, &req.claim.stream_id())?;

        Ok(())
    }
}

/// Requires the edge credential for claims carrying protected tags.
pub struct EdgeAccess {
    credential: Option<String>,
}

impl EdgeAccess {
    pub fn new(credential: Option<String>) -> Self {
        Self { credential }
    }

    fn is_protected(claim: &Claim) -> bool {
        for tag in &claim.tags {
            let tag = tag.as_str();

            if PROTECTED_TAGS.contains(&tag) {
                return true;
            }
            if tag.starts_with("purchase:") || tag.starts_with("rental:") {
                return true;
            }
            if tag.starts_with("scheduled") && claim.release_date() > Utc::now() {
                return true;
            }
        }

        false
    }
}

impl AccessCheck for EdgeAccess {
    fn check(&self, req: &AccessRequest<'_>) -> ServerResult<()> {
        if !Self::is_protected(req.claim) {
            return Ok(());
        }

        let expected = match &self.credential {
            Some(credential) => credential,
            None => return Err(ServerError::EdgeAuthenticationMisconfigured),
        };

        let supplied = req
            .headers
            .get(EDGE_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());

        match supplied {
            None => Err(ServerError::EdgeCredentialsMissing),
            Some(supplied) if supplied != expected => Err(ServerError::EdgeAuthenticationFailed),
            Some(_) => Ok(()),
        }
    }
}

/// Anti-hot-linking configuration.
#[derive(Debug, Clone, Default)]
pub struct HotlinkPolicy {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_referrers: Vec<String>,
    pub allowed_tld_referrers: Vec<String>,
    pub allowed_user_agents: Vec<String>,
    pub allowed_special_headers: Vec<String>,
    pub allowed_x_requested_with: Option<String>,
}

/// Flags requests from outside the allowed origins.
pub struct HotlinkAccess {
    policy: HotlinkPolicy,
}

impl HotlinkAccess {
    pub fn new(policy: HotlinkPolicy) -> Self {
        Self { policy }
    }

    fn is_flagged(&self, req: &AccessRequest<'_>) -> bool {
        let p = &self.policy;
        let header_str = |name: &str| {
            req.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
        };

        let origin = header_str("origin");
        if !origin.is_empty() && p.allowed_origins.iter().any(|o| o == origin) {
            return false;
        }

        let referer = header_str("referer");
        if !referer.is_empty() {
            if p.allowed_referrers.iter().any(|r| r == referer) {
                return false;
            }
            // Weak TLD check, same as the allow list it mirrors
            if p.allowed_tld_referrers.iter().any(|tld| referer.contains(tld)) {
                return false;
            }
        }

        let user_agent = header_str("user-agent");
        if p.allowed_user_agents.iter().any(|ua| user_agent.starts_with(ua)) {
            return false;
        }

        if p.allowed_special_headers
            .iter()
            .any(|h| req.headers.contains_key(h.as_str()))
        {
            return false;
        }

        if let Some(xrw) = &p.allowed_x_requested_with {
            if header_str("x-requested-with") == xrw {
                return false;
            }
        }

        true
    }
}

impl AccessCheck for HotlinkAccess {
    fn check(&self, req: &AccessRequest<'_>) -> ServerResult<()> {
        if !self.policy.enabled || req.is_speech || req.magic_pass {
            return Ok(());
        }

        // Browsing APIs keep working; only media paths are enforced
        if req.path.starts_with("/api/v3/") {
            return Ok(());
        }

        if self.is_flagged(req) {
            return Err(ServerError::Unauthorized);
        }

        Ok(())
    }
}

/// Validates the `magic` bypass parameter: a Unix timestamp no older
/// than five minutes.
pub fn magic_pass(magic: Option<&str>) -> bool {
    let Some(magic) = magic else {
        return false;
    };

    let Ok(unix) = magic.parse::<i64>() else {
        return false;
    };

    let age = Utc::now().timestamp() - unix;
    (0..300).contains(&age)
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;

    fn free_claim() -> Claim {
        Claim {
            claim_id: "c1".to_string(),
            name: "free".to_string(),
            ..Default::default()
        }
    }

    fn request<'a>(claim: &'a Claim, headers: &'a HeaderMap, token: Option<&'a str>) -> AccessRequest<'a> {
        AccessRequest {
            claim,
            token,
            headers,
            path: "/api/v2/streams/free/x/y",
            magic_pass: false,
            is_speech: false,
        }
    }

    #[test]
    fn test_free_stream_needs_no_token() {
        let claim = free_claim();
        let headers = HeaderMap::new();

        let check = PaidAccess::new(None);
        assert!(check.check(&request(&claim, &headers, None)).is_ok());
    }

    #[test]
    fn test_paid_stream_without_token() {
        let mut claim = free_claim();
        claim.fee_amount = 1.0;
        let headers = HeaderMap::new();

        let check = PaidAccess::new(None);
        let err = check.check(&request(&claim, &headers, None)).unwrap_err();
        assert_eq!(err.name(), "PaidStream");
        assert_eq!(err.to_string(), "paid stream");
    }

    #[test]
    fn test_edge_token_for_protected_tags() {
        let mut claim = free_claim();
        claim.tags = vec!["members-only".to_string()];

        let check = EdgeAccess::new(Some("secret".to_string()));

        let headers = HeaderMap::new();
        let err = check.check(&request(&claim, &headers, None)).unwrap_err();
        assert_eq!(err.name(), "EdgeCredentialsMissing");

        let mut headers = HeaderMap::new();
        headers.insert(EDGE_TOKEN_HEADER, "wrong".parse().unwrap());
        let err = check.check(&request(&claim, &headers, None)).unwrap_err();
        assert_eq!(err.name(), "EdgeAuthenticationFailed");

        let mut headers = HeaderMap::new();
        headers.insert(EDGE_TOKEN_HEADER, "secret".parse().unwrap());
        assert!(check.check(&request(&claim, &headers, None)).is_ok());
    }

    #[test]
    fn test_edge_token_misconfigured() {
        let mut claim = free_claim();
        claim.tags = vec!["purchase:2.99".to_string()];

        let check = EdgeAccess::new(None);
        let headers = HeaderMap::new();
        let err = check.check(&request(&claim, &headers, None)).unwrap_err();
        assert_eq!(err.name(), "EdgeAuthenticationMisconfigured");
    }

    #[test]
    fn test_scheduled_claims_gate_until_release() {
        let mut claim = free_claim();
        claim.tags = vec!["scheduled:live".to_string()];
        claim.release_time = (Utc::now() + Duration::hours(1)).timestamp();

        assert!(EdgeAccess::is_protected(&claim));

        claim.release_time = (Utc::now() - Duration::hours(1)).timestamp();
        assert!(!EdgeAccess::is_protected(&claim));
    }

    #[test]
    fn test_hotlink_allows_known_origin() {
        let policy = HotlinkPolicy {
            enabled: true,
            allowed_origins: vec!["https://player.example".to_string()],
            ..Default::default()
        };
        let check = HotlinkAccess::new(policy);
        let claim = free_claim();

        let mut headers = HeaderMap::new();
        headers.insert("origin", "https://player.example".parse().unwrap());
        assert!(check.check(&request(&claim, &headers, None)).is_ok());

        let headers = HeaderMap::new();
        let err = check.check(&request(&claim, &headers, None)).unwrap_err();
        assert_eq!(err.name(), "Unauthorized");
    }

    #[test]
    fn test_hotlink_magic_bypass() {
        let policy = HotlinkPolicy {
            enabled: true,
            ..Default::default()
        };
        let check = HotlinkAccess::new(policy);
        let claim = free_claim();
        let headers = HeaderMap::new();

        let mut req = request(&claim, &headers, None);
        req.magic_pass = true;
        assert!(check.check(&req).is_ok());
    }

    #[test]
    fn test_magic_pass_window() {
        let now = Utc::now().timestamp();

        assert!(magic_pass(Some(&now.to_string())));
        assert!(magic_pass(Some(&(now - 250).to_string())));
        assert!(!magic_pass(Some(&(now - 400).to_string())));
        assert!(!magic_pass(Some("not-a-number")));
        assert!(!magic_pass(None));
    }
}

//! The live-config endpoint.
//!
//! Basic-auth protected knobs that can be turned without a restart:
//! the outgoing throttle and a reload of the ban list.

use std::collections::HashMap;

use axum::extract::{Extension, Query};
use axum::http::HeaderMap;

use crate::error::{ServerError, ServerResult};
use crate::State;
use strand_token::util::parse_basic_auth;

/// `POST /config/throttle?enabled={bool}&scale={float}`
pub async fn handle_throttle(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> ServerResult<&'static str> {
    require_admin(&state, &headers)?;

    let enabled = match query.get("enabled") {
        Some(raw) => Some(raw.parse::<bool>().map_err(|_| {
            ServerError::RequestError(anyhow::anyhow!("failed to parse enabled {raw}"))
        })?),
        None => None,
    };

    let scale = match query.get("scale") {
        Some(raw) => Some(raw.parse::<f64>().map_err(|_| {
            ServerError::RequestError(anyhow::anyhow!("failed to parse scale {raw}"))
        })?),
        None => None,
    };

    state.throttle.set(enabled, scale);

    Ok("ok")
}

/// `POST /config/blacklist` — re-reads `blacklist.json`.
pub async fn handle_blacklist(
    Extension(state): Extension<State>,
    headers: HeaderMap,
) -> ServerResult<&'static str> {
    require_admin(&state, &headers)?;

    state.firewall.reload_blacklist();

    Ok("ok")
}

fn require_admin(state: &State, headers: &HeaderMap) -> ServerResult<()> {
    let admin = state
        .config
        .admin
        .as_ref()
        .ok_or(ServerError::Unauthorized)?;

    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::RequestError(anyhow::anyhow!("authentication required")))?;

    match parse_basic_auth(authorization) {
        Some((user, pass)) if user == admin.username && pass == admin.password => Ok(()),
        _ => Err(ServerError::Blocked),
    }
}

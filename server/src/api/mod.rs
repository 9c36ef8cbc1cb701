//! The HTTP media surface.
//!
//! Every media route funnels into [`serve`]: firewall checks, claim
//! resolution, access predicates, the optional transcoder redirect and
//! finally the range-aware streaming path over [`Stream`].

pub mod admin;
pub mod range;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, SeekFrom};
use std::net::{IpAddr, SocketAddr};

use async_stream::stream;
use axum::{
    body::Body,
    extract::{ConnectInfo, Extension, FromRequestParts, OriginalUri, Path, Query},
    http::{header, HeaderMap, Method, Request, StatusCode},
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use tokio::time::Instant;
use tracing::instrument;

use crate::access::{magic_pass, AccessCheck, AccessRequest};
use crate::api::range::{parse_range, sum_ranges_size};
use crate::error::{ServerError, ServerResult};
use crate::firewall::REFUSAL_THRESHOLD;
use crate::resolver::{Claim, Resolver};
use crate::stream::Stream;
use crate::transcoder::TranscoderClient;
use crate::State;
use strand::range::get_range;

const PARAM_DOWNLOAD: &str = "download";
const PARAM_MAGIC: &str = "magic";

/// Nested hash parameter for signed HLS URLs.
const PARAM_HASH_HLS: &str = "hash-hls";
/// Nested client IP parameter for signed HLS URLs.
const PARAM_CLIENT_IP: &str = "ip";
/// Nested hash parameter for CDN77-signed URLs.
const PARAM_HASH77: &str = "hash77";

/// Buffer size of the serving loop.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Flagged download requests above this count are refused.
const DOWNLOAD_REFUSAL_THRESHOLD: usize = 2;

const CSP_HEADER: &str = "script-src 'none'; report-to default";
const REPORT_TO_HEADER: &str = r#"{"group":"default","max_age":31536000,"endpoints":[{"url":"https://reports.strand.media/csp"}],"include_subdomains":true}"#;

lazy_static! {
    static ref FILENAME_SANITIZER: Regex = Regex::new(r"[^\p{L}\d\-\._ ]+").unwrap();
}

/// Go's `url.PathEscape` character set, for the RFC 5987 file name.
const PATH_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// A normalized media request, whichever route shape it arrived on.
struct StreamPath {
    /// Identifier handed to the resolver.
    uri: String,

    /// Paid token from the path, when the route carries one.
    token: Option<String>,

    is_speech: bool,
}

pub fn get_router() -> Router {
    Router::new()
        .route(
            "/v1/content/claims/:claim_name/:claim_id/:filename",
            get(handle_claim),
        )
        .route("/api/v2/streams/free/:claim_name/:claim_id", get(handle_free))
        .route(
            "/api/v2/streams/paid/:claim_name/:claim_id/:token",
            get(handle_paid),
        )
        .route(
            "/api/v3/streams/free/:claim_name/:claim_id/:sd_hash",
            get(handle_free_sd),
        )
        .route(
            "/api/v3/streams/paid/:claim_name/:claim_id/:sd_hash/:token",
            get(handle_paid_sd),
        )
        .route(
            "/api/v4/streams/free/:claim_name/:claim_id/:sd_hash",
            get(handle_free_sd),
        )
        .route("/v5/streams/start/:claim_id/:sd_hash", get(handle_v56))
        .route("/v5/streams/original/:claim_id/:sd_hash", get(handle_v56))
        .route("/v6/streams/:claim_id/:sd_hash", get(handle_v56))
        .route("/speech/*path", get(handle_speech))
        .route("/healthz", get(handle_healthz))
        .route("/config/throttle", post(admin::handle_throttle))
        .route("/config/blacklist", post(admin::handle_blacklist))
}

/// Sets the headers every response carries.
pub async fn apply_default_headers(
    Extension(state): Extension<State>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let mut response = next.run(req).await;

    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", "*".parse().unwrap());
    headers.insert(
        "Access-Control-Expose-Headers",
        "X-Powered-By".parse().unwrap(),
    );
    headers.insert("X-Powered-By", state.config.player_name.parse().unwrap());
    headers.insert("Content-Security-Policy", CSP_HEADER.parse().unwrap());
    headers.insert("Report-To", REPORT_TO_HEADER.parse().unwrap());
    headers.insert("player-request-method", method.as_str().parse().unwrap());

    response
}

async fn handle_healthz(Extension(state): Extension<State>) -> String {
    format!("{} {}\n", state.config.player_name, env!("CARGO_PKG_VERSION"))
}

async fn handle_claim(
    Extension(state): Extension<State>,
    Path((claim_name, claim_id, _filename)): Path<(String, String, String)>,
    parts: RequestParts,
) -> ServerResult<Response> {
    let sp = claim_path(&claim_name, &claim_id, None)?;
    serve(state, parts, sp).await
}

async fn handle_free(
    Extension(state): Extension<State>,
    Path((claim_name, claim_id)): Path<(String, String)>,
    parts: RequestParts,
) -> ServerResult<Response> {
    let sp = claim_path(&claim_name, &claim_id, None)?;
    serve(state, parts, sp).await
}

async fn handle_paid(
    Extension(state): Extension<State>,
    Path((claim_name, claim_id, token)): Path<(String, String, String)>,
    parts: RequestParts,
) -> ServerResult<Response> {
    let sp = claim_path(&claim_name, &claim_id, Some(token))?;
    serve(state, parts, sp).await
}

async fn handle_free_sd(
    Extension(state): Extension<State>,
    Path((claim_name, claim_id, _sd_hash)): Path<(String, String, String)>,
    parts: RequestParts,
) -> ServerResult<Response> {
    let sp = claim_path(&claim_name, &claim_id, None)?;
    serve(state, parts, sp).await
}

async fn handle_paid_sd(
    Extension(state): Extension<State>,
    Path((claim_name, claim_id, _sd_hash, token)): Path<(String, String, String, String)>,
    parts: RequestParts,
) -> ServerResult<Response> {
    let sp = claim_path(&claim_name, &claim_id, Some(token))?;
    serve(state, parts, sp).await
}

async fn handle_v56(
    Extension(state): Extension<State>,
    Path((claim_id, _sd_hash)): Path<(String, String)>,
    parts: RequestParts,
) -> ServerResult<Response> {
    // The v6 shape allows a cosmetic `.mp4` suffix on the hash; the
    // claim id carries all the information we need.
    if claim_id.len() != 40 {
        return Err(ServerError::NotFound);
    }

    let sp = StreamPath {
        uri: claim_id,
        token: None,
        is_speech: false,
    };
    serve(state, parts, sp).await
}

async fn handle_speech(
    Extension(state): Extension<State>,
    Path(path): Path<String>,
    parts: RequestParts,
) -> ServerResult<Response> {
    // Shortlinks carry a display extension; the claim is what's left
    // after trimming it.
    let uri = match path.rfind('.') {
        Some(dot) => &path[..dot],
        None => path.as_str(),
    };

    if uri.is_empty() {
        return Err(ServerError::NotFound);
    }

    let sp = StreamPath {
        uri: uri.to_owned(),
        token: None,
        is_speech: true,
    };
    serve(state, parts, sp).await
}

fn claim_path(claim_name: &str, claim_id: &str, token: Option<String>) -> ServerResult<StreamPath> {
    let uri = if !claim_name.is_empty() {
        format!("{claim_name}#{claim_id}")
    } else if claim_id.len() == 40 {
        claim_id.to_owned()
    } else {
        return Err(ServerError::NotFound);
    };

    Ok(StreamPath {
        uri,
        token,
        is_speech: false,
    })
}

/// The request context shared by all route shapes.
struct RequestParts {
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    connect_info: ConnectInfo<SocketAddr>,
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequestParts
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        use axum::response::IntoResponse;

        let uri = OriginalUri::from_request_parts(parts, state)
            .await
            .map_err(|e| e.into_response())?;
        let query = Query::from_request_parts(parts, state)
            .await
            .map_err(|e| e.into_response())?;
        let connect_info = ConnectInfo::from_request_parts(parts, state)
            .await
            .map_err(|e| e.into_response())?;

        Ok(Self {
            method: parts.method.clone(),
            uri,
            headers: parts.headers.clone(),
            query,
            connect_info,
        })
    }
}

/// The whole media pipeline for one request.
#[instrument(skip_all, fields(uri = %sp.uri, method = %parts.method))]
async fn serve(state: State, parts: RequestParts, sp: StreamPath) -> ServerResult<Response> {
    let RequestParts {
        method,
        uri,
        headers,
        query: Query(query),
        connect_info: ConnectInfo(client_addr),
    } = parts;
    let path = uri.path().to_owned();

    let ip = client_ip(&headers, client_addr);
    if state.firewall.is_banned(ip) {
        return Err(ServerError::RateLimited);
    }

    let is_download = query
        .get(PARAM_DOWNLOAD)
        .map(|v| truthy(v))
        .unwrap_or(false);
    if is_download && !state.config.downloads_enabled {
        return Err(ServerError::DownloadsDisabled);
    }

    let claim = state.resolver.resolve(&sp.uri).await?;

    if state
        .firewall
        .is_stream_blocked(&claim.claim_id, claim.channel_id.as_deref())
    {
        return Err(ServerError::Blocked);
    }

    let (flagged, count) = state.firewall.check_rate_limit(ip, &claim.claim_id);
    if flagged {
        tracing::warn!(
            %ip,
            count,
            claim_id = %claim.claim_id,
            "IP is over its distinct-resource budget"
        );
        if count > REFUSAL_THRESHOLD {
            return Err(ServerError::RateLimited);
        }
    }
    if is_download && count > DOWNLOAD_REFUSAL_THRESHOLD {
        return Err(ServerError::RateLimited);
    }

    let access_request = AccessRequest {
        claim: &claim,
        token: sp.token.as_deref(),
        headers: &headers,
        path: &path,
        magic_pass: magic_pass(query.get(PARAM_MAGIC).map(|s| s.as_str())),
        is_speech: sp.is_speech,
    };
    for check in state.access_checks.iter() {
        check.check(&access_request)?;
    }

    if !is_download && fit_for_transcoder(&path, &method, &headers, &claim) {
        if let Some(transcoder) = &state.transcoder {
            if let Some(tc_path) = transcoder.playback_path(&claim.claim_id, &claim.sd_hash).await {
                let location = playlist_url(&path, &query, &tc_path, &claim);
                return Ok(Response::builder()
                    .status(StatusCode::FOUND)
                    .header(header::LOCATION, location)
                    .body(Body::empty())
                    .unwrap());
            }
        }
    }

    let mut stream = Stream::new(claim, state.hot_cache().await?.clone(), state.stream_options())?;
    stream.prepare().await?;

    serve_stream(&state, method, &headers, is_download, stream).await
}

/// Replies to the request from the stream's seekable interface,
/// honoring `Range` per RFC 7233.
async fn serve_stream(
    state: &State,
    method: Method,
    headers: &HeaderMap,
    is_download: bool,
    mut stream: Stream,
) -> ServerResult<Response> {
    let size = stream.size;
    let mut code = StatusCode::OK;
    let mut send_size = size;
    let mut content_range = None;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    let mut ranges = parse_range(range_header, size)?;
    if sum_ranges_size(&ranges) > size {
        // More bytes requested than the stream has: probably an attack
        // or a confused client. Ignore the range request.
        ranges.clear();
    }

    if !ranges.is_empty() {
        // Single range only; a client that sends several gets the
        // first (no multipart responses).
        let ra = ranges[0];

        stream.seek(SeekFrom::Start(ra.start))?;

        if method == Method::GET {
            // Touch the first chunk so an unavailable blob turns into
            // a status code instead of a broken body.
            let first_idx = get_range(ra.start, 1).first_chunk_idx;
            stream.get_chunk(first_idx as usize).await?;
        }

        send_size = ra.length;
        code = StatusCode::PARTIAL_CONTENT;
        content_range = Some(ra.content_range(size));
    }

    let mut builder = Response::builder()
        .status(code)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, &stream.content_type)
        .header(header::CONTENT_LENGTH, send_size)
        .header(header::LAST_MODIFIED, http_date(stream.timestamp()));

    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    builder = if method == Method::HEAD {
        builder.header(header::CACHE_CONTROL, "no-store, no-cache")
    } else {
        builder.header(header::CACHE_CONTROL, "public, max-age=31536000")
    };

    if is_download {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            attachment_disposition(&stream.filename()),
        );
    }

    if method == Method::HEAD {
        return Ok(builder.body(Body::empty()).unwrap());
    }

    let deadline = Instant::now() + state.config.stream_write_timeout;
    let body = stream_body(stream, send_size, state.clone(), deadline);

    Ok(builder.body(body).unwrap())
}

/// The streaming response body: reads from the stream in buffer-sized
/// steps, pacing through the global throttle and aborting past the
/// write deadline.
fn stream_body(mut stream: Stream, length: u64, state: State, deadline: Instant) -> Body {
    let s = stream! {
        let mut remaining = length;
        let mut buf = vec![0u8; READ_BUF_SIZE];

        while remaining > 0 {
            if Instant::now() >= deadline {
                yield Err(IoError::new(
                    IoErrorKind::TimedOut,
                    "stream write timeout reached",
                ));
                return;
            }

            let want = remaining.min(buf.len() as u64) as usize;
            let n = match stream.read(&mut buf[..want]).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("stream read failed mid-body: {e}");
                    yield Err(IoError::new(IoErrorKind::Other, e.to_string()));
                    return;
                }
            };

            if state.throttle.is_enabled() {
                state.throttle.acquire(n).await;
            }

            yield Ok(Bytes::copy_from_slice(&buf[..n]));
            remaining -= n as u64;
        }
    };

    Body::from_stream(s)
}

/// Builds the attachment `Content-Disposition` with a sanitized file
/// name.
fn attachment_disposition(filename: &str) -> String {
    let sanitized = FILENAME_SANITIZER.replace_all(filename, "");
    let encoded = utf8_percent_encode(&sanitized, PATH_ESCAPE);

    format!(r#"attachment; filename="{sanitized}"; filename*=UTF-8''{encoded}"#)
}

/// Whether this request should be redirected to transcoded HLS
/// playback instead of streaming the original.
///
/// v5-start and v6 clients probe with HEAD before choosing HLS, so
/// those shapes may redirect on HEAD; v1-v4 HEAD never does.
fn fit_for_transcoder(path: &str, method: &Method, headers: &HeaderMap, claim: &Claim) -> bool {
    if headers.contains_key(header::RANGE) {
        return false;
    }
    if !claim.content_type.starts_with("video/") {
        return false;
    }

    path.starts_with("/api/v4/")
        || ((path.starts_with("/v5/streams/start/") || path.starts_with("/v6/streams/"))
            && method == Method::HEAD)
}

/// Builds the redirect target for a transcoded stream.
fn playlist_url(
    path: &str,
    query: &HashMap<String, String>,
    tc_path: &str,
    claim: &Claim,
) -> String {
    if path.starts_with("/v5/streams/start/") {
        match (query.get(PARAM_CLIENT_IP), query.get(PARAM_HASH_HLS)) {
            (Some(ip), Some(hash)) if !hash.is_empty() => {
                format!("/v5/streams/hls/{tc_path}?ip={ip}&hash={hash}")
            }
            _ => format!("/v5/streams/hls/{tc_path}"),
        }
    } else if path.starts_with("/v6/streams/") {
        match query.get(PARAM_HASH77) {
            Some(hash) if !hash.is_empty() => format!("/{hash}/v6/streams/{tc_path}"),
            _ => format!("/v6/streams/{tc_path}"),
        }
    } else {
        format!("/api/v4/streams/tc/{}/{}", claim.name, tc_path)
    }
}

/// Best client address guess: forwarding headers first, then the
/// connection peer.
fn client_ip(headers: &HeaderMap, client_addr: SocketAddr) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    if let Some(ip) = forwarded {
        return ip;
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<IpAddr>().ok())
        .unwrap_or_else(|| client_addr.ip())
}

fn truthy(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "true" | "TRUE" | "True")
}

fn http_date(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

use super::*;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::Request;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use http_body_util::BodyExt;
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sea_orm::Database;
use tower::ServiceExt;

use crate::config::Config;
use crate::database::migration::{Migrator, MigratorTrait};
use crate::hot_cache::HotCache;
use crate::store::{DecryptedStore, StoreOptions};
use crate::testing::{FixtureStream, MemoryOrigin, StaticResolver};
use crate::StateInner;
use strand_token::{expiry_for_size, TokenSigner};

const STREAM_LEN: usize = 100_000;

fn claim_id() -> String {
    "d".repeat(40)
}

struct TestServer {
    router: Router,
    origin: Arc<MemoryOrigin>,
    fixture: FixtureStream,
    _dir: tempfile::TempDir,
}

/// Extra TOML appended to the base test configuration.
async fn test_server(fee_amount: f64, extra_config: &str) -> TestServer {
    let dir = tempfile::tempdir().unwrap();

    let origin = Arc::new(MemoryOrigin::new());
    let plaintext: Vec<u8> = (0..STREAM_LEN).map(|i| (i % 251) as u8).collect();
    let fixture = FixtureStream::publish(&origin, plaintext, strand::blob::CHUNK_SIZE);

    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    let store = DecryptedStore::open(
        StoreOptions {
            path: dir.path().join("cache"),
            max_bytes: 1024 * 1024 * 1024,
            high_watermark: 0.9,
            low_watermark: 0.8,
            interval: Duration::from_secs(60),
        },
        origin.clone(),
        db,
    )
    .await
    .unwrap();
    let hot_cache = Arc::new(HotCache::new(Arc::new(store), 64 * 1024 * 1024));

    let resolver = StaticResolver::new();
    let claim = crate::resolver::Claim {
        claim_id: claim_id(),
        name: "fixture".to_string(),
        sd_hash: fixture.sd_hash.as_str().to_owned(),
        content_type: "video/mp4".to_string(),
        size: STREAM_LEN as u64,
        release_time: 1_600_000_000,
        fee_amount,
        ..Default::default()
    };
    resolver.insert(format!("fixture#{}", claim_id()), claim.clone());
    resolver.insert(claim_id(), claim);

    // Top-level keys in `extra_config` must precede the tables
    let config: Config = toml::from_str(&format!(
        r#"
        {extra_config}

        [resolver]
        url = "http://localhost:5279"

        [origin]
        endpoint = "http://localhost:5567/"

        [disk-cache]
        path = "{}"
        max-bytes = 1000000000

        [throttle]
        enabled = false

        [firewall]
        blacklist-path = "{}"
        "#,
        dir.path().join("cache").display(),
        dir.path().join("blacklist.json").display(),
    ))
    .unwrap();

    let state = StateInner::with_collaborators(config, Arc::new(resolver), hot_cache).unwrap();

    let router = Router::new()
        .merge(get_router())
        .layer(axum::middleware::from_fn(apply_default_headers))
        .layer(Extension(state))
        .layer(MockConnectInfo("127.0.0.1:34567".parse::<SocketAddr>().unwrap()));

    TestServer {
        router,
        origin,
        fixture,
        _dir: dir,
    }
}

fn paid_test_key() -> (TokenSigner, String) {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap();
    let public_pem = public_key.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap();

    (
        TokenSigner::from_private_key_pem(private_pem.as_bytes()).unwrap(),
        BASE64_STANDARD.encode(public_pem.as_bytes()),
    )
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

#[tokio::test]
async fn test_full_stream() {
    let ts = test_server(0.0, "").await;

    let uri = format!("/api/v2/streams/free/fixture/{}", claim_id());
    let response = ts.router.clone().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["Accept-Ranges"], "bytes");
    assert_eq!(response.headers()["Content-Type"], "video/mp4");
    assert_eq!(
        response.headers()["Content-Length"],
        STREAM_LEN.to_string().as_str()
    );
    assert_eq!(
        response.headers()["Cache-Control"],
        "public, max-age=31536000"
    );
    assert_eq!(response.headers()["X-Powered-By"], "unknown-player");
    assert_eq!(response.headers()["Access-Control-Allow-Origin"], "*");
    assert!(response.headers().contains_key("Last-Modified"));

    let body = body_bytes(response).await;
    assert_eq!(body, ts.fixture.plaintext);
}

#[tokio::test]
async fn test_range_request() {
    let ts = test_server(0.0, "").await;

    let uri = format!("/v1/content/claims/fixture/{}/file.mp4", claim_id());
    let request = Request::builder()
        .uri(&uri)
        .header("Range", "bytes=1000-1104")
        .body(Body::empty())
        .unwrap();
    let response = ts.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()["Content-Range"],
        format!("bytes 1000-1104/{STREAM_LEN}").as_str()
    );
    assert_eq!(response.headers()["Content-Length"], "105");

    let body = body_bytes(response).await;
    assert_eq!(body, &ts.fixture.plaintext[1000..1105]);
}

#[tokio::test]
async fn test_suffix_range() {
    let ts = test_server(0.0, "").await;

    let uri = format!("/api/v2/streams/free/fixture/{}", claim_id());
    let request = Request::builder()
        .uri(&uri)
        .header("Range", "bytes=-100")
        .body(Body::empty())
        .unwrap();
    let response = ts.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let body = body_bytes(response).await;
    assert_eq!(body, &ts.fixture.plaintext[STREAM_LEN - 100..]);
}

#[tokio::test]
async fn test_unsatisfiable_range() {
    let ts = test_server(0.0, "").await;

    let uri = format!("/api/v2/streams/free/fixture/{}", claim_id());
    let request = Request::builder()
        .uri(&uri)
        .header("Range", "bytes=999999999-")
        .body(Body::empty())
        .unwrap();
    let response = ts.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        response.headers()["Content-Range"],
        format!("bytes */{STREAM_LEN}").as_str()
    );
}

#[tokio::test]
async fn test_head_never_touches_chunks() {
    let ts = test_server(0.0, "").await;

    let uri = format!("/v6/streams/{}/{}.mp4", claim_id(), ts.fixture.sd_hash);
    let request = Request::builder()
        .method("HEAD")
        .uri(&uri)
        .body(Body::empty())
        .unwrap();
    let response = ts.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["Content-Length"],
        STREAM_LEN.to_string().as_str()
    );
    assert_eq!(response.headers()["Content-Type"], "video/mp4");
    assert_eq!(response.headers()["Cache-Control"], "no-store, no-cache");

    // Only the descriptor came over the wire
    assert_eq!(ts.origin.get_count(), 1);

    let body = body_bytes(response).await;
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_paid_stream_without_token() {
    let (_signer, pubkey_b64) = paid_test_key();
    let config = format!("[paid]\ntoken-pubkey-pem-base64 = \"{pubkey_b64}\"");
    let ts = test_server(1.0, &config).await;

    let uri = format!("/api/v2/streams/free/fixture/{}", claim_id());
    let response = ts.router.clone().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body_bytes(response).await, b"paid stream");
}

#[tokio::test]
async fn test_paid_stream_with_expired_token() {
    let (signer, pubkey_b64) = paid_test_key();
    let config = format!("[paid]\ntoken-pubkey-pem-base64 = \"{pubkey_b64}\"");
    let ts = test_server(1.0, &config).await;

    let stream_id = format!("fixture/{}", claim_id());
    let expired = chrono::Utc::now() - chrono::Duration::hours(2);
    let token = signer.create_token(&stream_id, "txid", expired).unwrap();

    let uri = format!("/api/v2/streams/paid/fixture/{}/{token}", claim_id());
    let response = ts.router.clone().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::GONE);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("token is expired"), "body: {body}");
}

#[tokio::test]
async fn test_paid_stream_with_valid_token() {
    let (signer, pubkey_b64) = paid_test_key();
    let config = format!("[paid]\ntoken-pubkey-pem-base64 = \"{pubkey_b64}\"");
    let ts = test_server(1.0, &config).await;

    let stream_id = format!("fixture/{}", claim_id());
    let token = signer
        .create_token(&stream_id, "txid", expiry_for_size(STREAM_LEN as u64))
        .unwrap();

    let uri = format!("/api/v2/streams/paid/fixture/{}/{token}", claim_id());
    let response = ts.router.clone().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_download_disposition() {
    let ts = test_server(0.0, "").await;

    let uri = format!(
        "/api/v2/streams/free/fixture/{}?download=true",
        claim_id()
    );
    let response = ts.router.clone().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response.headers()["Content-Disposition"].to_str().unwrap();
    assert_eq!(
        disposition,
        r#"attachment; filename="fixture.mp4"; filename*=UTF-8''fixture.mp4"#
    );
}

#[tokio::test]
async fn test_downloads_can_be_disabled() {
    let ts = test_server(0.0, "downloads-enabled = false").await;

    let uri = format!(
        "/api/v2/streams/free/fixture/{}?download=true",
        claim_id()
    );
    let response = ts.router.clone().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unknown_claim() {
    let ts = test_server(0.0, "").await;

    let uri = format!("/api/v2/streams/free/nosuch/{}", "9".repeat(40));
    let response = ts.router.clone().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_blocked_content() {
    let blocked = format!("[firewall]\nblocked-content = [\"{}\"]", claim_id());

    // The firewall section appears twice otherwise
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(MemoryOrigin::new());
    let fixture = FixtureStream::publish(&origin, vec![0u8; 64], strand::blob::CHUNK_SIZE);

    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    let store = DecryptedStore::open(
        StoreOptions {
            path: dir.path().join("cache"),
            max_bytes: 1024 * 1024,
            high_watermark: 0.9,
            low_watermark: 0.8,
            interval: Duration::from_secs(60),
        },
        origin,
        db,
    )
    .await
    .unwrap();
    let hot_cache = Arc::new(HotCache::new(Arc::new(store), 1024 * 1024));

    let resolver = StaticResolver::new();
    resolver.insert(
        format!("fixture#{}", claim_id()),
        crate::resolver::Claim {
            claim_id: claim_id(),
            name: "fixture".to_string(),
            sd_hash: fixture.sd_hash.as_str().to_owned(),
            content_type: "video/mp4".to_string(),
            size: 64,
            ..Default::default()
        },
    );

    let config: Config = toml::from_str(&format!(
        r#"
        [resolver]
        url = "http://localhost:5279"

        [origin]
        endpoint = "http://localhost:5567/"

        [disk-cache]
        path = "{}"
        max-bytes = 1000000

        {blocked}
        "#,
        dir.path().join("cache").display(),
    ))
    .unwrap();

    let state = StateInner::with_collaborators(config, Arc::new(resolver), hot_cache).unwrap();
    let router = Router::new()
        .merge(get_router())
        .layer(axum::middleware::from_fn(apply_default_headers))
        .layer(Extension(state))
        .layer(MockConnectInfo("127.0.0.1:34567".parse::<SocketAddr>().unwrap()));

    let uri = format!("/api/v2/streams/free/fixture/{}", claim_id());
    let response = router.oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_speech_shortlink() {
    let ts = test_server(0.0, "").await;

    // The resolver knows the bare claim id; speech trims the extension
    let uri = format!("/speech/{}.mp4", claim_id());
    let response = ts.router.clone().oneshot(get(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[test]
fn test_http_date() {
    use chrono::TimeZone;

    let ts = chrono::Utc.timestamp_opt(784111777, 0).unwrap();
    assert_eq!(http_date(ts), "Sun, 06 Nov 1994 08:49:37 GMT");
}

#[test]
fn test_attachment_disposition() {
    assert_eq!(
        attachment_disposition("My Video (final).mp4"),
        r#"attachment; filename="My Video final.mp4"; filename*=UTF-8''My%20Video%20final.mp4"#
    );

    // Unicode letters survive sanitisation
    let disposition = attachment_disposition("Видео®.mp4");
    assert!(disposition.contains(r#"filename="Видео.mp4""#));
}

#[test]
fn test_truthy() {
    assert!(truthy("1"));
    assert!(truthy("true"));
    assert!(!truthy("0"));
    assert!(!truthy("yes"));
}

#[test]
fn test_fit_for_transcoder() {
    let mut claim = crate::resolver::Claim {
        content_type: "video/mp4".to_string(),
        ..Default::default()
    };
    let headers = HeaderMap::new();

    assert!(fit_for_transcoder(
        "/api/v4/streams/free/n/c/s",
        &Method::GET,
        &headers,
        &claim
    ));
    assert!(fit_for_transcoder(
        "/v6/streams/c/s",
        &Method::HEAD,
        &headers,
        &claim
    ));
    assert!(!fit_for_transcoder(
        "/v6/streams/c/s",
        &Method::GET,
        &headers,
        &claim
    ));
    assert!(!fit_for_transcoder(
        "/api/v2/streams/free/n/c",
        &Method::GET,
        &headers,
        &claim
    ));

    // Range requests always stream the original
    let mut ranged = HeaderMap::new();
    ranged.insert(header::RANGE, "bytes=0-1".parse().unwrap());
    assert!(!fit_for_transcoder(
        "/api/v4/streams/free/n/c/s",
        &Method::GET,
        &ranged,
        &claim
    ));

    claim.content_type = "audio/mpeg".to_string();
    assert!(!fit_for_transcoder(
        "/api/v4/streams/free/n/c/s",
        &Method::GET,
        &headers,
        &claim
    ));
}

#[test]
fn test_playlist_url_shapes() {
    let claim = crate::resolver::Claim {
        name: "video".to_string(),
        ..Default::default()
    };

    let empty = std::collections::HashMap::new();
    assert_eq!(
        playlist_url("/v5/streams/start/c/s", &empty, "tc/abc", &claim),
        "/v5/streams/hls/tc/abc"
    );
    assert_eq!(
        playlist_url("/v6/streams/c/s", &empty, "tc/abc", &claim),
        "/v6/streams/tc/abc"
    );
    assert_eq!(
        playlist_url("/api/v4/streams/free/n/c/s", &empty, "tc/abc", &claim),
        "/api/v4/streams/tc/video/tc/abc"
    );

    let mut signed = std::collections::HashMap::new();
    signed.insert(PARAM_CLIENT_IP.to_string(), "1.2.3.4".to_string());
    signed.insert(PARAM_HASH_HLS.to_string(), "sig".to_string());
    assert_eq!(
        playlist_url("/v5/streams/start/c/s", &signed, "tc/abc", &claim),
        "/v5/streams/hls/tc/abc?ip=1.2.3.4&hash=sig"
    );
}

#[test]
fn test_client_ip_prefers_forwarded() {
    let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
    assert_eq!(
        client_ip(&headers, addr),
        "203.0.113.9".parse::<std::net::IpAddr>().unwrap()
    );

    let headers = HeaderMap::new();
    assert_eq!(client_ip(&headers, addr), addr.ip());
}

#[tokio::test]
async fn test_admin_throttle_requires_auth() {
    let admin = "[admin]\nusername = \"op\"\npassword = \"hunter2\"";
    let ts = test_server(0.0, admin).await;

    let request = Request::builder()
        .method("POST")
        .uri("/config/throttle?enabled=false")
        .body(Body::empty())
        .unwrap();
    let response = ts.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let credentials = BASE64_STANDARD.encode("op:hunter2");
    let request = Request::builder()
        .method("POST")
        .uri("/config/throttle?enabled=false&scale=2.5")
        .header("Authorization", format!("Basic {credentials}"))
        .body(Body::empty())
        .unwrap();
    let response = ts.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let credentials = BASE64_STANDARD.encode("op:wrong");
    let request = Request::builder()
        .method("POST")
        .uri("/config/throttle?enabled=false")
        .header("Authorization", format!("Basic {credentials}"))
        .body(Body::empty())
        .unwrap();
    let response = ts.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

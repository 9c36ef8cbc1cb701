#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

//! The strand media streaming edge server.
//!
//! Serves encrypted, content-addressed blob streams as byte-rangeable
//! HTTP media. Stream chunks are pulled from an upstream origin,
//! decrypted and held in a two-tier cache (memory over disk); the HTTP
//! layer maps RFC 7233 range requests onto the chunk arithmetic so
//! browsers can scrub video.

pub mod access;
pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod firewall;
pub mod hot_cache;
pub mod origin;
pub mod resolver;
pub mod single_flight;
pub mod store;
pub mod stream;
pub mod testing;
pub mod throttle;
pub mod transcoder;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{extract::Extension, http::Uri, Router};
use reqwest::Url;
use sea_orm::{Database, DatabaseConnection};
use tokio::net::TcpListener;
use tokio::sync::{Notify, OnceCell};
use tokio::time;
use tower_http::catch_panic::CatchPanicLayer;

use access::{AccessCheck, EdgeAccess, HotlinkAccess, PaidAccess};
use config::Config;
use database::migration::{Migrator, MigratorTrait};
use error::{ServerError, ServerResult};
use firewall::{Firewall, NoAsnResolver};
use hot_cache::HotCache;
use origin::HttpOrigin;
use resolver::{JsonRpcResolver, Resolver};
use store::{DecryptedStore, StoreOptions};
use stream::StreamOptions;
use strand_token::TokenVerifier;
use throttle::Throttle;
use transcoder::{HttpTranscoderClient, TranscoderClient};

pub type State = Arc<StateInner>;

/// Global server state.
pub struct StateInner {
    /// The server configuration.
    pub config: Config,

    /// Handle to the catalog database.
    database: OnceCell<DatabaseConnection>,

    /// The disk cache tier.
    store: OnceCell<Arc<DecryptedStore>>,

    /// The memory cache tier.
    hot_cache: OnceCell<Arc<HotCache>>,

    /// The claim resolver.
    pub resolver: Arc<dyn Resolver>,

    /// Ban lists and rate limits.
    pub firewall: Arc<Firewall>,

    /// The global outgoing throttle.
    pub throttle: Arc<Throttle>,

    /// Transcoded-HLS lookups, when configured.
    pub transcoder: Option<Arc<dyn TranscoderClient>>,

    /// Ordered access predicates applied before streaming.
    pub access_checks: Vec<Box<dyn AccessCheck>>,
}

impl StateInner {
    pub async fn new(config: Config) -> Result<State> {
        let resolver = Arc::new(JsonRpcResolver::new(
            Url::parse(&config.resolver.url)?,
            config.resolver.timeout,
        )?);

        let transcoder: Option<Arc<dyn TranscoderClient>> = match &config.transcoder {
            Some(tc) => Some(Arc::new(HttpTranscoderClient::new(
                Url::parse(&tc.endpoint)?,
                tc.timeout,
            )?)),
            None => None,
        };

        Self::assemble(config, resolver, transcoder, None)
    }

    /// Builds a state around injected collaborators, leaving the disk
    /// tier untouched. Test plumbing.
    #[cfg(test)]
    pub(crate) fn with_collaborators(
        config: Config,
        resolver: Arc<dyn Resolver>,
        hot_cache: Arc<HotCache>,
    ) -> Result<State> {
        Self::assemble(config, resolver, None, Some(hot_cache))
    }

    fn assemble(
        config: Config,
        resolver: Arc<dyn Resolver>,
        transcoder: Option<Arc<dyn TranscoderClient>>,
        hot_cache: Option<Arc<HotCache>>,
    ) -> Result<State> {
        let firewall = Arc::new(Firewall::new(
            config.firewall.blacklist_path.clone(),
            config.firewall.whitelist.clone(),
            Box::new(NoAsnResolver),
        ));
        firewall.set_blocked_content(config.firewall.blocked_content.iter().cloned());

        let throttle = Arc::new(Throttle::new(
            config.throttle.enabled,
            config.throttle.scale,
        ));

        let paid_verifier = match config.paid.pubkey_pem()? {
            Some(pem) => Some(TokenVerifier::from_public_key_pem(&pem)?),
            None => None,
        };

        let access_checks: Vec<Box<dyn AccessCheck>> = vec![
            Box::new(PaidAccess::new(paid_verifier)),
            Box::new(EdgeAccess::new(config.edge_token.clone())),
            Box::new(HotlinkAccess::new(config.hotlink.clone().into())),
        ];

        Ok(Arc::new(Self {
            config,
            database: OnceCell::new(),
            store: OnceCell::new(),
            hot_cache: OnceCell::new_with(hot_cache),
            resolver,
            firewall,
            throttle,
            transcoder,
            access_checks,
        }))
    }

    /// Returns a handle to the catalog database.
    async fn database(&self) -> ServerResult<&DatabaseConnection> {
        self.database
            .get_or_try_init(|| async {
                let db = Database::connect(self.config.disk_cache.effective_database_url())
                    .await
                    .map_err(ServerError::database_error)?;

                // The catalog is private to this server; keeping it
                // migrated on open is safe.
                Migrator::up(&db, None)
                    .await
                    .map_err(ServerError::database_error)?;

                Ok(db)
            })
            .await
    }

    /// Returns a handle to the disk cache tier.
    pub async fn store(&self) -> ServerResult<&Arc<DecryptedStore>> {
        let db = self.database().await?.clone();

        self.store
            .get_or_try_init(|| async {
                let origin = HttpOrigin::new(
                    Url::parse(&self.config.origin.endpoint)
                        .map_err(ServerError::request_error)?,
                    self.config.origin.timeout,
                )?;

                let store = DecryptedStore::open(
                    StoreOptions {
                        path: self.config.disk_cache.path.clone(),
                        max_bytes: self.config.disk_cache.max_bytes,
                        high_watermark: self.config.disk_cache.high_watermark,
                        low_watermark: self.config.disk_cache.low_watermark,
                        interval: self.config.disk_cache.reap_interval,
                    },
                    Arc::new(origin),
                    db,
                )
                .await?;

                Ok(Arc::new(store))
            })
            .await
    }

    /// Returns a handle to the memory cache tier.
    pub async fn hot_cache(&self) -> ServerResult<&Arc<HotCache>> {
        if let Some(hot_cache) = self.hot_cache.get() {
            return Ok(hot_cache);
        }

        let store = self.store().await?.clone();

        self.hot_cache
            .get_or_try_init(|| async {
                Ok(Arc::new(HotCache::new(
                    store,
                    self.config.hot_cache.max_bytes,
                )))
            })
            .await
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            prefetch: self.config.prefetch.enabled,
            prefetch_count: self.config.prefetch.count,
        }
    }
}

/// The fallback route.
async fn fallback(_: Uri) -> ServerResult<()> {
    Err(ServerError::NotFound)
}

/// Runs the API server until a shutdown signal arrives.
pub async fn run_api_server(cli_listen: Option<SocketAddr>, config: Config) -> Result<()> {
    eprintln!("Starting API server...");

    let state = StateInner::new(config).await?;

    let listen = cli_listen.unwrap_or(state.config.listen);

    // Open the cache chain up front so startup failures are loud.
    // The reaper runs as its own component (see `run_reaper`).
    let store = state.store().await?.clone();

    let rest = Router::new()
        .merge(api::get_router())
        .fallback(fallback)
        // middlewares
        .layer(axum::middleware::from_fn(api::apply_default_headers))
        .layer(Extension(state.clone()))
        .layer(CatchPanicLayer::new());

    eprintln!("Listening on {listen:?}...");
    let listener = TcpListener::bind(&listen).await?;

    let shutdown = Arc::new(Notify::new());
    let server = axum::serve(
        listener,
        rest.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.notify_waiters();
        }
    });

    let stop_wait = state.config.stop_wait;
    tokio::select! {
        ret = server => ret?,
        _ = async {
            shutdown.notified().await;
            time::sleep(stop_wait).await;
        } => {
            tracing::warn!("graceful shutdown timed out, dropping open connections");
        }
    }

    store.shutdown().await;

    Ok(())
}

/// Runs catalog migrations.
pub async fn run_migrations(config: Config) -> Result<()> {
    eprintln!("Running migrations...");

    let state = StateInner::new(config).await?;
    state.database().await?;

    Ok(())
}

/// Runs the disk-cache reaper on its interval, standalone.
pub async fn run_reaper(config: Config) -> Result<()> {
    let state = StateInner::new(config).await?;
    let store = state.store().await?.clone();

    store.run_reaper().await;

    Ok(())
}

/// Runs one reaper pass, then exits.
pub async fn run_reaper_once(config: Config) -> Result<()> {
    let state = StateInner::new(config).await?;
    let store = state.store().await?;

    store.run_reaper_once().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("caught a signal, shutting down http server...");
}

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use strand_server::config;

/// Media streaming edge server.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// Socket address to listen on.
    ///
    /// This overrides `listen` in the config.
    #[clap(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// Mode to run.
    #[clap(long, default_value = "monolithic")]
    mode: ServerMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServerMode {
    /// Run all components.
    Monolithic,

    /// Run the API server.
    ApiServer,

    /// Run the disk-cache reaper periodically.
    Reaper,

    /// Run one reaper pass then exit.
    ReaperOnce,

    /// Run the catalog migrations then exit.
    DbMigrations,

    /// Check the configuration then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    dump_version();

    let opts = Opts::parse();
    let config = config::load_config(opts.config.as_deref())?;

    match opts.mode {
        ServerMode::Monolithic => {
            strand_server::run_migrations(config.clone()).await?;

            // The reaper never returns on its own; the server decides
            // when the process is done.
            tokio::select! {
                ret = strand_server::run_api_server(opts.listen, config.clone()) => ret?,
                ret = strand_server::run_reaper(config.clone()) => ret?,
            }
        }
        ServerMode::ApiServer => {
            strand_server::run_api_server(opts.listen, config).await?;
        }
        ServerMode::Reaper => {
            strand_server::run_reaper(config).await?;
        }
        ServerMode::ReaperOnce => {
            strand_server::run_reaper_once(config).await?;
        }
        ServerMode::DbMigrations => {
            strand_server::run_migrations(config).await?;
        }
        ServerMode::CheckConfig => {
            // config is valid, let's just exit :)
        }
    }

    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt::init();
}

fn dump_version() {
    #[cfg(debug_assertions)]
    eprintln!("strand server {} (debug)", env!("CARGO_PKG_VERSION"));

    #[cfg(not(debug_assertions))]
    eprintln!("strand server {} (release)", env!("CARGO_PKG_VERSION"));
}

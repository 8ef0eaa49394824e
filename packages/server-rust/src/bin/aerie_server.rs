//! Aerie persistence node.
//!
//! Opens the configured backend, starts the flush and purge timers, and runs
//! until Ctrl-C, then flushes everything still pending before exiting.

use std::path::PathBuf;

use aerie_server::{BackendConfig, PersistenceLayer};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    #[cfg(feature = "redb")]
    Redb,
    #[cfg(feature = "postgres")]
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "aerie-server")]
#[command(about = "Aerie pub-sub persistence node")]
struct Args {
    /// Storage backend.
    #[arg(long, env = "AERIE_BACKEND", value_enum, default_value = "memory")]
    backend: Backend,

    /// Database file for the redb backend.
    #[cfg_attr(not(feature = "redb"), allow(dead_code))]
    #[arg(long, env = "AERIE_DATA_PATH", default_value = "aerie.redb")]
    data_path: PathBuf,

    /// Connection URL for the postgres backend.
    #[cfg_attr(not(feature = "postgres"), allow(dead_code))]
    #[arg(long, env = "AERIE_DATABASE_URL")]
    database_url: Option<String>,

    /// Log output format.
    #[arg(long, env = "AERIE_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

impl Args {
    fn backend_config(&self) -> anyhow::Result<BackendConfig> {
        Ok(match self.backend {
            Backend::Memory => BackendConfig::Memory,
            #[cfg(feature = "redb")]
            Backend::Redb => BackendConfig::Redb {
                path: self.data_path.clone(),
            },
            #[cfg(feature = "postgres")]
            Backend::Postgres => BackendConfig::Postgres {
                url: self
                    .database_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--database-url is required for postgres"))?,
            },
        })
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,aerie_server=debug"));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let backend = args.backend_config()?;
    let layer = PersistenceLayer::open(&backend).await?;
    layer.start();
    info!(backend = backend.kind(), "aerie-server running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    layer.shutdown().await?;
    info!("aerie-server stopped");
    Ok(())
}

//! CLI entry point for mail-ingest.

use clap::{Parser, ValueEnum};
use mail_ingest::{
    start_server, Backend, MemoryStore, Pool, PoolConfig, ServerOptions, ShutdownOutcome,
    SqliteStore,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "mail-ingest", version)]
#[command(about = "Accept email submissions over HTTP and store them")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "MAIL_INGEST_LISTEN", default_value = "127.0.0.1:8025")]
    listen: SocketAddr,

    /// Bearer token callers must present
    #[arg(long, env = "MAIL_INGEST_AUTH_TOKEN", hide_env_values = true)]
    auth_token: String,

    /// Sustained request rate; 0 disables limiting
    #[arg(long, env = "MAIL_INGEST_RATE_PER_MINUTE", default_value = "600")]
    rate_per_minute: u32,

    /// Requests allowed in a burst
    #[arg(long, env = "MAIL_INGEST_BURST", default_value = "50")]
    burst: u32,

    /// Per-request processing deadline
    #[arg(long, env = "MAIL_INGEST_REQUEST_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    request_timeout: Duration,

    /// How long to wait for in-flight requests on shutdown
    #[arg(long, env = "MAIL_INGEST_SHUTDOWN_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    shutdown_timeout: Duration,

    #[arg(long, env = "MAIL_INGEST_STORAGE", value_enum, default_value = "memory")]
    storage: StorageKind,

    /// Database file for sqlite storage
    #[arg(long, env = "MAIL_INGEST_SQLITE_PATH", default_value = "mail-ingest.db")]
    sqlite_path: PathBuf,

    /// Max number of emails to keep with memory storage
    #[arg(long, env = "MAIL_INGEST_MEMORY_CAPACITY", default_value = "10000")]
    memory_capacity: usize,

    /// Max storage handles open at once
    #[arg(long, env = "MAIL_INGEST_POOL_MAX_SIZE", default_value = "100")]
    pool_max_size: usize,

    /// Max idle storage handles kept open
    #[arg(long, env = "MAIL_INGEST_POOL_MAX_IDLE", default_value = "10")]
    pool_max_idle: usize,

    /// How long a request waits for a storage handle
    #[arg(long, env = "MAIL_INGEST_POOL_ACQUIRE_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pool_acquire_timeout: Duration,

    #[arg(long, env = "MAIL_INGEST_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn server_options(&self) -> ServerOptions {
        ServerOptions {
            listen: self.listen,
            auth_token: self.auth_token.clone(),
            rate_per_minute: self.rate_per_minute,
            burst: self.burst,
            request_timeout: self.request_timeout,
            shutdown_timeout: self.shutdown_timeout,
            ..ServerOptions::default()
        }
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_max_size,
            max_idle: self.pool_max_idle,
            acquire_timeout: self.pool_acquire_timeout,
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

async fn serve<B: Backend>(cli: &Cli, pool: Pool<B>) -> mail_ingest::Result<()> {
    let server = start_server(cli.server_options(), pool).await?;

    wait_for_signal().await?;
    tracing::info!("shutdown requested");

    match server.shutdown().await {
        ShutdownOutcome::Clean => Ok(()),
        ShutdownOutcome::Forced { remaining } => {
            tracing::error!("forced shutdown with {remaining} requests still in flight");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> mail_ingest::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.storage {
        StorageKind::Memory => {
            let store = MemoryStore::new(cli.memory_capacity);
            let pool = Pool::new(cli.pool_config(), move || Ok(store.backend()));
            serve(&cli, pool).await
        }
        StorageKind::Sqlite => {
            let store = SqliteStore::open(&cli.sqlite_path)?;
            tracing::info!("storing emails in {}", cli.sqlite_path.display());
            let pool = Pool::new(cli.pool_config(), move || store.backend());
            serve(&cli, pool).await
        }
    }
}

//! HTTP email ingestion: normalize submissions and hand them to a pooled store.

mod email;
mod error;
mod http;
mod lifecycle;
mod metrics;
pub mod normalize;
pub mod pool;
mod ratelimit;
mod sqlite_store;
mod store;

pub use email::{
    AuthenticationMetadata, ConnectionInfo, DkimInfo, DmarcInfo, EmailRecord, SpfInfo,
};
pub use error::{ApiError, Error, Result};
pub use http::MAX_BODY_BYTES;
pub use lifecycle::{Lifecycle, Phase, ShutdownOutcome};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::{Pool, PoolConfig, PoolError, PoolStats, PooledHandle};
pub use ratelimit::RateLimiter;
pub use sqlite_store::{SqliteBackend, SqliteStore};
pub use store::{location_for, Backend, ListFilter, MemoryBackend, MemoryStore, StorageError};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Configuration options for the ingestion server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen: SocketAddr,
    /// Shared secret expected in `Authorization: Bearer <token>`.
    pub auth_token: String,
    /// Token refill rate; zero disables limiting.
    pub rate_per_minute: u32,
    pub burst: u32,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// How often the drain monitor logs the in-flight count.
    pub drain_report_interval: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8025)),
            auth_token: String::new(),
            rate_per_minute: 600,
            burst: 50,
            request_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            drain_report_interval: Duration::from_secs(5),
        }
    }
}

/// Running server handle.
pub struct RunningServer {
    pub addr: SocketAddr,
    lifecycle: Arc<Lifecycle>,
    metrics: Arc<Metrics>,
    handle: tokio::task::JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    abandon_tx: watch::Sender<bool>,
    close_pool: Box<dyn FnOnce() + Send>,
    shutdown_timeout: Duration,
    drain_report_interval: Duration,
}

impl RunningServer {
    #[must_use]
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Drain and stop.
    ///
    /// New requests get 503 immediately. Admitted requests get up to
    /// `shutdown_timeout` to finish; after that the server task is aborted
    /// and the number still running is returned.
    pub async fn shutdown(self) -> ShutdownOutcome {
        self.lifecycle.begin_drain();
        tracing::info!(
            in_flight = self.lifecycle.in_flight(),
            "draining, refusing new requests"
        );

        let outcome = self
            .lifecycle
            .wait_idle(self.shutdown_timeout, self.drain_report_interval)
            .await;

        match outcome {
            ShutdownOutcome::Clean => {
                let _ = self.stop_tx.send(true);
                let mut handle = self.handle;
                if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                    .await
                    .is_err()
                {
                    tracing::warn!("HTTP server did not stop in time, aborting");
                    handle.abort();
                }
                tracing::info!("shutdown complete");
            }
            ShutdownOutcome::Forced { remaining } => {
                tracing::warn!(remaining, "shutdown deadline expired, abandoning requests");
                let _ = self.abandon_tx.send(true);
                self.handle.abort();
                let _ = self.handle.await;
            }
        }

        (self.close_pool)();
        self.lifecycle.mark_stopped();
        outcome
    }
}

/// Start the ingestion server, storing through `pool`.
pub async fn start_server<B: Backend>(opts: ServerOptions, pool: Pool<B>) -> Result<RunningServer> {
    if opts.auth_token.is_empty() {
        return Err(Error::Config("auth token must not be empty".to_string()));
    }

    let lifecycle = Lifecycle::new();
    let metrics = Arc::new(Metrics::new()?);
    let limiter = RateLimiter::new(opts.rate_per_minute, opts.burst).map(Arc::new);
    if limiter.is_none() {
        tracing::info!("rate limiting disabled");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let (abandon_tx, abandon_rx) = watch::channel(false);

    let listener = TcpListener::bind(opts.listen).await?;
    let addr = listener.local_addr()?;
    tracing::info!("HTTP server listening on {addr}, submissions at /mail/inbound");

    let state = http::AppState {
        pool: pool.clone(),
        lifecycle: Arc::clone(&lifecycle),
        metrics: Arc::clone(&metrics),
        limiter,
        auth_token: Arc::from(opts.auth_token.as_str()),
        request_timeout: opts.request_timeout,
        abandon: abandon_rx,
    };

    let handle = tokio::spawn(async move {
        http::run_http_server(listener, state, stop_rx).await;
    });

    Ok(RunningServer {
        addr,
        lifecycle,
        metrics,
        handle,
        stop_tx,
        abandon_tx,
        close_pool: Box::new(move || pool.close()),
        shutdown_timeout: opts.shutdown_timeout,
        drain_report_interval: opts.drain_report_interval,
    })
}

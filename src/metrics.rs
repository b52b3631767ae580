//! Request counters and the JSON / Prometheus metric views.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Outcome classification attached to a response as an extension so the
/// outermost layer can label the request counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome(pub &'static str);

impl Outcome {
    pub const SUCCESS: Self = Self("success");

    /// Fallback for responses that didn't set an outcome themselves.
    #[must_use]
    pub fn from_status(status: axum::http::StatusCode) -> Self {
        if status.is_success() {
            Self::SUCCESS
        } else if status.is_client_error() {
            Self("client_error")
        } else {
            Self("server_error")
        }
    }
}

/// Snapshot served from `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_emails: u64,
    pub total_bytes: u64,
    pub last_received: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub start_time: DateTime<Utc>,
}

/// Per-server metrics. Each server owns its own registry so several can
/// run in one process.
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: Histogram,
    body_size: Histogram,
    in_flight: IntGauge,
    total_emails: AtomicU64,
    total_bytes: AtomicU64,
    last_received: Mutex<Option<DateTime<Utc>>>,
    start_time: DateTime<Utc>,
    started: Instant,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("mail_ingest".to_string()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "HTTP requests by outcome"),
            &["outcome"],
        )?;
        let duration = Histogram::with_opts(
            HistogramOpts::new("request_duration_seconds", "Time spent handling a request")
                .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?),
        )?;
        let body_size = Histogram::with_opts(
            HistogramOpts::new("request_body_bytes", "Declared request body size")
                .buckets(prometheus::exponential_buckets(256.0, 4.0, 10)?),
        )?;
        let in_flight = IntGauge::new("requests_in_flight", "Requests currently admitted")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(body_size.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            registry,
            requests,
            duration,
            body_size,
            in_flight,
            total_emails: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            last_received: Mutex::new(None),
            start_time: Utc::now(),
            started: Instant::now(),
        })
    }

    pub fn observe_request(&self, outcome: Outcome, elapsed: Duration, size: Option<u64>) {
        self.requests.with_label_values(&[outcome.0]).inc();
        self.duration.observe(elapsed.as_secs_f64());
        if let Some(size) = size {
            self.body_size.observe(size as f64);
        }
    }

    pub fn set_in_flight(&self, n: usize) {
        self.in_flight.set(i64::try_from(n).unwrap_or(i64::MAX));
    }

    /// Count a stored submission of `bytes` raw bytes.
    pub fn record_stored(&self, bytes: u64) {
        self.total_emails.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        *self.last_received.lock() = Some(Utc::now());
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_emails: self.total_emails.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            last_received: *self.last_received.lock(),
            uptime_seconds: self.uptime().as_secs(),
            start_time: self.start_time,
        }
    }

    /// Prometheus text exposition of this server's registry.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        prometheus::TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    #[cfg(test)]
    fn requests_with(&self, outcome: &str) -> u64 {
        self.requests.with_label_values(&[outcome]).get()
    }
}

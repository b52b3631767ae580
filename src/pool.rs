//! Bounded pool of reusable storage backend handles.
//!
//! At most `max_size` handles exist at once. Released handles are kept warm up
//! to `max_idle`; beyond that they are torn down. Acquisition is immediate when
//! a handle is idle or there is room to create one, otherwise it waits for a
//! release, bounded by `acquire_timeout` and an optional cancellation future.

use crate::store::{Backend, StorageError};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_size: usize,
    pub max_idle: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_idle: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Why an acquisition failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No handle became available within the acquire timeout
    Timeout(Duration),
    /// The caller gave up before a handle became available
    Cancelled,
    /// The pool has been closed
    Closed,
    /// The factory failed to create a new handle
    Create(StorageError),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(d) => write!(f, "timed out after {d:?} waiting for a storage handle"),
            Self::Cancelled => write!(f, "storage handle acquisition cancelled"),
            Self::Closed => write!(f, "storage pool is closed"),
            Self::Create(e) => write!(f, "failed to create storage handle: {e}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Create(e) => Some(e),
            _ => None,
        }
    }
}

/// Point-in-time view of the pool, for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub created: usize,
    pub active: usize,
    pub idle: usize,
    pub max_size: usize,
    /// Acquisitions that had to wait for a release.
    pub wait_count: u64,
    pub average_wait: Duration,
}

type Factory<B> = Box<dyn Fn() -> Result<B, StorageError> + Send + Sync>;

struct Slot<B> {
    backend: B,
    created_at: Instant,
    last_used_at: Instant,
    /// Close generation the slot was created in; stale slots are torn down.
    epoch: u64,
}

struct State<B> {
    idle: Vec<Slot<B>>,
    created: usize,
    closed: bool,
    epoch: u64,
}

struct Inner<B> {
    config: PoolConfig,
    factory: Factory<B>,
    state: Mutex<State<B>>,
    available: Notify,
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
}

/// A bounded pool of `B` handles. Cloning shares the same pool.
pub struct Pool<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for Pool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Pool<B> {
    /// Build a pool and warm it with `max_idle` handles.
    ///
    /// Factory failures during warm-up are logged and skipped so the pool can
    /// start degraded.
    pub fn new<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> Result<B, StorageError> + Send + Sync + 'static,
    {
        let max_size = config.max_size.max(1);
        let config = PoolConfig {
            max_size,
            max_idle: config.max_idle.min(max_size),
            acquire_timeout: config.acquire_timeout,
        };

        let mut idle = Vec::with_capacity(config.max_idle);
        for _ in 0..config.max_idle {
            match factory() {
                Ok(backend) => idle.push(Slot::new(backend, 0)),
                Err(e) => tracing::warn!("skipping storage handle during pool warm-up: {e}"),
            }
        }
        tracing::debug!(
            warmed = idle.len(),
            max_size = config.max_size,
            max_idle = config.max_idle,
            "storage pool ready"
        );

        let created = idle.len();
        Self {
            inner: Arc::new(Inner {
                config,
                factory: Box::new(factory),
                state: Mutex::new(State {
                    idle,
                    created,
                    closed: false,
                    epoch: 0,
                }),
                available: Notify::new(),
                wait_count: AtomicU64::new(0),
                wait_nanos: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// Acquire a handle, waiting at most `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PooledHandle<B>, PoolError> {
        self.acquire_or_cancel(std::future::pending()).await
    }

    /// Acquire a handle, giving up with [`PoolError::Cancelled`] as soon as
    /// `cancel` completes.
    pub async fn acquire_or_cancel<C>(&self, cancel: C) -> Result<PooledHandle<B>, PoolError>
    where
        C: Future<Output = ()>,
    {
        if let Some(handle) = self.try_acquire().await? {
            return Ok(handle);
        }

        let timeout = self.inner.config.acquire_timeout;
        let started = Instant::now();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(cancel);
        tokio::pin!(deadline);

        let result = loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            // Register before re-checking so a release in between is not missed
            notified.as_mut().enable();

            match self.try_acquire().await {
                Ok(Some(handle)) => break Ok(handle),
                Ok(None) => {}
                Err(e) => break Err(e),
            }

            tokio::select! {
                biased;
                () = &mut cancel => break Err(PoolError::Cancelled),
                () = &mut deadline => break Err(PoolError::Timeout(timeout)),
                () = &mut notified => {}
            }
        };

        let waited = started.elapsed();
        self.inner.wait_count.fetch_add(1, Ordering::Relaxed);
        self.inner.wait_nanos.fetch_add(
            u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        if result.is_err() {
            // We may have consumed a wake-up meant for someone still waiting
            self.inner.available.notify_one();
        }
        result
    }

    /// Take an idle handle or create one if under `max_size`.
    async fn try_acquire(&self) -> Result<Option<PooledHandle<B>>, PoolError> {
        let reservation = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(mut slot) = state.idle.pop() {
                slot.last_used_at = Instant::now();
                return Ok(Some(self.wrap(slot)));
            }
            if state.created >= self.inner.config.max_size {
                return Ok(None);
            }
            state.created += 1;
            Reservation {
                inner: Arc::clone(&self.inner),
                epoch: state.epoch,
                armed: true,
            }
        };
        self.create(reservation).await.map(Some)
    }

    /// Run the factory on the blocking pool. The reservation gives its
    /// capacity back unless creation succeeds, including when the factory
    /// panics or the caller stops waiting.
    async fn create(&self, reservation: Reservation<B>) -> Result<PooledHandle<B>, PoolError> {
        let inner = Arc::clone(&self.inner);
        match tokio::task::spawn_blocking(move || (inner.factory)()).await {
            Ok(Ok(backend)) => Ok(self.wrap(Slot::new(backend, reservation.fulfil()))),
            Ok(Err(e)) => Err(PoolError::Create(e)),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(PoolError::Create(StorageError::Backend(e.to_string()))),
        }
    }

    fn wrap(&self, slot: Slot<B>) -> PooledHandle<B> {
        PooledHandle {
            slot: Some(slot),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a handle. A handle borrowed from a different pool is left
    /// alone: it goes back to the pool it came from.
    pub fn release(&self, handle: PooledHandle<B>) {
        if !Arc::ptr_eq(&handle.pool, &self.inner) {
            tracing::debug!("release called with a handle from another pool");
        }
        drop(handle);
    }

    /// Stop pooling: tear down idle handles, reset counters and fail any
    /// waiting or future acquisitions. Handles still in use are torn down
    /// when they are released.
    pub fn close(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.created = 0;
            state.epoch += 1;
            std::mem::take(&mut state.idle)
        };
        let discarded = idle.len();
        for mut slot in idle {
            slot.backend.close();
        }
        self.inner.wait_count.store(0, Ordering::Relaxed);
        self.inner.wait_nanos.store(0, Ordering::Relaxed);
        self.inner.available.notify_waiters();
        tracing::debug!(discarded, "storage pool closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (created, idle) = {
            let state = self.inner.state.lock();
            (state.created, state.idle.len())
        };
        let wait_count = self.inner.wait_count.load(Ordering::Relaxed);
        let wait_nanos = self.inner.wait_nanos.load(Ordering::Relaxed);
        let average_wait = if wait_count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(wait_nanos / wait_count)
        };
        PoolStats {
            created,
            active: created.saturating_sub(idle),
            idle,
            max_size: self.inner.config.max_size,
            wait_count,
            average_wait,
        }
    }
}

impl<B> Slot<B> {
    fn new(backend: B, epoch: u64) -> Self {
        let now = Instant::now();
        Self {
            backend,
            created_at: now,
            last_used_at: now,
            epoch,
        }
    }
}

impl<B: Backend> Inner<B> {
    fn put_back(&self, mut slot: Slot<B>) {
        let mut state = self.state.lock();
        if state.closed || slot.epoch != state.epoch {
            drop(state);
            slot.backend.close();
            return;
        }
        if state.idle.len() < self.config.max_idle {
            slot.last_used_at = Instant::now();
            state.idle.push(slot);
            drop(state);
        } else {
            state.created = state.created.saturating_sub(1);
            drop(state);
            slot.backend.close();
        }
        // Either a handle is idle or there is room to create one
        self.available.notify_one();
    }
}

/// Capacity claimed for a handle that is still being created.
struct Reservation<B> {
    inner: Arc<Inner<B>>,
    epoch: u64,
    armed: bool,
}

impl<B> Reservation<B> {
    fn fulfil(mut self) -> u64 {
        self.armed = false;
        self.epoch
    }
}

impl<B> Drop for Reservation<B> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state.epoch == self.epoch {
                state.created = state.created.saturating_sub(1);
            }
        }
        self.inner.available.notify_one();
    }
}

/// A borrowed backend handle. Returned to its pool when dropped, so it can
/// only ever be released once.
pub struct PooledHandle<B: Backend> {
    slot: Option<Slot<B>>,
    pool: Arc<Inner<B>>,
}

impl<B: Backend> PooledHandle<B> {
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.slot().created_at
    }

    #[must_use]
    pub fn last_used_at(&self) -> Instant {
        self.slot().last_used_at
    }

    fn slot(&self) -> &Slot<B> {
        self.slot
            .as_ref()
            .unwrap_or_else(|| unreachable!("slot is only taken in drop"))
    }
}

impl<B: Backend> Deref for PooledHandle<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.slot().backend
    }
}

impl<B: Backend> DerefMut for PooledHandle<B> {
    fn deref_mut(&mut self) -> &mut B {
        &mut self
            .slot
            .as_mut()
            .unwrap_or_else(|| unreachable!("slot is only taken in drop"))
            .backend
    }
}

impl<B: Backend> Drop for PooledHandle<B> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.put_back(slot);
        }
    }
}

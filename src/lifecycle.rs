//! Server phases, in-flight accounting and drain.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Stopped,
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every admitted request finished before the deadline.
    Clean,
    /// The deadline expired with requests still running.
    Forced { remaining: usize },
}

/// Shared by every request. New work is refused once draining starts;
/// work admitted before that point is counted until its guard drops.
#[derive(Debug, Default)]
pub struct Lifecycle {
    draining: AtomicBool,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Admit a request, or `None` if the server is draining.
    ///
    /// The counter is bumped before the gate is read so a drain that starts
    /// concurrently either sees this request or this request sees the drain.
    #[must_use]
    pub fn try_enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.draining.load(Ordering::SeqCst) {
            self.exit();
            return None;
        }
        Some(InFlightGuard {
            lifecycle: Arc::clone(self),
        })
    }

    fn exit(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Close the gate. Returns false if it was already closed.
    pub fn begin_drain(&self) -> bool {
        !self.draining.swap(true, Ordering::SeqCst)
    }

    pub fn mark_stopped(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        if self.stopped.load(Ordering::SeqCst) {
            Phase::Stopped
        } else if self.is_draining() {
            Phase::Draining
        } else {
            Phase::Running
        }
    }

    /// Wait for the in-flight count to reach zero or for `timeout` to pass,
    /// logging progress every `report_every`.
    pub async fn wait_idle(&self, timeout: Duration, report_every: Duration) -> ShutdownOutcome {
        let deadline = Instant::now() + timeout;
        let mut next_report = Instant::now() + report_every;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = self.in_flight();
            if remaining == 0 {
                return ShutdownOutcome::Clean;
            }

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(next_report) => {
                    tracing::info!(in_flight = remaining, "waiting for in-flight requests to finish");
                    next_report = Instant::now() + report_every;
                }
                () = tokio::time::sleep_until(deadline) => {
                    return ShutdownOutcome::Forced {
                        remaining: self.in_flight(),
                    };
                }
            }
        }
    }
}

/// Decrements the in-flight count on drop, whether the request finished,
/// failed, panicked or was cancelled.
#[derive(Debug)]
pub struct InFlightGuard {
    lifecycle: Arc<Lifecycle>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.lifecycle.exit();
    }
}

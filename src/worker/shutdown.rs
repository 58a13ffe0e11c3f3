//! Escalating worker pool shutdown
//!
//! ```text
//! shutdown() ──► wait for quiescence ──► interrupt deadline ──► hard deadline
//!                      ▲      │               interrupt all        discard queue,
//!                      │      ▼               workers (once)       interrupt, report
//!                      └── diagnostic probe every check interval
//! ```

use super::pool::{WorkerPool, WorkerSnapshot};
use std::time::{Duration, Instant};

/// Decides whether a busy worker can never finish its task.
pub trait StallDetector: Send + Sync {
    fn is_permanently_blocked(&self, worker: &WorkerSnapshot) -> bool;
}

impl<F> StallDetector for F
where
    F: Fn(&WorkerSnapshot) -> bool + Send + Sync,
{
    fn is_permanently_blocked(&self, worker: &WorkerSnapshot) -> bool {
        self(worker)
    }
}

/// Flags workers that called into process termination.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminatingCallDetector;

impl StallDetector for TerminatingCallDetector {
    fn is_permanently_blocked(&self, worker: &WorkerSnapshot) -> bool {
        worker.in_terminating_call
    }
}

/// How a controlled shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every worker finished before the hard deadline.
    Terminated,
    /// Remaining work was cancelled.
    Forced {
        discarded: usize,
        still_running: usize,
    },
}

/// Drives a [`WorkerPool`] from `shutdown()` to termination.
///
/// Timing comes from the pool's [`WorkerPoolConfig`](super::WorkerPoolConfig):
/// in-flight tasks are interrupted once `shutdown_interrupt` has elapsed, and
/// everything left is cancelled at `shutdown_timeout`. An interrupt delay at or
/// beyond the timeout means the pool is never interrupted ahead of the hard
/// deadline. Every `shutdown_check_interval` a probe reports progress.
///
/// The controller never fails; its outcome is observational.
pub struct WorkerPoolShutdownController {
    pool: WorkerPool,
    timeout: Duration,
    interrupt: Duration,
    check_interval: Option<Duration>,
    detector: Box<dyn StallDetector>,
}

impl WorkerPoolShutdownController {
    pub fn new(pool: WorkerPool) -> Self {
        let config = pool.config();
        Self {
            timeout: config.shutdown_timeout,
            interrupt: config.shutdown_interrupt,
            check_interval: config.shutdown_check_interval,
            detector: Box::new(TerminatingCallDetector),
            pool,
        }
    }

    pub fn with_stall_detector(mut self, detector: impl StallDetector + 'static) -> Self {
        self.detector = Box::new(detector);
        self
    }

    pub fn shutdown(&self) -> ShutdownOutcome {
        let name = self.pool.name();
        tracing::debug!("Shutting down worker pool {}", name);
        self.pool.shutdown();

        let mut remaining = self.timeout;
        let mut interval_remaining = self.check_interval;
        // None once workers were interrupted
        let mut interrupt_remaining = Some(self.interrupt);

        loop {
            let wait = [interval_remaining, interrupt_remaining]
                .into_iter()
                .flatten()
                .fold(remaining, Duration::min);

            let started = Instant::now();
            if self.pool.await_termination(wait) {
                tracing::debug!("Worker pool {} terminated", name);
                return ShutdownOutcome::Terminated;
            }
            let elapsed = started.elapsed();

            remaining = remaining.saturating_sub(elapsed);
            interval_remaining = interval_remaining.map(|left| left.saturating_sub(elapsed));
            interrupt_remaining = interrupt_remaining.map(|left| left.saturating_sub(elapsed));

            if interrupt_remaining.is_some_and(|left| left.is_zero()) {
                interrupt_remaining = None;
                tracing::info!("Interrupting worker pool {} tasks still running", name);
                self.pool.interrupt_workers();
            }

            if remaining.is_zero() {
                return self.force();
            }

            if interval_remaining.is_some_and(|left| left.is_zero()) {
                interval_remaining = self.check_interval;
                if !self.probe() {
                    return self.force();
                }
            }
        }
    }

    /// Reports progress. Returns `false` when every busy worker is stuck for
    /// good and waiting longer is pointless.
    fn probe(&self) -> bool {
        let snapshot = self.pool.snapshot();
        let mut waiting = 0usize;
        let mut stuck = 0usize;

        for worker in snapshot.workers.iter().filter(|worker| worker.is_busy()) {
            if self.detector.is_permanently_blocked(worker) {
                stuck += 1;
                tracing::error!(
                    "Worker {} of pool {} is blocked in a call that never returns (busy for {:?})",
                    worker.thread_name,
                    self.pool.name(),
                    worker.busy_for.unwrap_or_default()
                );
            } else {
                waiting += 1;
            }
        }

        tracing::info!(
            "Worker pool {} is shutting down: {} tasks queued, {} running",
            self.pool.name(),
            snapshot.queued,
            waiting
        );

        !(waiting == 0 && stuck > 0)
    }

    fn force(&self) -> ShutdownOutcome {
        let discarded = self.pool.shutdown_now().len();
        let still_running = self
            .pool
            .snapshot()
            .workers
            .iter()
            .filter(|worker| worker.is_busy())
            .count();

        if discarded > 0 || still_running > 0 {
            tracing::warn!(
                "Worker pool {} did not shut down cleanly: {} queued tasks discarded, {} threads still running",
                self.pool.name(),
                discarded,
                still_running
            );
        }
        ShutdownOutcome::Forced {
            discarded,
            still_running,
        }
    }
}

impl std::fmt::Debug for WorkerPoolShutdownController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolShutdownController")
            .field("pool", &self.pool.name())
            .field("timeout", &self.timeout)
            .field("interrupt", &self.interrupt)
            .field("check_interval", &self.check_interval)
            .finish_non_exhaustive()
    }
}

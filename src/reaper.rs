//! Background sweep that expires idle sandboxes and reclaims orphans.
//!
//! The reaper runs on its own thread, independent of any request. The first
//! sweep happens immediately so workspaces left behind by a crashed process
//! are recovered at startup. Each sweep is independent: a teardown that
//! fails is logged and the next pass tries again. A teardown that panics is
//! contained to its own sandbox (see [`SandboxRegistry::expire_idle`]), so
//! the remaining expired sandboxes in the same pass are still reclaimed.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::registry::SandboxRegistry;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle sandboxes destroyed.
    pub expired: usize,
    /// Orphaned workspaces reclaimed.
    pub orphans: usize,
}

/// Periodic sweeper over a shared registry.
#[derive(Debug, Clone)]
pub struct Reaper {
    registry: Arc<SandboxRegistry>,
    interval: Duration,
}

impl Reaper {
    /// Creates a reaper using the registry's configured interval.
    #[must_use]
    pub fn new(registry: Arc<SandboxRegistry>) -> Self {
        let interval = registry.config().reaper_interval;
        Self { registry, interval }
    }

    /// Overrides the sweep interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs one sweep.
    #[instrument(skip(self))]
    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            expired: self.registry.expire_idle(),
            orphans: self.registry.reclaim_orphans(),
        };
        if report != SweepReport::default() {
            info!(expired = report.expired, orphans = report.orphans, "Reaper sweep finished");
        } else {
            debug!("Reaper sweep found nothing to do");
        }
        report
    }

    /// Starts sweeping on a dedicated thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(self) -> std::io::Result<ReaperHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let interval = self.interval;

        let join = thread::Builder::new()
            .name("sandbox-reaper".to_string())
            .spawn(move || {
                debug!(interval_ms = %interval.as_millis(), "Reaper started");
                loop {
                    // Panics outside a single teardown must not end the reaper either
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.sweep())).is_err() {
                        warn!("Reaper sweep panicked, continuing on next interval");
                    }
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Reaper stopped");
            })?;

        Ok(ReaperHandle {
            stop: Some(stop),
            join: Some(join),
        })
    }
}

/// Handle to a running reaper thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct ReaperHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stops the reaper and waits for an in-progress sweep to finish.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("Reaper thread panicked");
            }
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

//! Platform scheduler capability
//!
//! Periodic flushing in `Period` mode is an OS concern (WorkManager, BGTask,
//! cron, ...). The coordinator only starts and stops the capability; the
//! platform job it schedules is expected to call `flush_data()` itself.

use std::time::Duration;

/// OS periodic-job capability started/stopped by the flush coordinator.
pub trait PlatformScheduler: Send + Sync + 'static {
    /// Schedule a recurring flush job with the given period.
    /// Idempotent: rescheduling replaces the previous period.
    fn start(&self, period: Duration);

    /// Cancel the recurring job, if scheduled.
    fn stop(&self);
}

/// Scheduler for hosts that drive periodic flushes themselves.
#[derive(Debug, Default)]
pub struct NoopScheduler;

impl PlatformScheduler for NoopScheduler {
    fn start(&self, period: Duration) {
        tracing::debug!(?period, "No platform scheduler configured, skipping start");
    }

    fn stop(&self) {}
}

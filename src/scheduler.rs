//! Periodic triggers
//!
//! Each schedule is a tokio task that ticks on an interval and dispatches a cycle
//! through the experiment's job runner on the blocking pool. Ticks that fall behind
//! are skipped, and a trigger that lands while a cycle is still running is
//! coalesced by the engine, so a slow cycle never builds a backlog.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::platform::Platform;
use crate::{Error, Result};

/// Spawns periodic triggers for a platform.
#[derive(Debug, Clone)]
pub struct Scheduler {
    platform: Platform,
}

impl Scheduler {
    /// Create a scheduler for `platform`.
    #[must_use]
    pub const fn new(platform: Platform) -> Self {
        Self { platform }
    }

    /// Trigger `experiment` every `period`, starting immediately.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a zero period and `Error::Config` when
    /// called outside a tokio runtime.
    pub fn every(&self, experiment: &str, period: Duration) -> Result<ScheduleHandle> {
        if period.is_zero() {
            return Err(Error::Validation(
                "schedule period must be greater than zero".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Config("scheduling requires a running tokio runtime".to_string())
        })?;

        let ticks = Arc::new(AtomicU64::new(0));
        let task = runtime.spawn(tick_loop(
            self.platform.clone(),
            experiment.to_string(),
            period,
            Arc::clone(&ticks),
        ));
        tracing::info!(experiment, ?period, "scheduled experiment");

        Ok(ScheduleHandle {
            experiment: experiment.to_string(),
            ticks,
            task,
        })
    }
}

async fn tick_loop(platform: Platform, experiment: String, period: Duration, ticks: Arc<AtomicU64>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let platform = platform.clone();
        let name = experiment.clone();
        match tokio::task::spawn_blocking(move || platform.trigger(&name)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(%experiment, error = %e, "scheduled trigger failed"),
            Err(e) => tracing::warn!(%experiment, error = %e, "scheduled trigger panicked"),
        }
        ticks.fetch_add(1, Ordering::Relaxed);
    }
}

/// A running schedule. Dropping the handle stops it.
#[derive(Debug)]
pub struct ScheduleHandle {
    experiment: String,
    ticks: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl ScheduleHandle {
    /// Scheduled experiment.
    #[must_use]
    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    /// Triggers dispatched so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stop triggering. A cycle already dispatched still runs to completion.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Whether the schedule has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ScheduleHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelRegistry;

    #[test]
    fn test_requires_runtime() {
        let scheduler = Scheduler::new(Platform::new(ModelRegistry::new()));
        let err = scheduler.every("e", Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_zero_period_rejected() {
        let scheduler = Scheduler::new(Platform::new(ModelRegistry::new()));
        let err = scheduler.every("e", Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_ticks_even_when_trigger_fails() {
        // Unknown experiment: every trigger fails with NotFound, the loop keeps going
        let scheduler = Scheduler::new(Platform::new(ModelRegistry::new()));
        let handle = scheduler.every("ghost", Duration::from_millis(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.ticks() >= 2);
        assert_eq!(handle.experiment(), "ghost");

        handle.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_finished());
    }
}

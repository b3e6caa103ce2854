//! Job runners
//!
//! A project hands every cycle to a named runner, fixed when the project is created:
//!
//! - [`RunnerProtocol::Synchronous`] runs the job on the calling thread and returns
//!   its result.
//! - [`RunnerProtocol::Asynchronous`] queues the job on a dedicated rayon thread pool
//!   and returns at once; the outcome is observable only through experiment state.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::EntityKind;
use crate::{Error, Result};

/// Runner implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerProtocol {
    /// Inline execution
    Synchronous,
    /// Background thread pool
    Asynchronous,
}

impl fmt::Display for RunnerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Synchronous => "synchronous",
            Self::Asynchronous => "asynchronous",
        })
    }
}

/// What happened to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus<T> {
    /// Ran inline; here is the result.
    Completed(T),
    /// Queued on a background pool.
    Scheduled,
}

impl<T> JobStatus<T> {
    /// The inline result, if the job already ran.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Scheduled => None,
        }
    }
}

enum Executor {
    Inline,
    Pool(rayon::ThreadPool),
}

/// Executes cycle jobs.
pub struct JobRunner {
    executor: Executor,
    in_flight: Arc<AtomicUsize>,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("protocol", &self.protocol())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl JobRunner {
    /// Runner that executes jobs on the caller's thread.
    #[must_use]
    pub fn synchronous() -> Self {
        Self {
            executor: Executor::Inline,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Runner backed by a pool of `workers` threads.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `workers` is zero or the pool cannot be built.
    pub fn asynchronous(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::Config(
                "asynchronous job runner needs at least one worker".to_string(),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("beaver-runner-{i}"))
            .panic_handler(|_| tracing::error!("job panicked on the runner pool"))
            .build()
            .map_err(|e| Error::Config(format!("failed to start job runner pool: {e}")))?;
        Ok(Self {
            executor: Executor::Pool(pool),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Build a runner for `protocol` (`workers` is ignored for synchronous runners).
    ///
    /// # Errors
    ///
    /// See [`JobRunner::asynchronous`].
    pub fn new(protocol: RunnerProtocol, workers: usize) -> Result<Self> {
        match protocol {
            RunnerProtocol::Synchronous => Ok(Self::synchronous()),
            RunnerProtocol::Asynchronous => Self::asynchronous(workers),
        }
    }

    /// Which implementation this is.
    #[must_use]
    pub const fn protocol(&self) -> RunnerProtocol {
        match self.executor {
            Executor::Inline => RunnerProtocol::Synchronous,
            Executor::Pool(_) => RunnerProtocol::Asynchronous,
        }
    }

    /// Submit a job.
    pub fn run<T, F>(&self, job: F) -> JobStatus<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match &self.executor {
            Executor::Inline => JobStatus::Completed(job()),
            Executor::Pool(pool) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                let in_flight = Arc::clone(&self.in_flight);
                pool.spawn(move || {
                    let _done = InFlightGuard(in_flight);
                    let _result = job();
                });
                JobStatus::Scheduled
            }
        }
    }

    /// Jobs queued or running on the pool.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Poll until no jobs are in flight or `timeout` elapses. Returns whether the
    /// runner went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }
}

/// Decrements the in-flight counter even if the job panics.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Named job runners.
#[derive(Debug, Default)]
pub struct RunnerRegistry {
    runners: DashMap<String, Arc<JobRunner>>,
}

impl RunnerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register a runner.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyExists` if the name is taken, or the errors of
    /// [`JobRunner::new`].
    pub fn register(
        &self,
        name: impl Into<String>,
        protocol: RunnerProtocol,
        workers: usize,
    ) -> Result<Arc<JobRunner>> {
        let name = name.into();
        match self.runners.entry(name) {
            Entry::Occupied(entry) => Err(Error::already_exists(
                EntityKind::JobRunner,
                entry.key().clone(),
            )),
            Entry::Vacant(entry) => {
                let runner = Arc::new(JobRunner::new(protocol, workers)?);
                entry.insert(Arc::clone(&runner));
                Ok(runner)
            }
        }
    }

    /// Look up a runner by name.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no runner is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<JobRunner>> {
        self.runners
            .get(name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| Error::not_found(EntityKind::JobRunner, name))
    }

    /// Names of all registered runners, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_synchronous_runs_inline() {
        let runner = JobRunner::synchronous();
        assert_eq!(runner.protocol(), RunnerProtocol::Synchronous);
        assert_eq!(runner.run(|| 41 + 1), JobStatus::Completed(42));
        assert_eq!(runner.in_flight(), 0);
    }

    #[test]
    fn test_asynchronous_schedules() {
        let runner = JobRunner::asynchronous(2).unwrap();
        let (tx, rx) = mpsc::channel();

        let status = runner.run(move || tx.send(7).unwrap());
        assert_eq!(status, JobStatus::Scheduled);
        assert_eq!(status.completed(), None);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        assert!(runner.wait_idle(Duration::from_secs(5)));
        assert_eq!(runner.in_flight(), 0);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(JobRunner::asynchronous(0), Err(Error::Config(_))));
    }

    #[test]
    fn test_registry() {
        let registry = RunnerRegistry::new();
        registry.register("sync", RunnerProtocol::Synchronous, 0).unwrap();
        registry.register("pool", RunnerProtocol::Asynchronous, 1).unwrap();

        assert_eq!(registry.names(), vec!["pool".to_string(), "sync".to_string()]);
        assert_eq!(
            registry.get("pool").unwrap().protocol(),
            RunnerProtocol::Asynchronous
        );
        assert!(matches!(
            registry.register("sync", RunnerProtocol::Synchronous, 0),
            Err(Error::AlreadyExists { .. })
        ));
        assert!(matches!(registry.get("nope"), Err(Error::NotFound { .. })));
    }
}

//! Platform facade
//!
//! Owns the registries (message buses, job runners, model kinds), the experiment
//! catalog and the engine, and exposes the collaborator-facing operations:
//! publishing events, defining projects and views, creating experiments and
//! triggering cycles.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::bus::{BusProtocol, BusRegistry, MessageBus, Record};
use crate::config::PlatformConfig;
use crate::engine::{ContentionPolicy, CycleOutcome, ProgressiveLearner};
use crate::experiment::{
    Experiment, ExperimentStats, ExperimentStore, FeatureSet, Project, ProjectTask,
};
use crate::model::{Model, ModelRegistry};
use crate::runner::{JobRunner, JobStatus, RunnerProtocol, RunnerRegistry};
use crate::scheduler::{ScheduleHandle, Scheduler};
use crate::stream::ViewDefinition;
use crate::{Error, Result};

/// Outcome of dispatching a cycle through a job runner.
pub type Dispatch = JobStatus<Result<CycleOutcome>>;

/// Parameters for [`Platform::create_experiment`].
#[derive(Debug, Clone)]
pub struct NewExperiment {
    /// Unique experiment name
    pub name: String,
    /// Owning project
    pub project_name: String,
    /// Feature set the model predicts from
    pub feature_set_name: String,
    /// Sealed model envelope (see [`Platform::seal`])
    pub model: Vec<u8>,
    /// `true`: consume the full history; `false`: only events after creation
    pub start_from_top: bool,
}

impl NewExperiment {
    /// Experiment that consumes the full history.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        project_name: impl Into<String>,
        feature_set_name: impl Into<String>,
        model: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            project_name: project_name.into(),
            feature_set_name: feature_set_name.into(),
            model,
            start_from_top: true,
        }
    }

    /// Choose whether to replay events published before creation.
    #[must_use]
    pub const fn start_from_top(mut self, start_from_top: bool) -> Self {
        self.start_from_top = start_from_top;
        self
    }
}

struct Inner {
    catalog: Arc<ExperimentStore>,
    buses: Arc<BusRegistry>,
    runners: RunnerRegistry,
    models: Arc<ModelRegistry>,
    engine: Arc<ProgressiveLearner>,
}

/// Shared handle to a running platform. Cloning is cheap.
#[derive(Clone)]
pub struct Platform {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("buses", &self.inner.buses)
            .field("runners", &self.inner.runners)
            .field("models", &self.inner.models)
            .field("experiments", &self.inner.catalog.experiment_count())
            .finish()
    }
}

impl Platform {
    /// Build a platform from configuration, opening every declared bus and runner.
    ///
    /// The engine's compression setting is applied to `models`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid configuration and
    /// `Error::BackendUnavailable` if a bus cannot be opened.
    ///
    /// # Example
    ///
    /// ```rust
    /// use beaver::config::PlatformConfig;
    /// use beaver::model::ModelRegistry;
    /// use beaver::Platform;
    ///
    /// # fn main() -> beaver::Result<()> {
    /// let platform = Platform::from_config(&PlatformConfig::in_memory(), ModelRegistry::with_builtins())?;
    /// platform.publish("local", "features", "0", b"{}".to_vec(), None)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_config(config: &PlatformConfig, mut models: ModelRegistry) -> Result<Self> {
        config.validate()?;
        models.set_compression(config.engine.compression);
        let platform = Self::assemble(models, config.engine.contention);

        for bus in &config.message_buses {
            platform.register_message_bus(&bus.name, bus.protocol, bus.url.as_deref())?;
        }
        for runner in &config.job_runners {
            platform.register_job_runner(&runner.name, runner.protocol, runner.workers)?;
        }
        Ok(platform)
    }

    /// Platform with no buses or runners and default engine settings.
    #[must_use]
    pub fn new(models: ModelRegistry) -> Self {
        Self::assemble(models, ContentionPolicy::default())
    }

    fn assemble(models: ModelRegistry, contention: ContentionPolicy) -> Self {
        let catalog = Arc::new(ExperimentStore::new());
        let buses = Arc::new(BusRegistry::new());
        let models = Arc::new(models);
        let engine = Arc::new(ProgressiveLearner::new(
            Arc::clone(&catalog),
            Arc::clone(&buses),
            Arc::clone(&models),
            contention,
        ));
        Self {
            inner: Arc::new(Inner {
                catalog,
                buses,
                runners: RunnerRegistry::new(),
                models,
                engine,
            }),
        }
    }

    /// Open and register a message bus.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyExists` if the name is taken, `Error::Config` for a
    /// sqlite bus without a usable path, or `Error::BackendUnavailable`.
    pub fn register_message_bus(
        &self,
        name: &str,
        protocol: BusProtocol,
        url: Option<&str>,
    ) -> Result<()> {
        self.inner.buses.register(name, protocol, url)?;
        tracing::info!(name, %protocol, "registered message bus");
        Ok(())
    }

    /// Start and register a job runner.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyExists` if the name is taken or `Error::Config` for an
    /// unusable worker count.
    pub fn register_job_runner(
        &self,
        name: &str,
        protocol: RunnerProtocol,
        workers: usize,
    ) -> Result<()> {
        self.inner.runners.register(name, protocol, workers)?;
        tracing::info!(name, %protocol, workers, "registered job runner");
        Ok(())
    }

    /// Look up a message bus.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such bus is registered.
    pub fn message_bus(&self, name: &str) -> Result<Arc<dyn MessageBus>> {
        self.inner.buses.get(name)
    }

    /// Look up a job runner.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such runner is registered.
    pub fn job_runner(&self, name: &str) -> Result<Arc<JobRunner>> {
        self.inner.runners.get(name)
    }

    /// Append a raw event.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown bus or `Error::BackendUnavailable`.
    pub fn publish(
        &self,
        bus: &str,
        topic: &str,
        key: &str,
        value: impl Into<Vec<u8>>,
        at: Option<DateTime<Utc>>,
    ) -> Result<Record> {
        self.inner.buses.get(bus)?.append(topic, key, value.into(), at)
    }

    /// Append an event whose value is `value` encoded as JSON.
    ///
    /// # Errors
    ///
    /// As [`Platform::publish`], plus `Error::Json` if `value` cannot be encoded.
    pub fn publish_json<T: Serialize + ?Sized>(
        &self,
        bus: &str,
        topic: &str,
        key: &str,
        value: &T,
        at: Option<DateTime<Utc>>,
    ) -> Result<Record> {
        self.publish(bus, topic, key, serde_json::to_vec(value)?, at)
    }

    /// Create a project bound to a registered bus and runner.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown bus or runner and
    /// `Error::AlreadyExists` if the name is taken.
    pub fn create_project(
        &self,
        name: &str,
        task: ProjectTask,
        message_bus: &str,
        job_runner: &str,
    ) -> Result<Project> {
        self.inner.buses.get(message_bus)?;
        self.inner.runners.get(job_runner)?;
        let project = Project::new(name, task, message_bus, job_runner);
        self.inner.catalog.add_project(project.clone())?;
        tracing::info!(name, ?task, message_bus, job_runner, "created project");
        Ok(project)
    }

    /// Set the label view of a project.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a blank view and `Error::NotFound` for an
    /// unknown project.
    pub fn define_target(&self, project: &str, view: ViewDefinition) -> Result<()> {
        view.validate()?;
        self.inner.catalog.set_target(project, view)?;
        tracing::info!(project, "defined target view");
        Ok(())
    }

    /// Create a named feature view inside a project.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a blank view, `Error::NotFound` for an
    /// unknown project and `Error::AlreadyExists` if the name is taken.
    pub fn create_feature_set(
        &self,
        name: &str,
        project: &str,
        view: ViewDefinition,
    ) -> Result<FeatureSet> {
        view.validate()?;
        let feature_set = FeatureSet::new(name, project, view);
        self.inner.catalog.add_feature_set(feature_set.clone())?;
        tracing::info!(name, project, "created feature set");
        Ok(feature_set)
    }

    /// Snapshot a model into envelope bytes suitable for [`NewExperiment`].
    ///
    /// # Errors
    ///
    /// See [`ModelRegistry::seal`].
    pub fn seal(&self, model: &dyn Model) -> Result<Vec<u8>> {
        self.inner.models.seal(model)
    }

    /// Store a new experiment and dispatch its first cycle.
    ///
    /// The model envelope is opened once up front so an unusable model is rejected
    /// before anything is stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the model envelope cannot be opened or the
    /// feature set belongs to another project, `Error::NotFound` for unknown
    /// references and `Error::AlreadyExists` if the name is taken. Failures of the
    /// first cycle are reported inside the returned [`Dispatch`], not here.
    pub fn create_experiment(&self, new: NewExperiment) -> Result<Dispatch> {
        self.inner.models.open(&new.model).map_err(|e| {
            Error::Validation(format!("experiment '{}' has an unusable model: {e}", new.name))
        })?;

        let mut builder = Experiment::builder(
            &new.name,
            &new.project_name,
            &new.feature_set_name,
            new.model,
        );
        if !new.start_from_top {
            let now = Utc::now();
            builder = builder.created_at(now).cursor(crate::bus::truncate_micros(now));
        }
        self.inner.catalog.add_experiment(builder.build())?;
        tracing::info!(
            name = %new.name,
            project = %new.project_name,
            feature_set = %new.feature_set_name,
            start_from_top = new.start_from_top,
            "created experiment"
        );

        self.trigger(&new.name)
    }

    /// Dispatch a cycle for an existing experiment (resume after a pause).
    ///
    /// # Errors
    ///
    /// See [`Platform::trigger`].
    pub fn start_experiment(&self, name: &str) -> Result<Dispatch> {
        self.trigger(name)
    }

    /// Dispatch a cycle through the project's job runner.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the experiment, its project or the project's
    /// runner is missing. Cycle failures are reported inside the [`Dispatch`] for
    /// synchronous runners and logged for asynchronous ones.
    pub fn trigger(&self, name: &str) -> Result<Dispatch> {
        let experiment = self.inner.catalog.experiment(name)?;
        let project = self.inner.catalog.project(experiment.project_name())?;
        let runner = self.inner.runners.get(project.job_runner())?;

        let engine = Arc::clone(&self.inner.engine);
        let name = name.to_string();
        Ok(runner.run(move || {
            let outcome = engine.run_cycle(&name);
            if let Err(e) = &outcome {
                tracing::warn!(experiment = %name, error = %e, retryable = e.is_retryable(), "cycle failed");
            }
            outcome
        }))
    }

    /// Run a cycle on the calling thread, bypassing the project's runner.
    ///
    /// # Errors
    ///
    /// See [`ProgressiveLearner::run_cycle`].
    pub fn run_cycle(&self, name: &str) -> Result<CycleOutcome> {
        self.inner.engine.run_cycle(name)
    }

    /// Run one cycle for every experiment of a project, in parallel, on the
    /// calling thread's rayon pool.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown project; per-experiment results
    /// are returned by name.
    pub fn run_project(&self, project: &str) -> Result<BTreeMap<String, Result<CycleOutcome>>> {
        self.inner.catalog.project(project)?;
        let names = self.inner.catalog.experiments_for_project(project);
        Ok(names
            .into_par_iter()
            .map(|name| {
                let outcome = self.inner.engine.run_cycle(&name);
                (name, outcome)
            })
            .collect())
    }

    /// Current state of an experiment.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such experiment exists.
    pub fn experiment(&self, name: &str) -> Result<Experiment> {
        self.inner.catalog.experiment(name)
    }

    /// Current state of a project.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such project exists.
    pub fn project(&self, name: &str) -> Result<Project> {
        self.inner.catalog.project(name)
    }

    /// Statistics of every experiment in a project, by name.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such project exists.
    pub fn project_report(&self, project: &str) -> Result<BTreeMap<String, ExperimentStats>> {
        self.inner.catalog.project(project)?;
        self.inner
            .catalog
            .experiments_for_project(project)
            .into_iter()
            .map(|name| {
                let stats = self.inner.catalog.experiment(&name)?.stats();
                Ok((name, stats))
            })
            .collect()
    }

    /// Trigger an experiment every `period` on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown experiment, `Error::Validation` for a
    /// zero period and `Error::Config` when called outside a tokio runtime.
    pub fn schedule(&self, name: &str, period: Duration) -> Result<ScheduleHandle> {
        self.inner.catalog.experiment(name)?;
        Scheduler::new(self.clone()).every(name, period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MajorityClass;
    use serde_json::json;

    fn platform() -> Platform {
        let platform =
            Platform::from_config(&PlatformConfig::in_memory(), ModelRegistry::with_builtins())
                .unwrap();
        platform
            .create_project("p", ProjectTask::BinaryClassification, "local", "sync")
            .unwrap();
        platform.define_target("p", ViewDefinition::for_topic("labels")).unwrap();
        platform
            .create_feature_set("fs", "p", ViewDefinition::for_topic("features"))
            .unwrap();
        platform
    }

    #[test]
    fn test_create_project_checks_references() {
        let platform = platform();
        let err = platform
            .create_project("q", ProjectTask::Regression, "missing", "sync")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        let err = platform
            .create_project("q", ProjectTask::Regression, "local", "missing")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_create_experiment_runs_first_cycle() {
        let platform = platform();
        platform.publish_json("local", "features", "0", &json!({"a": 1}), None).unwrap();

        let model = platform.seal(&MajorityClass::default()).unwrap();
        let dispatch = platform
            .create_experiment(NewExperiment::new("e", "p", "fs", model))
            .unwrap();
        assert!(matches!(
            dispatch,
            JobStatus::Completed(Ok(CycleOutcome::Committed(_)))
        ));
        assert_eq!(platform.experiment("e").unwrap().stats().n_predictions, 1);
    }

    #[test]
    fn test_create_experiment_rejects_bad_model() {
        let platform = platform();
        let err = platform
            .create_experiment(NewExperiment::new("e", "p", "fs", b"garbage".to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(platform.experiment("e").is_err());
    }

    #[test]
    fn test_start_from_now_skips_history() {
        let platform = platform();
        platform.publish_json("local", "features", "old", &json!({}), None).unwrap();

        let model = platform.seal(&MajorityClass::default()).unwrap();
        let dispatch = platform
            .create_experiment(NewExperiment::new("e", "p", "fs", model).start_from_top(false))
            .unwrap();
        assert!(matches!(dispatch, JobStatus::Completed(Ok(CycleOutcome::Idle))));
    }

    #[test]
    fn test_project_report() {
        let platform = platform();
        let model = platform.seal(&MajorityClass::default()).unwrap();
        platform
            .create_experiment(NewExperiment::new("a", "p", "fs", model.clone()))
            .unwrap();
        platform
            .create_experiment(NewExperiment::new("b", "p", "fs", model))
            .unwrap();

        let report = platform.project_report("p").unwrap();
        assert_eq!(report.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(platform.project_report("nope").is_err());
    }
}

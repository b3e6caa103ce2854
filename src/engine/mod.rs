//! Progressive learning engine
//!
//! One cycle for one experiment:
//!
//! ```text
//! lock ─► load experiment ─► open model envelope ─► until = latest stamp in the log
//!            │
//!            ├─► predict phase: feature view over (cursor, until]
//!            │     decode ► predict ► pending[key] = prediction
//!            │
//!            ├─► learn phase: target view over the same window
//!            │     pending[key]? ► compare ► learn ► drop pending
//!            │
//!            └─► no rows? Idle : seal model ► CAS commit ► Committed
//! ```
//!
//! Nothing is written until the final compare-and-swap, so any error leaves the
//! experiment exactly as it was and the next trigger retries from the committed
//! cursor. Both phases share the `until` bound, so records appended while a cycle
//! runs are left for the next one instead of being skipped by the advanced cursor.

use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::BusRegistry;
use crate::error::EntityKind;
use crate::experiment::{ExperimentStore, PendingPrediction};
use crate::model::{ModelError, ModelRegistry};
use crate::stream::StreamProcessor;
use crate::{Error, Result};

/// What a trigger does when a cycle for the same experiment is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentionPolicy {
    /// Return [`CycleOutcome::Coalesced`] immediately.
    #[default]
    Skip,
    /// Block until the running cycle finishes, then run.
    Wait,
}

/// Counters for one committed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Feature rows predicted
    pub predicted: u64,
    /// Labels matched to a pending prediction and learned
    pub learned: u64,
    /// Learned labels whose prediction was correct
    pub correct: u64,
    /// Labels with no pending prediction (dropped)
    pub skipped_labels: u64,
    /// Cursor after the commit
    pub cursor: Option<DateTime<Utc>>,
}

/// Result of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// New rows were processed and committed.
    Committed(CycleReport),
    /// Nothing new since the cursor; nothing written.
    Idle,
    /// Another cycle for the experiment was in flight; this trigger did nothing.
    Coalesced,
}

/// Per-experiment cycle locks.
#[derive(Debug, Default)]
pub struct CycleLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CycleLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `experiment`, created on first use.
    #[must_use]
    pub fn handle(&self, experiment: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(experiment) {
            return Arc::clone(lock.value());
        }
        Arc::clone(
            self.locks
                .entry(experiment.to_string())
                .or_default()
                .value(),
        )
    }
}

/// Drives predict/learn cycles against the catalog.
#[derive(Debug)]
pub struct ProgressiveLearner {
    catalog: Arc<ExperimentStore>,
    buses: Arc<BusRegistry>,
    models: Arc<ModelRegistry>,
    locks: CycleLocks,
    policy: ContentionPolicy,
}

impl ProgressiveLearner {
    /// Create an engine over shared catalog, buses and model kinds.
    #[must_use]
    pub fn new(
        catalog: Arc<ExperimentStore>,
        buses: Arc<BusRegistry>,
        models: Arc<ModelRegistry>,
        policy: ContentionPolicy,
    ) -> Self {
        Self {
            catalog,
            buses,
            models,
            locks: CycleLocks::new(),
            policy,
        }
    }

    /// Contention policy in effect.
    #[must_use]
    pub const fn policy(&self) -> ContentionPolicy {
        self.policy
    }

    /// The catalog this engine commits to.
    #[must_use]
    pub fn catalog(&self) -> &Arc<ExperimentStore> {
        &self.catalog
    }

    /// Run one predict/learn cycle for `experiment`.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the experiment, its project, feature set, target view
    ///   or message bus is missing
    /// - `Error::Envelope` if the stored model cannot be opened or sealed
    /// - `Error::Query` / `Error::BackendUnavailable` from view evaluation
    /// - `Error::Model` if a value is not JSON or the model rejects a row
    /// - `Error::Conflict` if the experiment was committed concurrently
    ///
    /// On error nothing is committed.
    #[tracing::instrument(skip(self))]
    pub fn run_cycle(&self, experiment: &str) -> Result<CycleOutcome> {
        let lock = self.locks.handle(experiment);
        let _guard = match self.policy {
            ContentionPolicy::Skip => match lock.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    tracing::debug!("cycle already running, coalescing trigger");
                    return Ok(CycleOutcome::Coalesced);
                }
            },
            ContentionPolicy::Wait => lock.lock().unwrap_or_else(PoisonError::into_inner),
        };

        let record = self.catalog.experiment(experiment)?;
        let project = self.catalog.project(record.project_name())?;
        let feature_set = self.catalog.feature_set(record.feature_set_name())?;
        let target = project
            .target()
            .cloned()
            .ok_or_else(|| Error::not_found(EntityKind::Target, project.name()))?;
        let bus = self.buses.get(project.message_bus())?;
        let Some(until) = bus.latest()? else {
            tracing::debug!("empty log");
            return Ok(CycleOutcome::Idle);
        };
        let processor = StreamProcessor::new(bus);

        let mut model = self.models.open(record.model_state())?;
        let since = record.progress().cursor();
        let mut progress = record.progress().clone();
        let mut report = CycleReport::default();

        let features = processor.evaluate_window(feature_set.view(), since, Some(until))?;
        tracing::debug!(rows = features.len(), ?since, %until, "predict phase");
        for row in features {
            let value = decode(&row.key, &row.value)?;
            let predicted = model.predict(&value).map_err(|source| Error::Model {
                key: row.key.clone(),
                source,
            })?;
            progress.advance(row.ts);
            progress.record_prediction(PendingPrediction::new(row.key, value, predicted, row.ts));
            report.predicted += 1;
        }

        let labels = processor.evaluate_window(&target, since, Some(until))?;
        tracing::debug!(rows = labels.len(), ?since, "learn phase");
        for row in labels {
            progress.advance(row.ts);
            let Some(pending) = progress.take_pending(&row.key) else {
                report.skipped_labels += 1;
                continue;
            };
            let label = decode(&row.key, &row.value)?;
            model
                .learn(pending.feature_value(), &label)
                .map_err(|source| Error::Model {
                    key: row.key.clone(),
                    source,
                })?;
            let correct = *pending.predicted_value() == label;
            progress.record_learning(correct);
            report.learned += 1;
            report.correct += u64::from(correct);
        }

        if report.predicted == 0 && report.learned == 0 && report.skipped_labels == 0 {
            tracing::debug!("no new rows");
            return Ok(CycleOutcome::Idle);
        }
        if report.skipped_labels > 0 {
            tracing::debug!(
                skipped = report.skipped_labels,
                "dropped labels without a pending prediction"
            );
        }

        let model_state = self.models.seal(model.as_ref())?;
        report.cursor = progress.cursor();
        let version = self
            .catalog
            .commit(experiment, record.version(), model_state, progress)?;

        tracing::info!(
            version,
            predicted = report.predicted,
            learned = report.learned,
            correct = report.correct,
            "cycle committed"
        );
        Ok(CycleOutcome::Committed(report))
    }
}

fn decode(key: &str, bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|e| Error::Model {
        key: key.to_string(),
        source: ModelError::new(format!("value is not valid JSON: {e}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusProtocol, MessageBus};
    use crate::experiment::{Experiment, FeatureSet, Project, ProjectTask};
    use crate::model::MajorityClass;
    use crate::stream::ViewDefinition;

    struct Fixture {
        engine: ProgressiveLearner,
        bus: Arc<dyn MessageBus>,
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn fixture(policy: ContentionPolicy) -> Fixture {
        let catalog = Arc::new(ExperimentStore::new());
        let buses = Arc::new(BusRegistry::new());
        let models = Arc::new(ModelRegistry::with_builtins());
        let bus = buses.register("bus", BusProtocol::Memory, None).unwrap();

        catalog
            .add_project(Project::new("p", ProjectTask::BinaryClassification, "bus", "sync"))
            .unwrap();
        catalog.set_target("p", ViewDefinition::for_topic("labels")).unwrap();
        catalog
            .add_feature_set(FeatureSet::new("fs", "p", ViewDefinition::for_topic("features")))
            .unwrap();
        let state = models.seal(&MajorityClass::default()).unwrap();
        catalog.add_experiment(Experiment::new("e", "p", "fs", state)).unwrap();

        Fixture {
            engine: ProgressiveLearner::new(catalog, buses, models, policy),
            bus,
        }
    }

    #[test]
    fn test_idle_without_rows() {
        let f = fixture(ContentionPolicy::Skip);
        assert_eq!(f.engine.run_cycle("e").unwrap(), CycleOutcome::Idle);
        assert_eq!(f.engine.catalog().experiment("e").unwrap().version(), 0);
    }

    #[test]
    fn test_predict_then_learn() {
        let f = fixture(ContentionPolicy::Skip);
        f.bus.append("features", "1", b"{}".to_vec(), Some(at(1))).unwrap();
        f.bus.append("labels", "1", b"true".to_vec(), Some(at(2))).unwrap();
        f.bus.append("labels", "9", b"true".to_vec(), Some(at(3))).unwrap();

        let CycleOutcome::Committed(report) = f.engine.run_cycle("e").unwrap() else {
            panic!("expected a commit");
        };
        assert_eq!(report.predicted, 1);
        assert_eq!(report.learned, 1);
        // Untrained majority model predicts null
        assert_eq!(report.correct, 0);
        assert_eq!(report.skipped_labels, 1);
        assert_eq!(report.cursor, Some(at(3)));

        let experiment = f.engine.catalog().experiment("e").unwrap();
        assert_eq!(experiment.version(), 1);
        assert!(experiment.progress().pending().is_empty());
    }

    #[test]
    fn test_missing_target_is_not_found() {
        let f = fixture(ContentionPolicy::Skip);
        f.engine
            .catalog()
            .add_project(Project::new("q", ProjectTask::Regression, "bus", "sync"))
            .unwrap();
        f.engine
            .catalog()
            .add_feature_set(FeatureSet::new("fq", "q", ViewDefinition::for_topic("f")))
            .unwrap();
        f.engine
            .catalog()
            .add_experiment(Experiment::new("eq", "q", "fq", Vec::new()))
            .unwrap();

        let err = f.engine.run_cycle("eq").unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: EntityKind::Target, .. }));
    }

    #[test]
    fn test_non_json_value_aborts_cycle() {
        let f = fixture(ContentionPolicy::Skip);
        f.bus.append("features", "1", b"{}".to_vec(), Some(at(1))).unwrap();
        f.bus.append("features", "2", b"not json".to_vec(), Some(at(2))).unwrap();

        let err = f.engine.run_cycle("e").unwrap_err();
        assert!(matches!(err, Error::Model { ref key, .. } if key == "2"));
        assert_eq!(f.engine.catalog().experiment("e").unwrap().version(), 0);
    }

    #[test]
    fn test_skip_policy_coalesces_while_locked() {
        let f = fixture(ContentionPolicy::Skip);
        let lock = f.engine.locks.handle("e");
        let _held = lock.lock().unwrap();
        assert_eq!(f.engine.run_cycle("e").unwrap(), CycleOutcome::Coalesced);
    }

    #[test]
    fn test_lock_handles_are_shared() {
        let locks = CycleLocks::new();
        assert!(Arc::ptr_eq(&locks.handle("a"), &locks.handle("a")));
        assert!(!Arc::ptr_eq(&locks.handle("a"), &locks.handle("b")));
    }
}

//! Experiment Record - one model consuming one feature view of a project

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A prediction waiting for its label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingPrediction {
    key: String,
    feature_value: Value,
    predicted_value: Value,
    produced_at: DateTime<Utc>,
}

impl PendingPrediction {
    /// Create a pending prediction.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        feature_value: Value,
        predicted_value: Value,
        produced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.into(),
            feature_value,
            predicted_value,
            produced_at,
        }
    }

    /// Join key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Features the prediction was made from.
    #[must_use]
    pub const fn feature_value(&self) -> &Value {
        &self.feature_value
    }

    /// What the model predicted.
    #[must_use]
    pub const fn predicted_value(&self) -> &Value {
        &self.predicted_value
    }

    /// Timestamp of the feature row.
    #[must_use]
    pub const fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }
}

/// Resumable processing state of an experiment.
///
/// Invariants: the cursor never moves backwards, `n_predictions >= n_learnings`,
/// and there is at most one pending prediction per key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    cursor: Option<DateTime<Utc>>,
    n_predictions: u64,
    n_learnings: u64,
    correct_count: u64,
    pending: BTreeMap<String, PendingPrediction>,
}

impl Progress {
    /// Fresh progress starting after `cursor` (`None` consumes the full history).
    #[must_use]
    pub fn starting_at(cursor: Option<DateTime<Utc>>) -> Self {
        Self {
            cursor,
            ..Self::default()
        }
    }

    /// Timestamp up to which events have been processed.
    #[must_use]
    pub const fn cursor(&self) -> Option<DateTime<Utc>> {
        self.cursor
    }

    /// Number of predictions made.
    #[must_use]
    pub const fn n_predictions(&self) -> u64 {
        self.n_predictions
    }

    /// Number of labelled examples learned.
    #[must_use]
    pub const fn n_learnings(&self) -> u64 {
        self.n_learnings
    }

    /// Number of learned examples whose prior prediction matched the label.
    #[must_use]
    pub const fn correct_count(&self) -> u64 {
        self.correct_count
    }

    /// `correct_count / n_learnings`, or 0 before anything is learned.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn accuracy(&self) -> f64 {
        if self.n_learnings == 0 {
            0.0
        } else {
            self.correct_count as f64 / self.n_learnings as f64
        }
    }

    /// Predictions awaiting labels, by key.
    #[must_use]
    pub const fn pending(&self) -> &BTreeMap<String, PendingPrediction> {
        &self.pending
    }

    /// Record a prediction, replacing any earlier pending one for the same key.
    pub(crate) fn record_prediction(&mut self, prediction: PendingPrediction) {
        self.n_predictions += 1;
        self.pending.insert(prediction.key.clone(), prediction);
    }

    /// Remove and return the pending prediction for `key`.
    pub(crate) fn take_pending(&mut self, key: &str) -> Option<PendingPrediction> {
        self.pending.remove(key)
    }

    pub(crate) fn record_learning(&mut self, correct: bool) {
        self.n_learnings += 1;
        if correct {
            self.correct_count += 1;
        }
    }

    /// Move the cursor forward to `ts` (never backwards).
    pub(crate) fn advance(&mut self, ts: DateTime<Utc>) {
        if self.cursor.map_or(true, |cursor| ts > cursor) {
            self.cursor = Some(ts);
        }
    }

    /// Summary statistics.
    #[must_use]
    pub fn stats(&self) -> ExperimentStats {
        ExperimentStats {
            n_predictions: self.n_predictions,
            n_learnings: self.n_learnings,
            accuracy: self.accuracy(),
            cursor: self.cursor,
        }
    }
}

/// Externally visible experiment statistics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ExperimentStats {
    /// Predictions made
    pub n_predictions: u64,
    /// Examples learned
    pub n_learnings: u64,
    /// Fraction of learned examples predicted correctly
    pub accuracy: f64,
    /// Processing cursor
    pub cursor: Option<DateTime<Utc>>,
}

/// Experiment Record: model snapshot plus progress, versioned for compare-and-swap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Experiment {
    name: String,
    project_name: String,
    feature_set_name: String,
    created_at: DateTime<Utc>,
    model_state: Vec<u8>,
    progress: Progress,
    version: u64,
}

impl Experiment {
    /// Create an experiment that consumes the full history.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique experiment name
    /// * `project_name` - Owning project
    /// * `feature_set_name` - Feature view the model predicts from
    /// * `model_state` - Sealed model envelope
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        project_name: impl Into<String>,
        feature_set_name: impl Into<String>,
        model_state: Vec<u8>,
    ) -> Self {
        ExperimentBuilder::new(name, project_name, feature_set_name, model_state).build()
    }

    /// Create a builder for constructing an experiment with optional fields.
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        project_name: impl Into<String>,
        feature_set_name: impl Into<String>,
        model_state: Vec<u8>,
    ) -> ExperimentBuilder {
        ExperimentBuilder::new(name, project_name, feature_set_name, model_state)
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the owning project name.
    #[must_use]
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Get the feature set name.
    #[must_use]
    pub fn feature_set_name(&self) -> &str {
        &self.feature_set_name
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Sealed model envelope as of the last commit.
    #[must_use]
    pub fn model_state(&self) -> &[u8] {
        &self.model_state
    }

    /// Processing state as of the last commit.
    #[must_use]
    pub const fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Commit counter; bumped by every successful commit.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Summary statistics.
    #[must_use]
    pub fn stats(&self) -> ExperimentStats {
        self.progress.stats()
    }

    pub(crate) fn apply_commit(&mut self, model_state: Vec<u8>, progress: Progress) {
        self.model_state = model_state;
        self.progress = progress;
        self.version += 1;
    }
}

/// Builder for `Experiment`.
#[derive(Debug)]
pub struct ExperimentBuilder {
    name: String,
    project_name: String,
    feature_set_name: String,
    created_at: DateTime<Utc>,
    model_state: Vec<u8>,
    cursor: Option<DateTime<Utc>>,
}

impl ExperimentBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        project_name: impl Into<String>,
        feature_set_name: impl Into<String>,
        model_state: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            project_name: project_name.into(),
            feature_set_name: feature_set_name.into(),
            created_at: Utc::now(),
            model_state,
            cursor: None,
        }
    }

    /// Set a custom creation timestamp (useful for deserialization/testing).
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Only consume events strictly after `cursor`.
    #[must_use]
    pub const fn cursor(mut self, cursor: DateTime<Utc>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Build the `Experiment`.
    #[must_use]
    pub fn build(self) -> Experiment {
        Experiment {
            name: self.name,
            project_name: self.project_name,
            feature_set_name: self.feature_set_name,
            created_at: self.created_at,
            model_state: self.model_state,
            progress: Progress::starting_at(self.cursor),
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_experiment_new() {
        let experiment = Experiment::new("exp", "proj", "fs", vec![1, 2]);
        assert_eq!(experiment.name(), "exp");
        assert_eq!(experiment.project_name(), "proj");
        assert_eq!(experiment.feature_set_name(), "fs");
        assert_eq!(experiment.model_state(), &[1, 2]);
        assert_eq!(experiment.version(), 0);
        assert_eq!(experiment.progress(), &Progress::default());
    }

    #[test]
    fn test_builder_cursor() {
        let experiment = Experiment::builder("exp", "proj", "fs", vec![])
            .created_at(at(10))
            .cursor(at(10))
            .build();
        assert_eq!(experiment.created_at(), at(10));
        assert_eq!(experiment.stats().cursor, Some(at(10)));
    }

    #[test]
    fn test_accuracy_zero_before_learning() {
        let mut progress = Progress::default();
        progress.record_prediction(PendingPrediction::new("k", json!(1), json!(true), at(1)));
        assert_eq!(progress.accuracy(), 0.0);
        assert_eq!(progress.stats().n_predictions, 1);
    }

    #[test]
    fn test_prediction_replaces_pending_for_key() {
        let mut progress = Progress::default();
        progress.record_prediction(PendingPrediction::new("k", json!(1), json!("a"), at(1)));
        progress.record_prediction(PendingPrediction::new("k", json!(2), json!("b"), at(2)));

        assert_eq!(progress.n_predictions(), 2);
        assert_eq!(progress.pending().len(), 1);
        let pending = progress.take_pending("k").unwrap();
        assert_eq!(pending.predicted_value(), &json!("b"));
        assert_eq!(pending.feature_value(), &json!(2));
        assert_eq!(pending.produced_at(), at(2));
        assert!(progress.take_pending("k").is_none());
    }

    #[test]
    fn test_cursor_never_moves_back() {
        let mut progress = Progress::starting_at(Some(at(5)));
        progress.advance(at(3));
        assert_eq!(progress.cursor(), Some(at(5)));
        progress.advance(at(8));
        assert_eq!(progress.cursor(), Some(at(8)));
    }

    #[test]
    fn test_accuracy() {
        let mut progress = Progress::default();
        progress.record_learning(true);
        progress.record_learning(false);
        progress.record_learning(true);
        progress.record_learning(true);
        assert_eq!(progress.correct_count(), 3);
        assert!((progress.accuracy() - 0.75).abs() < f64::EPSILON);
    }
}

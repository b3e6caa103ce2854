//! Built-in models
//!
//! Small reference implementations used by the demos, tests and benchmarks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Model, ModelError, NamedModel};

/// Predicts the most frequent label seen so far.
///
/// Labels are compared by their canonical JSON text. Ties go to the
/// lexicographically smallest text; with no labels the prediction is `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MajorityClass {
    counts: BTreeMap<String, u64>,
}

impl MajorityClass {
    /// Number of labels learned.
    #[must_use]
    pub fn n_seen(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl Model for MajorityClass {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn predict(&mut self, _features: &Value) -> Result<Value, ModelError> {
        let mut best: Option<(&String, u64)> = None;
        for (label, &count) in &self.counts {
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((label, count));
            }
        }
        match best {
            Some((label, _)) => Ok(serde_json::from_str(label)?),
            None => Ok(Value::Null),
        }
    }

    fn learn(&mut self, _features: &Value, target: &Value) -> Result<(), ModelError> {
        *self.counts.entry(target.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn save(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl NamedModel for MajorityClass {
    const KIND: &'static str = "majority_class";
}

/// Binary logistic regression trained by one SGD step per example.
///
/// Features are the numeric (or boolean) fields of a JSON object; a bare number is
/// treated as a single feature named `x`. Targets must be booleans or `0`/`1`.
/// Predictions are `true` when the estimated probability is at least 0.5.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    learning_rate: f64,
    bias: f64,
    weights: BTreeMap<String, f64>,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl LogisticRegression {
    /// Untrained model with the given step size.
    #[must_use]
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            bias: 0.0,
            weights: BTreeMap::new(),
        }
    }

    /// Estimated probability of the positive class.
    ///
    /// # Errors
    ///
    /// Returns `ModelError` if the features are not numeric.
    pub fn probability(&self, features: &Value) -> Result<f64, ModelError> {
        let z = features_of(features)?
            .iter()
            .fold(self.bias, |acc, (name, x)| {
                acc + self.weights.get(*name).copied().unwrap_or(0.0) * x
            });
        Ok(1.0 / (1.0 + (-z).exp()))
    }
}

fn features_of(value: &Value) -> Result<Vec<(&str, f64)>, ModelError> {
    match value {
        Value::Number(n) => Ok(vec![("x", n.as_f64().unwrap_or(0.0))]),
        Value::Object(map) => Ok(map
            .iter()
            .filter_map(|(name, v)| match v {
                Value::Number(n) => n.as_f64().map(|x| (name.as_str(), x)),
                Value::Bool(b) => Some((name.as_str(), f64::from(u8::from(*b)))),
                _ => None,
            })
            .collect()),
        other => Err(ModelError::new(format!(
            "expected a number or an object of numbers, got {other}"
        ))),
    }
}

fn target_of(value: &Value) -> Result<f64, ModelError> {
    match value {
        Value::Bool(b) => Ok(f64::from(u8::from(*b))),
        Value::Number(n) if n.as_f64() == Some(0.0) => Ok(0.0),
        Value::Number(n) if n.as_f64() == Some(1.0) => Ok(1.0),
        other => Err(ModelError::new(format!(
            "binary target must be true/false or 0/1, got {other}"
        ))),
    }
}

impl Model for LogisticRegression {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn predict(&mut self, features: &Value) -> Result<Value, ModelError> {
        Ok(Value::Bool(self.probability(features)? >= 0.5))
    }

    fn learn(&mut self, features: &Value, target: &Value) -> Result<(), ModelError> {
        let y = target_of(target)?;
        let error = y - self.probability(features)?;
        let step = self.learning_rate * error;

        for (name, x) in features_of(features)? {
            *self.weights.entry(name.to_string()).or_insert(0.0) += step * x;
        }
        self.bias += step;
        Ok(())
    }

    fn save(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl NamedModel for LogisticRegression {
    const KIND: &'static str = "logistic_regression";
}

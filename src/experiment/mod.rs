//! Experiment catalog
//!
//! ## Schema Overview
//!
//! ```text
//! Project (1) ──< FeatureSet (N)
//!    │                 │
//!    └──────< Experiment (N) >── uses one FeatureSet
//!                  │
//!                  └── Progress { cursor, counters, pending predictions }
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use beaver::experiment::{Experiment, ExperimentStore, FeatureSet, Project, ProjectTask};
//! use beaver::stream::ViewDefinition;
//!
//! # fn main() -> beaver::Result<()> {
//! let store = ExperimentStore::new();
//! store.add_project(Project::new("spam", ProjectTask::BinaryClassification, "bus", "sync"))?;
//! store.add_feature_set(FeatureSet::new("words", "spam", ViewDefinition::for_topic("words")))?;
//! store.add_experiment(Experiment::new("baseline", "spam", "words", Vec::new()))?;
//!
//! assert_eq!(store.experiment("baseline")?.stats().n_predictions, 0);
//! # Ok(())
//! # }
//! ```

mod experiment_record;
mod project_record;
mod store;

pub use experiment_record::{
    Experiment, ExperimentBuilder, ExperimentStats, PendingPrediction, Progress,
};
pub use project_record::{FeatureSet, Project, ProjectTask};
pub use store::ExperimentStore;

//! Experiment Store - in-memory catalog of projects, feature sets and experiments
//!
//! All maps are `DashMap`s, so lookups from many cycle threads never contend on a
//! global lock. Readers get owned clones; the only way to change an experiment's
//! model or progress is [`ExperimentStore::commit`], which is a compare-and-swap on
//! the experiment version.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{Experiment, FeatureSet, Progress, Project};
use crate::error::EntityKind;
use crate::stream::ViewDefinition;
use crate::{Error, Result};

/// Catalog of projects, feature sets and experiments.
#[derive(Debug, Default)]
pub struct ExperimentStore {
    projects: DashMap<String, Project>,
    feature_sets: DashMap<String, FeatureSet>,
    experiments: DashMap<String, Experiment>,
}

fn insert_new<V>(map: &DashMap<String, V>, kind: EntityKind, name: &str, value: V) -> Result<()> {
    match map.entry(name.to_string()) {
        Entry::Occupied(_) => Err(Error::already_exists(kind, name)),
        Entry::Vacant(slot) => {
            slot.insert(value);
            Ok(())
        }
    }
}

impl ExperimentStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the store is empty (no projects, feature sets, or experiments).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty() && self.feature_sets.is_empty() && self.experiments.is_empty()
    }

    /// Get the number of experiments in the store.
    #[must_use]
    pub fn experiment_count(&self) -> usize {
        self.experiments.len()
    }

    /// Add a project.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyExists` if the name is taken.
    pub fn add_project(&self, project: Project) -> Result<()> {
        let name = project.name().to_string();
        insert_new(&self.projects, EntityKind::Project, &name, project)
    }

    /// Get a project by name.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such project exists.
    pub fn project(&self, name: &str) -> Result<Project> {
        self.projects
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::not_found(EntityKind::Project, name))
    }

    /// Set (or replace) the target view of a project.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such project exists.
    pub fn set_target(&self, project: &str, view: ViewDefinition) -> Result<()> {
        let mut entry = self
            .projects
            .get_mut(project)
            .ok_or_else(|| Error::not_found(EntityKind::Project, project))?;
        entry.set_target(view);
        Ok(())
    }

    /// Add a feature set to an existing project.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown project and `Error::AlreadyExists`
    /// if the name is taken.
    pub fn add_feature_set(&self, feature_set: FeatureSet) -> Result<()> {
        if !self.projects.contains_key(feature_set.project_name()) {
            return Err(Error::not_found(
                EntityKind::Project,
                feature_set.project_name(),
            ));
        }
        let name = feature_set.name().to_string();
        insert_new(&self.feature_sets, EntityKind::FeatureSet, &name, feature_set)
    }

    /// Get a feature set by name.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such feature set exists.
    pub fn feature_set(&self, name: &str) -> Result<FeatureSet> {
        self.feature_sets
            .get(name)
            .map(|fs| fs.value().clone())
            .ok_or_else(|| Error::not_found(EntityKind::FeatureSet, name))
    }

    /// Add an experiment.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown project or feature set,
    /// `Error::Validation` if the feature set belongs to another project, and
    /// `Error::AlreadyExists` if the name is taken.
    pub fn add_experiment(&self, experiment: Experiment) -> Result<()> {
        if !self.projects.contains_key(experiment.project_name()) {
            return Err(Error::not_found(
                EntityKind::Project,
                experiment.project_name(),
            ));
        }
        let feature_set = self.feature_set(experiment.feature_set_name())?;
        if feature_set.project_name() != experiment.project_name() {
            return Err(Error::Validation(format!(
                "feature set '{}' belongs to project '{}', not '{}'",
                feature_set.name(),
                feature_set.project_name(),
                experiment.project_name()
            )));
        }
        let name = experiment.name().to_string();
        insert_new(&self.experiments, EntityKind::Experiment, &name, experiment)
    }

    /// Get a snapshot of an experiment by name.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no such experiment exists.
    pub fn experiment(&self, name: &str) -> Result<Experiment> {
        self.experiments
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found(EntityKind::Experiment, name))
    }

    /// Names of all experiments of a project, sorted.
    #[must_use]
    pub fn experiments_for_project(&self, project: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .experiments
            .iter()
            .filter(|e| e.project_name() == project)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Atomically replace an experiment's model state and progress.
    ///
    /// Succeeds only if the stored version still equals `expected_version`; returns
    /// the new version.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown experiment and `Error::Conflict` if
    /// another commit landed first.
    pub fn commit(
        &self,
        name: &str,
        expected_version: u64,
        model_state: Vec<u8>,
        progress: Progress,
    ) -> Result<u64> {
        let mut entry = self
            .experiments
            .get_mut(name)
            .ok_or_else(|| Error::not_found(EntityKind::Experiment, name))?;

        if entry.version() != expected_version {
            return Err(Error::Conflict {
                experiment: name.to_string(),
                expected: expected_version,
                found: entry.version(),
            });
        }
        entry.apply_commit(model_state, progress);
        Ok(entry.version())
    }
}

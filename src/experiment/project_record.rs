//! Project and Feature Set records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::ViewDefinition;

/// Learning task of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectTask {
    /// Continuous target.
    Regression,
    /// Two-class target.
    BinaryClassification,
    /// Many-class target.
    MultiClassClassification,
}

/// Project Record: groups experiments that share a message bus, job runner and
/// target view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    name: String,
    task: ProjectTask,
    message_bus: String,
    job_runner: String,
    target: Option<ViewDefinition>,
    created_at: DateTime<Utc>,
}

impl Project {
    /// Create a project with no target view yet.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique project name
    /// * `task` - Learning task
    /// * `message_bus` - Name of a registered message bus
    /// * `job_runner` - Name of a registered job runner
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        task: ProjectTask,
        message_bus: impl Into<String>,
        job_runner: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            task,
            message_bus: message_bus.into(),
            job_runner: job_runner.into(),
            target: None,
            created_at: Utc::now(),
        }
    }

    /// Get the project name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the learning task.
    #[must_use]
    pub const fn task(&self) -> ProjectTask {
        self.task
    }

    /// Name of the message bus events are read from.
    #[must_use]
    pub fn message_bus(&self) -> &str {
        &self.message_bus
    }

    /// Name of the job runner cycles are dispatched to.
    #[must_use]
    pub fn job_runner(&self) -> &str {
        &self.job_runner
    }

    /// Label view, once defined.
    #[must_use]
    pub const fn target(&self) -> Option<&ViewDefinition> {
        self.target.as_ref()
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn set_target(&mut self, view: ViewDefinition) {
        self.target = Some(view);
    }
}

/// Feature Set Record: a named feature view inside a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureSet {
    name: String,
    project_name: String,
    view: ViewDefinition,
}

impl FeatureSet {
    /// Create a feature set.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        project_name: impl Into<String>,
        view: ViewDefinition,
    ) -> Self {
        Self {
            name: name.into(),
            project_name: project_name.into(),
            view,
        }
    }

    /// Get the feature set name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the owning project name.
    #[must_use]
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Feature view.
    #[must_use]
    pub const fn view(&self) -> &ViewDefinition {
        &self.view
    }
}

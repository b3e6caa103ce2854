//! Error types for Beaver
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)
//!
//! Errors split into two families:
//! - **Immediate**: `NotFound`, `AlreadyExists`, `Validation`, `Config` are surfaced to
//!   the caller and never retried.
//! - **Retryable**: `BackendUnavailable`, `Query`, `Model`, `Conflict` abort a cycle
//!   without committing anything; the next trigger retries from the last committed cursor.

use std::fmt;

use thiserror::Error;

use crate::model::ModelError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of catalog entity referenced by an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Project record
    Project,
    /// Experiment record
    Experiment,
    /// Feature set (feature view) record
    FeatureSet,
    /// Target view of a project
    Target,
    /// Registered message bus
    MessageBus,
    /// Registered job runner
    JobRunner,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Project => "project",
            Self::Experiment => "experiment",
            Self::FeatureSet => "feature set",
            Self::Target => "target view",
            Self::MessageBus => "message bus",
            Self::JobRunner => "job runner",
        };
        f.write_str(name)
    }
}

/// Beaver error types
#[derive(Error, Debug)]
pub enum Error {
    /// Referenced entity does not exist
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Entity kind
        kind: EntityKind,
        /// Entity name
        name: String,
    },

    /// Entity name already taken
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Entity kind
        kind: EntityKind,
        /// Entity name
        name: String,
    },

    /// Model or definition rejected at creation time
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Message bus cannot accept writes or serve reads
    #[error("Message bus unavailable: {0}\nThe cycle was not committed and will be retried on the next trigger")]
    BackendUnavailable(String),

    /// Malformed or unsupported view query
    #[error("Query error: {0}")]
    Query(String),

    /// Model predict/learn failed for a row
    #[error("Model failed on key '{key}': {source}\nThe cursor will not advance until the data or the model is fixed")]
    Model {
        /// Key of the row being processed
        key: String,
        /// Underlying model error
        #[source]
        source: ModelError,
    },

    /// Model snapshot envelope is malformed
    #[error("Model envelope error: {0}")]
    Envelope(String),

    /// Experiment state changed underneath a cycle (compare-and-swap failed)
    #[error("Commit conflict on experiment '{experiment}': expected version {expected}, found {found}")]
    Conflict {
        /// Experiment name
        experiment: String,
        /// Version the cycle started from
        expected: u64,
        /// Version found at commit time
        found: u64,
    },

    /// Invalid platform configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn already_exists(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Whether a later trigger may succeed without caller intervention.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::Query(_) | Self::Model { .. } | Self::Conflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found(EntityKind::FeatureSet, "phishing_features");
        assert_eq!(err.to_string(), "feature set 'phishing_features' not found");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Query("bad".to_string()).is_retryable());
        assert!(Error::BackendUnavailable("down".to_string()).is_retryable());
        assert!(Error::Conflict {
            experiment: "e".to_string(),
            expected: 1,
            found: 2
        }
        .is_retryable());
        assert!(!Error::Validation("nope".to_string()).is_retryable());
        assert!(!Error::Config("nope".to_string()).is_retryable());
    }

    #[test]
    fn test_model_error_source() {
        use std::error::Error as _;

        let err = Error::Model {
            key: "7".to_string(),
            source: ModelError::new("shape mismatch"),
        };
        assert!(err.to_string().contains("key '7'"));
        assert!(err.source().is_some());
    }
}

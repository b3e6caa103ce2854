//! # Beaver: Progressive Learning over an Append-Only Event Log
//!
//! **Version**: 0.1.0
//!
//! Beaver trains models incrementally from a stream of feature and label events.
//! Producers append events to a message bus; long-lived experiments repeatedly run
//! a predict-then-learn cycle over everything that arrived since their cursor,
//! without ever materializing the full dataset.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Jidoka**: A cycle either commits completely or not at all; a failing row
//!   stops the line until it is fixed
//! - **Poka-Yoke safety**: One cycle per experiment at a time; commits are
//!   compare-and-swap on the experiment version
//! - **Genchi Genbutsu**: The event log is the source of truth; views are
//!   re-evaluated from it on every cycle
//! - **Heijunka**: Scheduled triggers skip missed ticks and coalesce instead of
//!   queueing a backlog
//!
//! ## Example Usage
//!
//! ```rust
//! use beaver::config::PlatformConfig;
//! use beaver::experiment::ProjectTask;
//! use beaver::model::{MajorityClass, ModelRegistry};
//! use beaver::stream::ViewDefinition;
//! use beaver::{NewExperiment, Platform};
//! use serde_json::json;
//!
//! # fn main() -> beaver::Result<()> {
//! let platform = Platform::from_config(&PlatformConfig::in_memory(), ModelRegistry::with_builtins())?;
//! platform.create_project("spam", ProjectTask::BinaryClassification, "local", "sync")?;
//! platform.define_target("spam", ViewDefinition::for_topic("labels"))?;
//! platform.create_feature_set("words", "spam", ViewDefinition::for_topic("features"))?;
//!
//! let model = platform.seal(&MajorityClass::default())?;
//! platform.create_experiment(NewExperiment::new("baseline", "spam", "words", model))?;
//!
//! platform.publish_json("local", "features", "msg-1", &json!({"links": 4}), None)?;
//! platform.run_cycle("baseline")?;
//! platform.publish_json("local", "labels", "msg-1", &json!(true), None)?;
//! platform.run_cycle("baseline")?;
//!
//! let stats = platform.experiment("baseline")?.stats();
//! assert_eq!((stats.n_predictions, stats.n_learnings), (1, 1));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod model;
pub mod platform;
pub mod query;
pub mod runner;
pub mod scheduler;
pub mod stream;

pub use engine::{CycleOutcome, CycleReport};
pub use error::{Error, Result};
pub use platform::{Dispatch, NewExperiment, Platform};

//! Property-based tests for the learning cycle
//!
//! Pattern:
//! - Test state-machine invariants over random event histories
//! - Run with ProptestConfig::with_cases(64)
//! - Must complete in <30 seconds for pre-commit hook

use beaver::config::PlatformConfig;
use beaver::experiment::ProjectTask;
use beaver::model::{MajorityClass, ModelRegistry};
use beaver::stream::ViewDefinition;
use beaver::{CycleOutcome, NewExperiment, Platform};
use chrono::{DateTime, Utc};
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Property Test Generators (Strategies)
// ============================================================================

/// One step of a producer/trigger interleaving.
#[derive(Debug, Clone)]
enum Step {
    Feature { key: u8, at: u16 },
    Label { key: u8, at: u16, positive: bool },
    Cycle,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0u8..12, 0u16..500).prop_map(|(key, at)| Step::Feature { key, at }),
        3 => (0u8..12, 0u16..500, any::<bool>())
            .prop_map(|(key, at, positive)| Step::Label { key, at, positive }),
        1 => Just(Step::Cycle),
    ]
}

fn ts(offset: u16) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + i64::from(offset), 0).unwrap()
}

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
    let model = platform.seal(&MajorityClass::default()).unwrap();
    platform
        .create_experiment(NewExperiment::new("e", "p", "fs", model))
        .unwrap();
    platform
}

fn apply(platform: &Platform, step: &Step) {
    match step {
        Step::Feature { key, at } => {
            platform
                .publish_json("local", "features", &key.to_string(), &json!({"k": key}), Some(ts(*at)))
                .unwrap();
        }
        Step::Label { key, at, positive } => {
            platform
                .publish_json("local", "labels", &key.to_string(), &json!(positive), Some(ts(*at)))
                .unwrap();
        }
        Step::Cycle => {
            platform.run_cycle("e").unwrap();
        }
    }
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: the cursor never moves backwards
    #[test]
    fn prop_cursor_is_monotonic(steps in proptest::collection::vec(arb_step(), 1..40)) {
        let platform = platform();
        let mut previous = platform.experiment("e").unwrap().stats().cursor;

        for step in &steps {
            apply(&platform, step);
            let cursor = platform.experiment("e").unwrap().stats().cursor;
            prop_assert!(cursor >= previous, "cursor moved back: {:?} -> {:?}", previous, cursor);
            previous = cursor;
        }
    }

    /// Property: n_predictions >= n_learnings and accuracy stays in [0, 1]
    #[test]
    fn prop_counter_ordering(steps in proptest::collection::vec(arb_step(), 1..40)) {
        let platform = platform();

        for step in &steps {
            apply(&platform, step);
            let stats = platform.experiment("e").unwrap().stats();
            prop_assert!(stats.n_predictions >= stats.n_learnings);
            prop_assert!((0.0..=1.0).contains(&stats.accuracy));
        }
    }

    /// Property: a second cycle with no new events changes nothing
    #[test]
    fn prop_repeat_cycle_is_idle(steps in proptest::collection::vec(arb_step(), 1..40)) {
        let platform = platform();
        for step in &steps {
            apply(&platform, step);
        }
        platform.run_cycle("e").unwrap();

        let before = platform.experiment("e").unwrap();
        prop_assert_eq!(platform.run_cycle("e").unwrap(), CycleOutcome::Idle);
        prop_assert_eq!(platform.experiment("e").unwrap(), before);
    }

    /// Property: pending predictions are indexed by their own key and were produced
    /// at or before the committed cursor
    #[test]
    fn prop_pending_keyed_and_behind_cursor(steps in proptest::collection::vec(arb_step(), 1..40)) {
        let platform = platform();
        for step in &steps {
            apply(&platform, step);
        }
        platform.run_cycle("e").unwrap();

        let experiment = platform.experiment("e").unwrap();
        let progress = experiment.progress();
        let cursor = progress.cursor();
        for (key, pending) in progress.pending() {
            prop_assert_eq!(key.as_str(), pending.key());
            prop_assert!(Some(pending.produced_at()) <= cursor);
        }
    }
}

//! Progressive Learning Example
//!
//! Two experiments compete on the same churn project: a majority-class baseline
//! and an online logistic regression. Usage events arrive first, outcomes later,
//! and every cycle predicts the new features before learning the new labels.
//!
//! Run with: cargo run --example progressive_learning
//! Verbose: RUST_LOG=beaver=debug cargo run --example progressive_learning

use anyhow::Result;
use beaver::config::PlatformConfig;
use beaver::experiment::ProjectTask;
use beaver::model::{LogisticRegression, MajorityClass, ModelRegistry};
use beaver::stream::ViewDefinition;
use beaver::{CycleOutcome, NewExperiment, Platform};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const BATCHES: usize = 5;
const CUSTOMERS_PER_BATCH: usize = 40;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("=== Beaver Progressive Learning ===\n");

    // -------------------------------------------------------------------------
    // 1. Platform, project and views
    // -------------------------------------------------------------------------
    println!("1. Setting up the churn project...");

    let platform = Platform::from_config(&PlatformConfig::in_memory(), ModelRegistry::with_builtins())?;
    platform.create_project("churn", ProjectTask::BinaryClassification, "local", "sync")?;
    platform.define_target("churn", ViewDefinition::for_topic("outcomes"))?;
    platform.create_feature_set("usage", "churn", ViewDefinition::for_topic("usage"))?;

    let baseline = platform.seal(&MajorityClass::default())?;
    let logistic = platform.seal(&LogisticRegression::new(0.5))?;
    platform.create_experiment(NewExperiment::new("baseline", "churn", "usage", baseline))?;
    platform.create_experiment(NewExperiment::new("logistic", "churn", "usage", logistic))?;
    println!("   Experiments: baseline (majority class), logistic (lr = 0.5)");

    // -------------------------------------------------------------------------
    // 2. Stream batches through both experiments
    // -------------------------------------------------------------------------
    println!("\n2. Streaming {BATCHES} batches of {CUSTOMERS_PER_BATCH} customers...");

    for batch in 0..BATCHES {
        for i in 0..CUSTOMERS_PER_BATCH {
            let customer = format!("c{batch}-{i}");
            let logins = (i * 7 + batch) % 10;
            platform.publish_json("local", "usage", &customer, &json!({"logins": logins}), None)?;
        }
        // Features are predicted before their outcomes exist
        platform.run_project("churn")?;

        for i in 0..CUSTOMERS_PER_BATCH {
            let customer = format!("c{batch}-{i}");
            let logins = (i * 7 + batch) % 10;
            platform.publish_json("local", "outcomes", &customer, &json!(logins < 3), None)?;
        }

        for (name, outcome) in platform.run_project("churn")? {
            if let CycleOutcome::Committed(report) = outcome? {
                println!(
                    "   batch {batch} {name:<9} learned {:>3}, correct {:>3}",
                    report.learned, report.correct
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // 3. Leaderboard
    // -------------------------------------------------------------------------
    println!("\n3. Final leaderboard:");

    for (name, stats) in platform.project_report("churn")? {
        println!(
            "   {name:<9} predictions {:>4}  learnings {:>4}  accuracy {:.3}",
            stats.n_predictions, stats.n_learnings, stats.accuracy
        );
    }

    // A cycle with no new events is a no-op
    let outcome = platform.run_cycle("logistic")?;
    println!("\n   Re-running with no new events: {outcome:?}");

    println!("\n=== Done ===");
    Ok(())
}

//! Scheduled Sync Example
//!
//! Runs an experiment on a timer against a durable SQLite event log, with cycles
//! executed on a background worker pool. A producer task keeps appending events
//! while the schedule catches the experiment up.
//!
//! Run with: cargo run --example scheduled_sync
//! Verbose: RUST_LOG=beaver=info cargo run --example scheduled_sync

use std::time::Duration;

use anyhow::Result;
use beaver::config::PlatformConfig;
use beaver::experiment::ProjectTask;
use beaver::model::{LogisticRegression, ModelRegistry};
use beaver::stream::ViewDefinition;
use beaver::{NewExperiment, Platform};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const EVENTS: usize = 60;

fn config(db: &std::path::Path) -> Result<PlatformConfig> {
    let text = format!(
        r#"
        [engine]
        contention = "skip"

        [[message_bus]]
        name = "durable"
        protocol = "sqlite"
        url = "{}"

        [[job_runner]]
        name = "background"
        protocol = "asynchronous"
        workers = 2
        "#,
        db.display()
    );
    Ok(PlatformConfig::from_toml_str(&text)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Beaver Scheduled Sync ===\n");

    let dir = std::env::temp_dir().join(format!("beaver-scheduled-sync-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let db = dir.join("events.db");

    let platform = Platform::from_config(&config(&db)?, ModelRegistry::with_builtins())?;
    platform.create_project("sensors", ProjectTask::BinaryClassification, "durable", "background")?;
    platform.define_target("sensors", ViewDefinition::for_topic("alarms"))?;
    platform.create_feature_set("readings", "sensors", ViewDefinition::for_topic("readings"))?;
    let model = platform.seal(&LogisticRegression::default())?;
    platform.create_experiment(NewExperiment::new("detector", "sensors", "readings", model))?;
    println!("1. Log at {}", db.display());

    let handle = platform.schedule("detector", Duration::from_millis(50))?;
    println!("2. Scheduled 'detector' every 50ms");

    let producer = {
        let platform = platform.clone();
        tokio::spawn(async move {
            for i in 0..EVENTS {
                let sensor = format!("s{i}");
                let temperature = 15.0 + (i % 20) as f64;
                platform.publish_json("durable", "readings", &sensor, &json!({"temp": temperature}), None)?;
                tokio::time::sleep(Duration::from_millis(5)).await;
                platform.publish_json("durable", "alarms", &sensor, &json!(temperature > 28.0), None)?;
            }
            Ok::<_, beaver::Error>(())
        })
    };
    producer.await??;
    println!("3. Produced {EVENTS} readings and {EVENTS} alarms");

    let mut stats = platform.experiment("detector")?.stats();
    for _ in 0..100 {
        if stats.n_predictions == EVENTS as u64 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        stats = platform.experiment("detector")?.stats();
    }
    handle.abort();

    println!("\n4. After {} ticks:", handle.ticks());
    println!("   predictions {}", stats.n_predictions);
    println!("   learnings   {}", stats.n_learnings);
    println!("   accuracy    {:.3}", stats.accuracy);
    println!("   cursor      {:?}", stats.cursor);

    std::fs::remove_dir_all(&dir)?;
    println!("\n=== Done ===");
    Ok(())
}

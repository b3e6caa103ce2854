//! Platform configuration
//!
//! Declares the engine settings plus the message buses and job runners a platform
//! starts with. Loaded from TOML:
//!
//! ```toml
//! [engine]
//! contention = "skip"      # or "wait"
//! compression = "none"     # or "lz4" / "zstd" (needs the `compression` feature)
//!
//! [[message_bus]]
//! name = "local"
//! protocol = "memory"
//!
//! [[message_bus]]
//! name = "durable"
//! protocol = "sqlite"
//! url = "/var/lib/beaver/events.db"
//!
//! [[job_runner]]
//! name = "sync"
//! protocol = "synchronous"
//!
//! [[job_runner]]
//! name = "background"
//! protocol = "asynchronous"
//! workers = 4
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bus::BusProtocol;
use crate::engine::ContentionPolicy;
use crate::model::Compression;
use crate::runner::RunnerProtocol;
use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Message buses registered at startup
    #[serde(default, rename = "message_bus")]
    pub message_buses: Vec<MessageBusConfig>,
    /// Job runners registered at startup
    #[serde(default, rename = "job_runner")]
    pub job_runners: Vec<JobRunnerConfig>,
}

/// Engine settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Behaviour when a cycle is triggered while one is running
    #[serde(default)]
    pub contention: ContentionPolicy,
    /// Compression for sealed model snapshots
    #[serde(default)]
    pub compression: Compression,
}

/// A message bus to open at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageBusConfig {
    /// Registry name
    pub name: String,
    /// Backend
    pub protocol: BusProtocol,
    /// Backend location (database file path for sqlite)
    #[serde(default)]
    pub url: Option<String>,
}

/// A job runner to start at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRunnerConfig {
    /// Registry name
    pub name: String,
    /// Implementation
    pub protocol: RunnerProtocol,
    /// Pool size for asynchronous runners
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

impl PlatformConfig {
    /// Parse and validate TOML.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the text is not valid TOML for this schema or
    /// fails [`PlatformConfig::validate`].
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read, otherwise as
    /// [`PlatformConfig::from_toml_str`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Single in-memory bus named `local` and a synchronous runner named `sync`.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            engine: EngineConfig::default(),
            message_buses: vec![MessageBusConfig {
                name: "local".to_string(),
                protocol: BusProtocol::Memory,
                url: None,
            }],
            job_runners: vec![JobRunnerConfig {
                name: "sync".to_string(),
                protocol: RunnerProtocol::Synchronous,
                workers: 1,
            }],
        }
    }

    /// Check cross-field rules.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for duplicate names, blank names, a sqlite bus without
    /// a url, an asynchronous runner with zero workers, or a compression algorithm
    /// this build does not support.
    pub fn validate(&self) -> Result<()> {
        if !self.engine.compression.is_available() {
            return Err(Error::Config(format!(
                "compression '{}' requires the `compression` feature",
                self.engine.compression.as_str()
            )));
        }

        let mut seen = HashSet::new();
        for bus in &self.message_buses {
            check_name("message_bus", &bus.name, &mut seen)?;
            if bus.protocol == BusProtocol::Sqlite
                && bus.url.as_deref().map_or(true, |url| url.trim().is_empty())
            {
                return Err(Error::Config(format!(
                    "message_bus '{}': sqlite protocol requires a url",
                    bus.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for runner in &self.job_runners {
            check_name("job_runner", &runner.name, &mut seen)?;
            if runner.protocol == RunnerProtocol::Asynchronous && runner.workers == 0 {
                return Err(Error::Config(format!(
                    "job_runner '{}': asynchronous runners need at least one worker",
                    runner.name
                )));
            }
        }
        Ok(())
    }
}

fn check_name<'a>(section: &str, name: &'a str, seen: &mut HashSet<&'a str>) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Config(format!("{section} name must not be empty")));
    }
    if !seen.insert(name) {
        return Err(Error::Config(format!("duplicate {section} name '{name}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults() {
        let config = PlatformConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine.contention, ContentionPolicy::Skip);
        assert_eq!(config.engine.compression, Compression::None);
        assert!(config.message_buses.is_empty());
        assert!(config.job_runners.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = PlatformConfig::from_toml_str(
            r#"
            [engine]
            contention = "wait"

            [[message_bus]]
            name = "local"
            protocol = "memory"

            [[message_bus]]
            name = "durable"
            protocol = "sqlite"
            url = "/tmp/events.db"

            [[job_runner]]
            name = "bg"
            protocol = "asynchronous"
            workers = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.contention, ContentionPolicy::Wait);
        assert_eq!(config.message_buses.len(), 2);
        assert_eq!(config.message_buses[1].url.as_deref(), Some("/tmp/events.db"));
        assert_eq!(config.job_runners[0].workers, 3);
    }

    #[test]
    fn test_validation_errors() {
        for (text, needle) in [
            (
                "[[message_bus]]\nname = \"a\"\nprotocol = \"sqlite\"",
                "requires a url",
            ),
            (
                "[[message_bus]]\nname = \"a\"\nprotocol = \"memory\"\n\
                 [[message_bus]]\nname = \"a\"\nprotocol = \"memory\"",
                "duplicate message_bus name 'a'",
            ),
            (
                "[[job_runner]]\nname = \"a\"\nprotocol = \"asynchronous\"\nworkers = 0",
                "at least one worker",
            ),
            ("[engine]\ncontention = \"sometimes\"", "invalid config"),
            ("[[job_runner]]\nname = \"\"\nprotocol = \"synchronous\"", "must not be empty"),
        ] {
            let err = PlatformConfig::from_toml_str(text).unwrap_err();
            assert!(matches!(err, Error::Config(_)));
            assert!(err.to_string().contains(needle), "{err} should mention {needle}");
        }
    }

    #[test]
    fn test_in_memory_preset_is_valid() {
        assert!(PlatformConfig::in_memory().validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beaver.toml");
        std::fs::write(&path, "[engine]\ncontention = \"skip\"\n").unwrap();
        assert!(PlatformConfig::from_file(&path).is_ok());
        assert!(matches!(
            PlatformConfig::from_file(dir.path().join("missing.toml")),
            Err(Error::Io(_))
        ));
    }
}

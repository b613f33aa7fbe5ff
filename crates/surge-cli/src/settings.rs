//! Settings file and environment overrides.
//!
//! ```toml
//! target = "http://127.0.0.1:8080/"
//!
//! [options]
//! vus = 20
//! duration = "30s"
//!
//! [[sinks]]
//! kind = "json-file"
//! path = "results.jsonl"
//!
//! [cluster]
//! node_id = 2
//! seeds = ["10.0.0.1:7946"]
//! ```
//!
//! Environment variables prefixed `SURGE_` override the file, with `__`
//! between nested keys: `SURGE_OPTIONS__VUS=50`, `SURGE_CLUSTER__LISTEN=...`.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use surge_cluster::ClusterConfig;
use surge_core::WorkflowOptions;
use surge_engine::{EngineConfig, SinkConfig};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    /// Base URL the demo workflows hit
    #[serde(default = "default_target")]
    pub target: String,

    /// Replaces each workflow's own options when present
    #[serde(default)]
    pub options: Option<WorkflowOptions>,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default = "default_sinks")]
    pub sinks: Vec<SinkConfig>,

    #[serde(default)]
    pub cluster: ClusterConfig,
}

fn default_target() -> String {
    "http://127.0.0.1:8080/".to_string()
}

fn default_sinks() -> Vec<SinkConfig> {
    vec![SinkConfig::new("console")]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target: default_target(),
            options: None,
            engine: EngineConfig::default(),
            sinks: default_sinks(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Settings {
    /// Load `path` (optional on disk) and apply `SURGE_*` overrides
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("SURGE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("reading settings from {}", path.display()))?;
        settings
            .try_deserialize()
            .with_context(|| format!("invalid settings in {}", path.display()))
    }
}

/// Split `key=value`
pub fn parse_override(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.target, "http://127.0.0.1:8080/");
        assert!(settings.options.is_none());
        assert_eq!(settings.sinks, vec![SinkConfig::new("console")]);
    }

    #[test]
    fn test_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("surge.toml");
        std::fs::write(
            &path,
            r#"
target = "http://example.test/"

[options]
vus = 7
duration = "2s"

[[sinks]]
kind = "json-file"
path = "out.jsonl"

[cluster]
node_id = 4
seeds = ["10.0.0.1:7946"]

[cluster.replication]
election_timeout = "1s"
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.target, "http://example.test/");
        let options = settings.options.unwrap();
        assert_eq!(options.vus, 7);
        assert_eq!(options.duration, Duration::from_secs(2));
        assert_eq!(settings.sinks[0].kind, "json-file");
        assert_eq!(settings.cluster.node_id.0, 4);
        assert_eq!(settings.cluster.seeds.len(), 1);
        assert_eq!(
            settings.cluster.replication.election_timeout,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("vus=10").unwrap(),
            ("vus".to_string(), "10".to_string())
        );
        assert_eq!(
            parse_override(" rate = 5/s ").unwrap(),
            ("rate".to_string(), "5/s".to_string())
        );
        assert!(parse_override("vus").is_err());
        assert!(parse_override("=3").is_err());
    }
}

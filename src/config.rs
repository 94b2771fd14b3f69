//! Configuration management for the restore agent.
//!
//! Loads configuration from a TOML file with serde defaults. The `restore`
//! section mirrors the restore sub-config of the control database's
//! persistent config document; when both are present, the control document
//! wins and this file is the fallback.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub restore: RestoreTuning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity this agent registers under, `host:port` of the local
    /// database process.
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Tuning knobs of the physical restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTuning {
    /// Parallel artifact download streams the storage backend may use.
    #[serde(default = "default_download_workers")]
    pub num_download_workers: usize,

    /// Upper bound on the in-flight download buffer, in MiB.
    #[serde(default = "default_download_buffer_mb")]
    pub max_download_buffer_mb: usize,

    /// Copy/download chunk size, in MiB.
    #[serde(default = "default_download_chunk_mb")]
    pub download_chunk_mb: usize,

    /// Database binary used for the supervised boots. Defaults to a `PATH`
    /// lookup of `mongod`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongod_location: Option<String>,

    /// Per-host overrides of `mongod_location`, keyed by node identity.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub mongod_location_map: HashMap<String, String>,
}

impl Default for RestoreTuning {
    fn default() -> Self {
        Self {
            num_download_workers: default_download_workers(),
            max_download_buffer_mb: default_download_buffer_mb(),
            download_chunk_mb: default_download_chunk_mb(),
            mongod_location: None,
            mongod_location_map: HashMap::new(),
        }
    }
}

impl RestoreTuning {
    /// Resolve the database binary for a given node identity.
    pub fn mongod_for(&self, node: &str) -> String {
        if let Some(m) = self.mongod_location_map.get(node) {
            return m.clone();
        }
        self.mongod_location
            .clone()
            .unwrap_or_else(|| "mongod".to_string())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_download_workers() -> usize {
    2
}

fn default_download_buffer_mb() -> usize {
    0
}

fn default_download_chunk_mb() -> usize {
    32
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default() -> Self {
        Config {
            node: NodeConfig {
                id: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .map(|h| format!("{h}:27017"))
                    .unwrap_or_else(|| "localhost:27017".to_string()),
            },
            log: LogConfig::default(),
            restore: RestoreTuning::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_tuning_defaults() {
        let t: RestoreTuning = toml::from_str("").unwrap();
        assert_eq!(t.download_chunk_mb, 32);
        assert_eq!(t.mongod_for("any-host:27017"), "mongod");
    }

    #[test]
    fn test_mongod_location_map_wins() {
        let t: RestoreTuning = toml::from_str(
            r#"
            mongod_location = "/opt/db/bin/mongod"

            [mongod_location_map]
            "n2:27017" = "/usr/local/bin/mongod"
            "#,
        )
        .unwrap();

        assert_eq!(t.mongod_for("n1:27017"), "/opt/db/bin/mongod");
        assert_eq!(t.mongod_for("n2:27017"), "/usr/local/bin/mongod");
    }
}

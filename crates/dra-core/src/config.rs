//! dra.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_LOG_FILTER: &str = "info,dra=debug";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Attempts per claim before a counter or version conflict is surfaced.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Node allocations are made for when none is given on the command line.
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("dra.redb")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            node_name: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

impl DraConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DraConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a dra.toml for a store at `store_path`.
    pub fn scaffold(store_path: &Path, node_name: Option<&str>) -> Self {
        DraConfig {
            store: StoreConfig {
                path: store_path.to_path_buf(),
            },
            allocator: AllocatorConfig {
                node_name: node_name.map(str::to_string),
                ..AllocatorConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold() {
        let config = DraConfig::scaffold(Path::new("/var/lib/dra/state.redb"), Some("node-1"));
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("/var/lib/dra/state.redb"));
        assert!(toml_str.contains("node-1"));
        let back: DraConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config: DraConfig = toml::from_str("").unwrap();
        assert_eq!(config.store.path, PathBuf::from("dra.redb"));
        assert_eq!(config.allocator.max_attempts, 5);
        assert_eq!(config.logging.filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[allocator]
max_attempts = 10
node_name = "node-7"
"#;
        let config: DraConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.allocator.max_attempts, 10);
        assert_eq!(config.allocator.retry_backoff_ms, 50);
        assert_eq!(config.allocator.node_name.as_deref(), Some("node-7"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dra.toml");
        std::fs::write(&path, "[logging]\nfilter = \"warn\"\n").unwrap();
        let config = DraConfig::from_file(&path).unwrap();
        assert_eq!(config.logging.filter, "warn");
    }
}

use crate::error::Result;
use crate::plugin::AutoIdStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Store configuration, read from an optional `forkdb.yaml` next to the
/// database. Every field has a default so the file can be absent or
/// partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file name inside the store directory.
    pub database_file: String,
    /// How long a unit of work waits on a locked database before the
    /// transaction is rolled back and reported as a conflict.
    pub busy_timeout_ms: u64,
    /// Id strategy used by the row-id plugin for rows created without
    /// an explicit id.
    pub auto_id: AutoIdStrategy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database_file: "forkdb.db".to_string(),
            busy_timeout_ms: 5_000,
            auto_id: AutoIdStrategy::Ulid,
        }
    }
}

pub const CONFIG_FILE: &str = "forkdb.yaml";

impl StoreConfig {
    /// Load the config from `<dir>/forkdb.yaml`, falling back to
    /// defaults when the file does not exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(StoreConfig::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = StoreConfig::parse("{}").unwrap();
        assert_eq!(config.database_file, "forkdb.db");
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert!(matches!(config.auto_id, AutoIdStrategy::Ulid));
    }

    #[test]
    fn partial_file_overrides_some_fields() {
        let config = StoreConfig::parse("busy_timeout_ms: 250\nauto_id: nanoid\n").unwrap();
        assert_eq!(config.busy_timeout_ms, 250);
        assert!(matches!(config.auto_id, AutoIdStrategy::Nanoid));
        assert_eq!(config.database_file, "forkdb.db");
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::load(dir.path()).unwrap();
        assert_eq!(config.busy_timeout_ms, 5_000);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "database_file: data.db\n").unwrap();
        let config = StoreConfig::load(dir.path()).unwrap();
        assert_eq!(config.database_file, "data.db");
    }
}

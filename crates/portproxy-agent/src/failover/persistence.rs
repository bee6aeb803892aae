//! Saving and loading the failover state file

use portproxy_proto::FailoverConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_STATE_FILE: &str = "failover_config.json";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid failover state in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to serialize failover state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failover configuration file, written as indented camelCase JSON
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved configuration; `None` when no file exists yet
    pub async fn load(&self) -> Result<Option<FailoverConfig>, PersistenceError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let config = serde_json::from_str(&contents).map_err(|source| PersistenceError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(config))
    }

    /// Write the configuration, replacing the file atomically
    pub async fn save(&self, config: &FailoverConfig) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(config)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let write_err = |source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        tokio::fs::write(&tmp, json).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(write_err)?;

        debug!(path = %self.path.display(), "Failover configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_loads_none() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join(DEFAULT_STATE_FILE));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load_keeps_runtime_state() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("state").join(DEFAULT_STATE_FILE));

        let config = FailoverConfig {
            enabled: true,
            health_url_a: "http://a/health".to_string(),
            health_url_b: "http://b/health".to_string(),
            server_mappings: BTreeMap::from([("10.0.0.1".to_string(), "10.0.0.2".to_string())]),
            currently_failed_over: true,
            last_failover_time: Some(Utc::now()),
            consecutive_failures_a: 3,
            ..FailoverConfig::default()
        };
        store.save(&config).await.unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\n  \"enabled\": true"));
        assert!(text.contains("\"currentlyFailedOver\": true"));

        assert_eq!(store.load().await.unwrap(), Some(config));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_STATE_FILE);
        std::fs::write(&path, "{not json").unwrap();

        let err = ConfigStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, PersistenceError::Parse { .. }));
    }
}

//! Key-value backends for checkpoints
//!
//! `set` stages a value, `save` makes every staged value durable. The file backend
//! keeps all keys in one JSON document and replaces it atomically on save.

use crate::error::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn init(&self) -> ConnectorResult<()>;

    async fn get(&self, key: &str) -> ConnectorResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> ConnectorResult<()>;

    /// Persist everything staged by `set`
    async fn save(&self) -> ConnectorResult<()>;
}

/// Which backend holds the checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Lost on restart
    #[default]
    Memory,
    /// JSON document on local disk
    File { path: PathBuf },
}

impl StoreConfig {
    pub fn open(&self) -> Arc<dyn KvStore> {
        match self {
            Self::Memory => Arc::new(MemoryKvStore::new()),
            Self::File { path } => Arc::new(FileKvStore::new(path)),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, String>>,
    saves: AtomicU64,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn init(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> ConnectorResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> ConnectorResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn save(&self) -> ConnectorResult<()> {
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Single-file store with write-to-temp, fsync, rename
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileKvStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn init(&self) -> ConnectorResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "checkpoint file does not exist yet");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let loaded: BTreeMap<String, String> = serde_json::from_str(&contents).map_err(|e| {
            ConnectorError::state(format!("corrupt store {}: {}", self.path.display(), e))
        })?;
        info!(path = %self.path.display(), keys = loaded.len(), "opened checkpoint file");
        *self.entries.write().await = loaded;
        Ok(())
    }

    async fn get(&self, key: &str) -> ConnectorResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> ConnectorResult<()> {
        if key.is_empty() {
            return Err(ConnectorError::state("empty checkpoint key"));
        }
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn save(&self) -> ConnectorResult<()> {
        let json = {
            let entries = self.entries.read().await;
            serde_json::to_string_pretty(&*entries)?
        };

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        debug!(path = %self.path.display(), "checkpoint file saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("checkpoints.json");

        let store = FileKvStore::new(&path);
        store.init().await.unwrap();
        assert_eq!(store.get("vsphere").await.unwrap(), None);

        store.set("vsphere", "{\"lastEventKey\":3}".to_string()).await.unwrap();
        store.save().await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reopened = FileKvStore::new(&path);
        reopened.init().await.unwrap();
        assert_eq!(
            reopened.get("vsphere").await.unwrap().as_deref(),
            Some("{\"lastEventKey\":3}")
        );
    }

    #[tokio::test]
    async fn test_unsaved_values_are_not_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");

        let store = FileKvStore::new(&path);
        store.init().await.unwrap();
        store.set("a", "1".to_string()).await.unwrap();

        let reopened = FileKvStore::new(&path);
        reopened.init().await.unwrap();
        assert_eq!(reopened.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, "{broken").unwrap();

        let store = FileKvStore::new(&path);
        assert!(matches!(store.init().await, Err(ConnectorError::State(_))));
    }

    #[test]
    fn test_store_config() {
        let config: StoreConfig = serde_yaml::from_str("type: file\npath: /var/lib/vmevent/cp.json").unwrap();
        assert_eq!(
            config,
            StoreConfig::File {
                path: PathBuf::from("/var/lib/vmevent/cp.json")
            }
        );
        let config: StoreConfig = serde_yaml::from_str("type: memory").unwrap();
        assert_eq!(config, StoreConfig::Memory);
    }
}

// Durable key-value storage for settings
//
// The real app hands us an encrypted preferences store; the core only needs
// get/set of string values.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::errors::{CoreError, CoreResult};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;
    async fn set(&self, key: &str, value: String) -> CoreResult<()>;
}

/// Read a JSON value. A value that no longer parses is treated as absent so a
/// schema change never bricks startup.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> CoreResult<Option<T>> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Ignoring unreadable value for {}: {}", key, e);
            Ok(None)
        }
    }
}

/// Read a JSON value that must not be silently replaced. A value that no
/// longer parses is a `PersistenceFailure`.
pub async fn get_json_strict<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> CoreResult<Option<T>> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| CoreError::persistence(key, format!("unreadable stored value: {}", e)))
}

pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> CoreResult<()> {
    let raw = serde_json::to_string(value).map_err(|e| CoreError::persistence(key, e))?;
    store.set(key, raw).await
}

/// In-memory store, mostly for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> CoreResult<()> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }
}

/// All keys in one JSON document, rewritten through a temp file + rename
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    pub async fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let path_str = path.display().to_string();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::persistence(&path_str, e))?;
            }
        }

        let values = match tokio::fs::read_to_string(&path).await {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!("Settings file {} is corrupt, starting empty: {}", path_str, e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(CoreError::persistence(&path_str, e)),
        };

        debug!("Opened settings store {} ({} keys)", path_str, values.len());

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> CoreResult<()> {
        let mut values = self.values.lock().await;
        let previous = values.insert(key.to_string(), value);

        let json = serde_json::to_string_pretty(&*values).map_err(|e| CoreError::persistence(key, e))?;
        let tmp = self.path.with_extension("json.tmp");
        let written = async {
            tokio::fs::write(&tmp, json).await?;
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(e) = written {
            // Keep memory and disk in agreement
            match previous {
                Some(old) => values.insert(key.to_string(), old),
                None => values.remove(key),
            };
            return Err(CoreError::persistence(key, e));
        }
        Ok(())
    }
}

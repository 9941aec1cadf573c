use std::{
    collections::HashMap,
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::{
    sync::{Mutex, RwLock},
    task,
};
use tracing::{debug, info};

use crate::error::{HostError, HostResult};

/// Key/value area the host persists its state into.
///
/// `set` must apply all items or none: the state store writes the state blob
/// and the per-plugin flags in one call.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> HostResult<Option<Value>>;
    async fn set(&self, items: Vec<(String, Value)>) -> HostResult<()>;
    async fn remove(&self, keys: &[String]) -> HostResult<()>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").field("impl", &self.name()).finish()
    }
}

pub struct InMemoryStorage {
    store: RwLock<HashMap<String, Value>>,
}

impl InMemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { store: RwLock::new(HashMap::new()) })
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> HostResult<Option<Value>> {
        Ok(self.store.read().await.get(key).cloned())
    }

    async fn set(&self, items: Vec<(String, Value)>) -> HostResult<()> {
        let mut w = self.store.write().await;
        for (k, v) in items {
            w.insert(k, v);
        }
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> HostResult<()> {
        let mut w = self.store.write().await;
        for k in keys {
            w.remove(k);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "InMemoryStorage"
    }
}

/// A single JSON document on disk, replaced atomically on every write.
/// Disk access runs on the blocking pool.
pub struct FileStorage {
    path: PathBuf,
    cache: Mutex<Option<HashMap<String, Value>>>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { path: path.into(), cache: Mutex::new(None) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> HostResult<HashMap<String, Value>> {
        let path = self.path.clone();
        task::spawn_blocking(move || read_from_disk(&path))
            .await
            .map_err(|e| HostError::Persistence(format!("storage read task failed: {e}")))?
    }

    async fn modify<F>(&self, f: F) -> HostResult<()>
    where
        F: FnOnce(&mut HashMap<String, Value>),
    {
        let mut guard = self.cache.lock().await;
        let mut next = match guard.as_ref() {
            Some(map) => map.clone(),
            None => self.load().await?,
        };
        f(&mut next);
        let path = self.path.clone();
        let next = task::spawn_blocking(move || write_to_disk(&path, &next).map(|()| next))
            .await
            .map_err(|e| HostError::Persistence(format!("storage write task failed: {e}")))??;
        *guard = Some(next);
        Ok(())
    }
}

fn read_from_disk(path: &Path) -> HostResult<HashMap<String, Value>> {
    if !path.exists() {
        info!("No storage file at {}, starting empty", path.display());
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(&raw)
        .map_err(|e| HostError::Persistence(format!("corrupt storage file {}: {e}", path.display())))
}

fn write_to_disk(path: &Path, map: &HashMap<String, Value>) -> HostResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let body = serde_json::to_vec_pretty(map).map_err(|e| HostError::Persistence(e.to_string()))?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| HostError::Persistence(e.error.to_string()))?;
    debug!("Wrote {} keys to {}", map.len(), path.display());
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> HostResult<Option<Value>> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        Ok(guard.as_ref().and_then(|m| m.get(key).cloned()))
    }

    async fn set(&self, items: Vec<(String, Value)>) -> HostResult<()> {
        self.modify(|map| {
            for (k, v) in items {
                map.insert(k, v);
            }
        })
        .await
    }

    async fn remove(&self, keys: &[String]) -> HostResult<()> {
        self.modify(|map| {
            for k in keys {
                map.remove(k);
            }
        })
        .await
    }

    fn name(&self) -> &'static str {
        "FileStorage"
    }
}

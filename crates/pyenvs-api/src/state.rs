//! Persisted key-value state.
//!
//! Values are stored as JSON. A file-backed store rewrites its whole file on
//! every mutation; the in-memory store is used by tests and short-lived
//! tools.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

/// Key-value store with write verification.
pub struct PersistentState {
    path: Option<PathBuf>,
    values: Mutex<Map<String, Value>>,
}

impl PersistentState {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Mutex::new(Map::new()),
        }
    }

    /// Open (or start) a store backed by `path`.
    ///
    /// A missing file starts empty. An unreadable or invalid file is logged
    /// and also starts empty, so a corrupt state file never blocks startup.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<Map<String, Value>>(&contents) {
                Ok(values) => {
                    info!("[state] Loaded {} keys from {:?}", values.len(), path);
                    values
                }
                Err(e) => {
                    warn!("[state] Ignoring invalid state file {:?}: {}", path, e);
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read state file {:?}", path))
            }
        };

        Ok(Self {
            path: Some(path),
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let values = self.values.lock().await;
        let value = values.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("[state] Value for {} has unexpected shape: {}", key, e);
                None
            }
        }
    }

    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).await.unwrap_or(default)
    }

    /// Store `value` under `key`.
    ///
    /// The written file is read back and compared. On a mismatch the key is
    /// cleared again and an error is logged. A failed write leaves the
    /// previous value in place.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize state value for {}", key))?;

        let mut values = self.values.lock().await;
        let previous = values.insert(key.to_string(), value.clone());
        if let Err(e) = self.flush(&values).await {
            match previous {
                Some(previous) => values.insert(key.to_string(), previous),
                None => values.remove(key),
            };
            return Err(e);
        }
        self.verify(&mut values, key, &value).await
    }

    /// Remove the given keys, or everything when `keys` is `None`.
    pub async fn clear(&self, keys: Option<&[&str]>) -> Result<()> {
        let mut values = self.values.lock().await;
        match keys {
            Some(keys) => {
                for key in keys {
                    values.remove(*key);
                }
            }
            None => values.clear(),
        }
        self.flush(&values).await
    }

    async fn flush(&self, values: &Map<String, Value>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(values)?;
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write state file {:?}", path))
    }

    /// Compare the file's copy of `key` with `expected`, dropping the key
    /// when they differ. The in-memory store has no file to compare with.
    async fn verify(
        &self,
        values: &mut Map<String, Value>,
        key: &str,
        expected: &Value,
    ) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read back state file {:?}", path))?;
        let stored = serde_json::from_str::<Map<String, Value>>(&contents)
            .ok()
            .and_then(|mut on_disk| on_disk.remove(key));

        if stored.as_ref() != Some(expected) {
            error!(
                "[state] Value for {} did not round-trip (wrote {}, read {:?}); clearing it",
                key, expected, stored
            );
            values.remove(key);
            self.flush(values).await?;
        }
        Ok(())
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;

use super::backend::StorageBackend;
use crate::errors::{Result, SkAuthError};

/// Durable-plain backend: one pretty-printed JSON object on disk
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl JsonFileBackend {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            write_guard: Mutex::new(()),
        })
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                SkAuthError::InvalidResponse(format!(
                    "Invalid metadata file {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for JsonFileBackend {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load().await?.remove(key))
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let mut entries = self.load().await?;
        let before = entries.len();
        for key in keys {
            entries.remove(key);
        }
        if entries.len() != before {
            self.save(&entries).await?;
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, String)>> {
        Ok(self.load().await?.into_iter().collect())
    }
}

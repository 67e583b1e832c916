use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::{Result, SkAuthError};

/// Durable key-value storage used by [`super::TokenStore`]
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove every listed key; missing keys are not an error
    async fn delete(&self, keys: &[String]) -> Result<()>;

    async fn entries(&self) -> Result<Vec<(String, String)>>;
}

/// In-memory backend for tests and ephemeral sessions
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> SkAuthError {
        SkAuthError::StorageUnavailable("lock poisoned".to_string())
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| Self::poisoned())?
            .get(key)
            .cloned())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| Self::poisoned())?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Stand-in for a backend that could not be opened on this device
#[derive(Debug, Clone)]
pub struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> SkAuthError {
        SkAuthError::StorageUnavailable(self.reason.clone())
    }
}

#[async_trait::async_trait]
impl StorageBackend for UnavailableBackend {
    async fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(self.error())
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(self.error())
    }

    async fn delete(&self, _keys: &[String]) -> Result<()> {
        Err(self.error())
    }

    async fn entries(&self) -> Result<Vec<(String, String)>> {
        Err(self.error())
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use fs2::FileExt;
use tokio::fs;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use super::backend::StorageBackend;
use crate::crypto::{self, EncryptedBlob};
use crate::errors::{Result, SkAuthError};
use crate::key_manager::{KdfParams, KeyManager};
use crate::secret::SecretProvider;

const LOCK_ATTEMPTS: u32 = 20;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Encrypted durable-secure backend
///
/// Every logical key is stored in its own AES-256-GCM encrypted file.
/// The key comes from the OS keyring with a passphrase fallback.
///
/// # Directory Structure
/// ```text
/// <data dir>/secure/
/// ├── meta.json              # Key metadata (store id, salt, KDF params)
/// ├── lock                   # Advisory lock file
/// └── entries/
///     └── <base64url(key)>.json
/// ```
#[derive(Debug)]
pub struct EncryptedFileBackend {
    entries_dir: PathBuf,
    lock_file: PathBuf,
    key_manager: KeyManager,
    /// Serializes writers inside this process; the file lock covers other processes
    write_guard: Mutex<()>,
}

impl EncryptedFileBackend {
    pub async fn open(
        storage_dir: impl AsRef<Path>,
        secret_provider: Arc<dyn SecretProvider>,
    ) -> Result<Self> {
        Self::open_with_kdf(storage_dir, secret_provider, KdfParams::default()).await
    }

    pub async fn open_with_kdf(
        storage_dir: impl AsRef<Path>,
        secret_provider: Arc<dyn SecretProvider>,
        kdf: KdfParams,
    ) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        let entries_dir = storage_dir.join("entries");

        fs::create_dir_all(&entries_dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(&storage_dir, perms.clone())?;
            std::fs::set_permissions(&entries_dir, perms)?;
        }

        let key_manager = KeyManager::open(&storage_dir, secret_provider, kdf).await?;

        Ok(Self {
            lock_file: storage_dir.join("lock"),
            entries_dir,
            key_manager,
            write_guard: Mutex::new(()),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.entries_dir
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(key)))
    }

    fn key_from_path(path: &Path) -> Option<String> {
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = URL_SAFE_NO_PAD.decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Exclusive advisory lock, retried briefly before giving up
    async fn acquire_lock(&self) -> Result<std::fs::File> {
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)?;

        for _ in 0..LOCK_ATTEMPTS {
            if lock_file.try_lock_exclusive().is_ok() {
                return Ok(lock_file);
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }

        Err(SkAuthError::LockTimeout)
    }

    async fn read_entry(&self, key: &str, path: &Path) -> Result<Option<String>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let encrypted: EncryptedBlob = serde_json::from_str(&content)
            .map_err(|e| SkAuthError::InvalidResponse(format!("Invalid encrypted data: {}", e)))?;
        let plaintext = Zeroizing::new(crypto::decrypt(
            self.key_manager.key(),
            &encrypted,
            key,
        )?);

        let value = std::str::from_utf8(&plaintext)
            .map_err(|_| SkAuthError::CorruptedStore)?
            .to_string();
        Ok(Some(value))
    }

    async fn write_entry(&self, key: &str, value: &str) -> Result<()> {
        let path = self.entry_path(key);
        let encrypted = crypto::encrypt(self.key_manager.key(), value.as_bytes(), key)?;
        let encrypted_json = serde_json::to_string_pretty(&encrypted)?;

        // Atomic write: temp file, fsync, rename
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, encrypted_json).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        fs::File::open(&temp_path).await?.sync_all().await?;
        fs::rename(&temp_path, &path).await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for EncryptedFileBackend {
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let _lock = self.acquire_lock().await?;
        self.write_entry(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.read_entry(key, &self.entry_path(key)).await
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let _lock = self.acquire_lock().await?;

        for key in keys {
            match fs::remove_file(self.entry_path(key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, String)>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.entries_dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(key) = Self::key_from_path(&path) else {
                continue;
            };
            match self.read_entry(&key, &path).await {
                Ok(Some(value)) => entries.push((key, value)),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable secure entry {}: {}", key, e),
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::StaticSecretProvider;
    use tempfile::TempDir;

    async fn open(dir: &Path, passphrase: &str) -> Result<EncryptedFileBackend> {
        let provider = Arc::new(StaticSecretProvider::new(passphrase));
        EncryptedFileBackend::open_with_kdf(dir, provider, KdfParams::light()).await
    }

    #[tokio::test]
    async fn test_set_get_replace() {
        let temp = TempDir::new().unwrap();
        let backend = open(temp.path(), "pw").await.unwrap();

        assert_eq!(backend.get("session:access").await.unwrap(), None);

        backend.set("session:access", "one").await.unwrap();
        backend.set("session:access", "two").await.unwrap();
        assert_eq!(
            backend.get("session:access").await.unwrap().as_deref(),
            Some("two")
        );
        assert_eq!(backend.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_values_are_not_stored_in_plaintext() {
        let temp = TempDir::new().unwrap();
        let backend = open(temp.path(), "pw").await.unwrap();
        backend.set("session:refresh", "plain-secret").await.unwrap();

        let raw = std::fs::read_to_string(backend.entry_path("session:refresh")).unwrap();
        assert!(!raw.contains("plain-secret"));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let backend = open(temp.path(), "pw").await.unwrap();
            backend.set("provider/inkwell:refresh", "r1").await.unwrap();
        }

        let backend = open(temp.path(), "pw").await.unwrap();
        assert_eq!(
            backend.get("provider/inkwell:refresh").await.unwrap().as_deref(),
            Some("r1")
        );
        let keys: Vec<String> = backend
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["provider/inkwell:refresh".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_ignores_missing_keys() {
        let temp = TempDir::new().unwrap();
        let backend = open(temp.path(), "pw").await.unwrap();
        backend.set("a", "1").await.unwrap();
        backend.set("b", "2").await.unwrap();

        backend
            .delete(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();

        assert_eq!(backend.get("a").await.unwrap(), None);
        assert_eq!(backend.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_concurrent_writers_in_one_process() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(open(temp.path(), "pw").await.unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.set(&format!("provider/p{i}:refresh"), "v").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(backend.entries().await.unwrap().len(), 8);
    }
}

//! Layered token persistence.
//!
//! * durable-secure: every token kind, encrypted at rest
//! * durable-plain: non-sensitive session/profile metadata
//! * process-local cache: synchronous mirror of durable-plain
//!
//! Backend failures stop here. They are logged and reported as absent or
//! `false`, so callers degrade to "not authenticated" instead of failing.

mod backend;
mod cache;
mod encrypted;
mod json;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

pub use backend::{MemoryBackend, StorageBackend, UnavailableBackend};
pub use cache::LocalCache;
pub use encrypted::EncryptedFileBackend;
pub use json::JsonFileBackend;

use crate::config::TOKEN_EXPIRY_BUFFER;
use crate::key_manager::KdfParams;
use crate::secret::SecretProvider;
use crate::token::{Token, TokenKey, TokenKind};

/// Keys of the metadata kept in durable-plain storage
pub mod meta_keys {
    pub const PREFIX: &str = "meta:";
    pub const CONNECTED_PROVIDERS: &str = "meta:connected-providers";
    pub const SESSION_USER: &str = "meta:session-user";
}

#[derive(Clone)]
pub struct TokenStore {
    secure: Arc<dyn StorageBackend>,
    plain: Arc<dyn StorageBackend>,
    cache: Arc<LocalCache>,
    expiry_buffer: Duration,
}

impl TokenStore {
    pub fn new(secure: Arc<dyn StorageBackend>, plain: Arc<dyn StorageBackend>) -> Self {
        Self {
            secure,
            plain,
            cache: Arc::new(LocalCache::new()),
            expiry_buffer: TOKEN_EXPIRY_BUFFER,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Arc::new(MemoryBackend::new()))
    }

    pub fn with_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.expiry_buffer = buffer;
        self
    }

    /// Open the on-disk stores under `data_dir` and bootstrap the cache.
    ///
    /// If the encrypted store cannot be opened (no keyring and no
    /// passphrase, unreadable metadata, ...) the secure space is replaced by
    /// an [`UnavailableBackend`] and the user simply appears logged out.
    /// An unusable metadata file degrades the plain space the same way.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        secret_provider: Arc<dyn SecretProvider>,
    ) -> crate::Result<Self> {
        Self::open_with_kdf(data_dir, secret_provider, KdfParams::default()).await
    }

    pub async fn open_with_kdf(
        data_dir: impl AsRef<Path>,
        secret_provider: Arc<dyn SecretProvider>,
        kdf: KdfParams,
    ) -> crate::Result<Self> {
        let data_dir = data_dir.as_ref();

        let secure: Arc<dyn StorageBackend> =
            match EncryptedFileBackend::open_with_kdf(data_dir.join("secure"), secret_provider, kdf)
                .await
            {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    error!("Secure storage unavailable, continuing without it: {}", e);
                    Arc::new(UnavailableBackend::new(e.to_string()))
                }
            };
        let plain: Arc<dyn StorageBackend> =
            match JsonFileBackend::open(data_dir.join("metadata.json")).await {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    error!("Metadata storage unavailable, continuing without it: {}", e);
                    Arc::new(UnavailableBackend::new(e.to_string()))
                }
            };

        let store = Self::new(secure, plain);
        store.bootstrap().await;
        Ok(store)
    }

    pub fn expiry_buffer(&self) -> Duration {
        self.expiry_buffer
    }

    /// Copy every durable-plain entry into the process-local cache
    pub async fn bootstrap(&self) -> usize {
        match self.plain.entries().await {
            Ok(entries) => {
                let count = entries.len();
                for (key, value) in entries {
                    self.cache.set(&key, &value);
                }
                info!("Migrated {} metadata entries into the local cache", count);
                count
            }
            Err(e) => {
                warn!("Could not read durable metadata at startup: {}", e);
                0
            }
        }
    }

    pub async fn get_token(&self, key: &TokenKey) -> Option<Token> {
        match self.secure.get(&key.storage_key()).await {
            Ok(value) => value.map(|value| Token::new(key.clone(), value)),
            Err(e) => {
                error!("Failed to read {}: {}", key, e);
                None
            }
        }
    }

    /// Persist a token, replacing whatever occupied its slot.
    ///
    /// Access and content tokens that are already expired by the buffer
    /// rule are rejected.
    pub async fn set_token(&self, token: &Token) -> bool {
        let key = token.key().storage_key();

        if matches!(
            token.kind(),
            TokenKind::SessionAccess | TokenKind::ProviderAccess | TokenKind::Content
        ) && token.is_expired_now(self.expiry_buffer)
        {
            warn!("Refusing to persist already-expired {}", key);
            return false;
        }

        match self.secure.set(&key, token.value()).await {
            Ok(()) => {
                debug!("Stored {}", key);
                true
            }
            Err(e) => {
                error!("Failed to store {}: {}", key, e);
                false
            }
        }
    }

    pub async fn delete_tokens(&self, keys: &[TokenKey]) -> bool {
        let keys: Vec<String> = keys.iter().map(TokenKey::storage_key).collect();
        match self.secure.delete(&keys).await {
            Ok(()) => {
                debug!("Deleted {:?}", keys);
                true
            }
            Err(e) => {
                error!("Failed to delete {:?}: {}", keys, e);
                false
            }
        }
    }

    /// Synchronous metadata read from the process-local cache
    pub fn metadata(&self, key: &str) -> Option<String> {
        self.cache.get(key)
    }

    /// Write durable-plain first, then mirror into the cache
    pub async fn set_metadata(&self, key: &str, value: &str) -> bool {
        match self.plain.set(key, value).await {
            Ok(()) => {
                self.cache.set(key, value);
                true
            }
            Err(e) => {
                error!("Failed to store metadata {}: {}", key, e);
                false
            }
        }
    }

    pub async fn delete_metadata(&self, keys: &[&str]) -> bool {
        let owned: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        match self.plain.delete(&owned).await {
            Ok(()) => {
                for key in keys {
                    self.cache.delete(key);
                }
                true
            }
            Err(e) => {
                error!("Failed to delete metadata {:?}: {}", keys, e);
                false
            }
        }
    }

    /// Drop all metadata from durable-plain and the cache
    pub async fn clear_metadata(&self) -> bool {
        let keys = match self.plain.entries().await {
            Ok(entries) => entries.into_iter().map(|(k, _)| k).collect::<Vec<_>>(),
            Err(e) => {
                error!("Failed to list metadata: {}", e);
                self.cache.delete_prefix(meta_keys::PREFIX);
                return false;
            }
        };

        let cleared = match self.plain.delete(&keys).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to clear metadata: {}", e);
                false
            }
        };
        self.cache.clear();
        cleared
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("cached_entries", &self.cache.len())
            .field("expiry_buffer", &self.expiry_buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_unsigned;
    use crate::secret::StaticSecretProvider;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn jwt(exp: i64) -> String {
        encode_unsigned(&json!({ "exp": exp }))
    }

    fn unavailable() -> Arc<dyn StorageBackend> {
        Arc::new(UnavailableBackend::new("no secure hardware"))
    }

    #[tokio::test]
    async fn test_token_slots_replace() {
        let store = TokenStore::in_memory();
        let future = Utc::now().timestamp() + 3600;

        let first = Token::new(TokenKey::session_access(), jwt(future));
        let second = Token::new(TokenKey::session_access(), jwt(future + 1));
        assert!(store.set_token(&first).await);
        assert!(store.set_token(&second).await);

        let loaded = store.get_token(&TokenKey::session_access()).await.unwrap();
        assert_eq!(loaded, second);
    }

    #[tokio::test]
    async fn test_expired_access_tokens_are_not_persisted() {
        let store = TokenStore::in_memory();
        let past = Utc::now().timestamp() - 10;

        let access = Token::new(TokenKey::provider_access("p"), jwt(past));
        assert!(!store.set_token(&access).await);
        assert!(store.get_token(access.key()).await.is_none());

        // Refresh slots keep whatever the server handed out.
        let refresh = Token::new(TokenKey::session_refresh(), jwt(past));
        assert!(store.set_token(&refresh).await);
    }

    #[tokio::test]
    async fn test_unavailable_secure_backend_degrades() {
        let store = TokenStore::new(unavailable(), Arc::new(MemoryBackend::new()));
        let token = Token::new(TokenKey::session_refresh(), "r");

        assert!(!store.set_token(&token).await);
        assert!(store.get_token(&TokenKey::session_refresh()).await.is_none());
        assert!(!store.delete_tokens(&[TokenKey::session_refresh()]).await);
    }

    #[tokio::test]
    async fn test_metadata_is_mirrored_into_cache() {
        let plain = Arc::new(MemoryBackend::new());
        plain.set(meta_keys::SESSION_USER, "u-1").await.unwrap();

        let store = TokenStore::new(Arc::new(MemoryBackend::new()), plain.clone());
        assert_eq!(store.metadata(meta_keys::SESSION_USER), None);

        assert_eq!(store.bootstrap().await, 1);
        assert_eq!(store.metadata(meta_keys::SESSION_USER).as_deref(), Some("u-1"));

        assert!(store.set_metadata("meta:k", "v").await);
        assert_eq!(store.metadata("meta:k").as_deref(), Some("v"));
        assert_eq!(plain.get("meta:k").await.unwrap().as_deref(), Some("v"));

        assert!(store.delete_metadata(&["meta:k"]).await);
        assert_eq!(store.metadata("meta:k"), None);

        assert!(store.clear_metadata().await);
        assert_eq!(store.metadata(meta_keys::SESSION_USER), None);
        assert!(plain.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_plain_write_leaves_cache_untouched() {
        let store = TokenStore::new(Arc::new(MemoryBackend::new()), unavailable());
        assert!(!store.set_metadata("meta:k", "v").await);
        assert_eq!(store.metadata("meta:k"), None);
        assert_eq!(store.bootstrap().await, 0);
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let temp = TempDir::new().unwrap();
        let provider = Arc::new(StaticSecretProvider::new("pw"));
        {
            let store = TokenStore::open_with_kdf(temp.path(), provider.clone(), KdfParams::light())
                .await
                .unwrap();
            assert!(store.set_token(&Token::new(TokenKey::session_refresh(), "r")).await);
            assert!(store.set_metadata(meta_keys::SESSION_USER, "u-7").await);
        }

        let store = TokenStore::open_with_kdf(temp.path(), provider, KdfParams::light())
            .await
            .unwrap();
        assert_eq!(store.metadata(meta_keys::SESSION_USER).as_deref(), Some("u-7"));
        assert_eq!(
            store
                .get_token(&TokenKey::session_refresh())
                .await
                .unwrap()
                .value(),
            "r"
        );
    }

    #[tokio::test]
    async fn test_open_under_a_regular_file_degrades() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let store = TokenStore::open_with_kdf(
            blocker.join("store"),
            Arc::new(StaticSecretProvider::new("pw")),
            KdfParams::light(),
        )
        .await
        .unwrap();

        assert!(!store.set_metadata(meta_keys::SESSION_USER, "u-1").await);
        assert_eq!(store.metadata(meta_keys::SESSION_USER), None);
        assert!(!store.set_token(&Token::new(TokenKey::session_refresh(), "r")).await);
        assert!(store.get_token(&TokenKey::session_refresh()).await.is_none());
    }

    #[cfg(not(feature = "keyring-support"))]
    #[tokio::test]
    async fn test_open_without_any_key_source_degrades() {
        let temp = TempDir::new().unwrap();
        let store = TokenStore::open(temp.path(), Arc::new(crate::secret::NoSecretProvider))
            .await
            .unwrap();

        assert!(!store.set_token(&Token::new(TokenKey::session_refresh(), "r")).await);
        assert!(store.get_token(&TokenKey::session_refresh()).await.is_none());
        assert!(store.set_metadata(meta_keys::SESSION_USER, "still-works").await);
    }
}

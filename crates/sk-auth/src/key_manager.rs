use std::path::Path;
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::crypto::{self, EncryptionKey};
use crate::errors::{Result, SkAuthError};
use crate::secret::SecretProvider;

const SALT_LEN: usize = 32;
const META_FILE: &str = "meta.json";
#[cfg(feature = "keyring-support")]
const KEYRING_SERVICE: &str = "storykeep";

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl KdfParams {
    /// Reduced cost for low-memory devices and test suites
    pub fn light() -> Self {
        Self {
            m_cost_kib: 8 * 1024,
            t_cost: 1,
            p_cost: 1,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost_kib: 64 * 1024,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Random key held only by the OS keyring
    Keyring,
    /// Derived from a passphrase; also cached in the keyring when possible
    Passphrase,
}

/// Metadata persisted next to the encrypted entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMeta {
    pub version: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Distinguishes keyring entries of different stores
    pub store_id: String,
    pub key_source: KeySource,
    pub kdf: KdfParams,
    /// Base64-encoded Argon2id salt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase_salt: Option<String>,
}

impl KeyMeta {
    fn fresh(kdf: KdfParams) -> Result<Self> {
        let mut id = [0u8; 16];
        crypto::fill_random(&mut id)?;
        Ok(Self {
            version: 1,
            created_at: chrono::Utc::now(),
            store_id: id.iter().map(|b| format!("{b:02x}")).collect(),
            key_source: KeySource::Passphrase,
            kdf,
            passphrase_salt: None,
        })
    }
}

/// Resolves the secure-store key from the OS keyring, falling back to a
/// passphrase-derived key.
pub struct KeyManager {
    meta: KeyMeta,
    key: EncryptionKey,
}

impl KeyManager {
    pub async fn open(
        storage_dir: &Path,
        secret_provider: Arc<dyn SecretProvider>,
        kdf: KdfParams,
    ) -> Result<Self> {
        let meta_path = storage_dir.join(META_FILE);

        let (mut meta, fresh) = if fs::try_exists(&meta_path).await? {
            let content = fs::read_to_string(&meta_path).await?;
            let meta: KeyMeta = serde_json::from_str(&content)
                .map_err(|e| SkAuthError::InvalidResponse(format!("Invalid meta.json: {}", e)))?;
            (meta, false)
        } else {
            (KeyMeta::fresh(kdf)?, true)
        };

        let key = Self::resolve_key(&mut meta, fresh, &secret_provider).await?;

        let meta_json = serde_json::to_string_pretty(&meta)?;
        fs::write(&meta_path, meta_json).await?;

        Ok(Self { meta, key })
    }

    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    pub fn meta(&self) -> &KeyMeta {
        &self.meta
    }

    #[cfg(feature = "keyring-support")]
    async fn resolve_key(
        meta: &mut KeyMeta,
        fresh: bool,
        secret_provider: &Arc<dyn SecretProvider>,
    ) -> Result<EncryptionKey> {
        match Self::load_from_keyring(&meta.store_id) {
            Ok(key) => {
                tracing::debug!("Loaded secure-store key from OS keyring");
                return Ok(key);
            }
            Err(e) => tracing::debug!("Keyring unavailable ({}), trying passphrase", e),
        }

        if meta.key_source == KeySource::Keyring {
            // Random keyring keys cannot be re-derived.
            return Err(SkAuthError::Keyring(
                "secure-store key is no longer in the OS keyring".to_string(),
            ));
        }

        match Self::derive_from_passphrase(meta, secret_provider).await {
            Ok(key) => {
                if let Err(e) = Self::save_to_keyring(&meta.store_id, &key) {
                    tracing::warn!("Failed to cache key in keyring: {}", e);
                }
                Ok(key)
            }
            Err(SkAuthError::UserCancelled) if fresh => {
                let key = EncryptionKey::generate()?;
                Self::save_to_keyring(&meta.store_id, &key)?;
                meta.key_source = KeySource::Keyring;
                tracing::info!("Generated new secure-store key in OS keyring");
                Ok(key)
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(not(feature = "keyring-support"))]
    async fn resolve_key(
        meta: &mut KeyMeta,
        _fresh: bool,
        secret_provider: &Arc<dyn SecretProvider>,
    ) -> Result<EncryptionKey> {
        if meta.key_source == KeySource::Keyring {
            return Err(SkAuthError::Keyring(
                "store was created with keyring support".to_string(),
            ));
        }
        Self::derive_from_passphrase(meta, secret_provider).await
    }

    #[cfg(feature = "keyring-support")]
    fn keyring_entry(store_id: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(KEYRING_SERVICE, &format!("sk-auth:{}", store_id))
            .map_err(|e| SkAuthError::Keyring(format!("Failed to access keyring: {}", e)))
    }

    #[cfg(feature = "keyring-support")]
    fn load_from_keyring(store_id: &str) -> Result<EncryptionKey> {
        let key_b64 = Self::keyring_entry(store_id)?
            .get_password()
            .map_err(|e| SkAuthError::Keyring(format!("Failed to read from keyring: {}", e)))?;

        let key_bytes = STANDARD
            .decode(key_b64)
            .map_err(|_| SkAuthError::CorruptedStore)?;
        let key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| SkAuthError::CorruptedStore)?;

        Ok(EncryptionKey::from_bytes(key))
    }

    #[cfg(feature = "keyring-support")]
    fn save_to_keyring(store_id: &str, key: &EncryptionKey) -> Result<()> {
        Self::keyring_entry(store_id)?
            .set_password(&STANDARD.encode(key.as_bytes()))
            .map_err(|e| SkAuthError::Keyring(format!("Failed to write to keyring: {}", e)))
    }

    async fn derive_from_passphrase(
        meta: &mut KeyMeta,
        secret_provider: &Arc<dyn SecretProvider>,
    ) -> Result<EncryptionKey> {
        let passphrase = secret_provider
            .get_passphrase("Enter passphrase for the credential store")
            .await
            .ok_or(SkAuthError::UserCancelled)?;

        let salt = match meta.passphrase_salt {
            Some(ref salt_b64) => STANDARD
                .decode(salt_b64)
                .map_err(|_| SkAuthError::CorruptedStore)?,
            None => {
                let mut salt = vec![0u8; SALT_LEN];
                crypto::fill_random(&mut salt)?;
                meta.passphrase_salt = Some(STANDARD.encode(&salt));
                salt
            }
        };

        let params = Params::new(meta.kdf.m_cost_kib, meta.kdf.t_cost, meta.kdf.p_cost, Some(32))
            .map_err(|e| SkAuthError::Crypto(format!("Invalid Argon2 params: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|e| SkAuthError::Crypto(format!("Key derivation failed: {}", e)))?;

        meta.key_source = KeySource::Passphrase;
        Ok(EncryptionKey::from_bytes(key))
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("meta", &self.meta)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

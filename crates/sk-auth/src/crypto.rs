use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use zeroize::ZeroizeOnDrop;

use crate::errors::{Result, SkAuthError};

const AAD_VERSION: &str = "v1";

/// AES-256 key (32 bytes)
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; 32];
        fill_random(&mut key)?;
        Ok(Self { key })
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    /// Key bytes (sensitive)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Encrypted value with nonce and authentication tag
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EncryptedBlob {
    /// Base64url-encoded nonce (12 bytes)
    pub nonce: String,
    /// Base64url-encoded ciphertext + tag
    pub ciphertext: String,
    pub aad_version: String,
}

pub(crate) fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::fill(buf).map_err(|e| SkAuthError::Crypto(format!("OS RNG unavailable: {}", e)))
}

fn aad(version: &str, storage_key: &str) -> String {
    format!("sk-auth|{}|{}", version, storage_key)
}

/// Encrypt a value bound to its storage key
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], storage_key: &str) -> Result<EncryptedBlob> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; 12];
    fill_random(&mut nonce_bytes)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad = aad(AAD_VERSION, storage_key);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| SkAuthError::Crypto(format!("Encryption failed: {}", e)))?;

    Ok(EncryptedBlob {
        nonce: URL_SAFE_NO_PAD.encode(nonce_bytes),
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        aad_version: AAD_VERSION.to_string(),
    })
}

/// Decrypt a blob; fails with `CorruptedStore` on tag or AAD mismatch
pub fn decrypt(key: &EncryptionKey, blob: &EncryptedBlob, storage_key: &str) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let nonce_bytes = URL_SAFE_NO_PAD
        .decode(&blob.nonce)
        .map_err(|e| SkAuthError::Crypto(format!("Invalid nonce: {}", e)))?;
    if nonce_bytes.len() != 12 {
        return Err(SkAuthError::CorruptedStore);
    }
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = URL_SAFE_NO_PAD
        .decode(&blob.ciphertext)
        .map_err(|e| SkAuthError::Crypto(format!("Invalid ciphertext: {}", e)))?;

    let aad = aad(&blob.aad_version, storage_key);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ciphertext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| SkAuthError::CorruptedStore)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate().unwrap();
        let plaintext = b"refresh-token-value";

        let encrypted = encrypt(&key, plaintext, "session:refresh").unwrap();
        let decrypted = decrypt(&key, &encrypted, "session:refresh").unwrap();

        assert_eq!(plaintext, decrypted.as_slice());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = EncryptionKey::generate().unwrap();
        let key2 = EncryptionKey::generate().unwrap();

        let encrypted = encrypt(&key1, b"data", "session:access").unwrap();
        let result = decrypt(&key2, &encrypted, "session:access");

        assert!(matches!(result, Err(SkAuthError::CorruptedStore)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate().unwrap();
        let mut encrypted = encrypt(&key, b"data", "session:access").unwrap();

        let mut ct_bytes = URL_SAFE_NO_PAD.decode(&encrypted.ciphertext).unwrap();
        ct_bytes[0] ^= 0xFF;
        encrypted.ciphertext = URL_SAFE_NO_PAD.encode(ct_bytes);

        let result = decrypt(&key, &encrypted, "session:access");
        assert!(matches!(result, Err(SkAuthError::CorruptedStore)));
    }

    #[test]
    fn test_value_is_bound_to_storage_key() {
        let key = EncryptionKey::generate().unwrap();

        let encrypted = encrypt(&key, b"data", "provider/a:refresh").unwrap();
        let result = decrypt(&key, &encrypted, "provider/b:refresh");

        assert!(matches!(result, Err(SkAuthError::CorruptedStore)));
    }
}

//! At-rest encryption for connected-account tokens
//!
//! Stored format: `base64(nonce || ciphertext || tag)` with a 12-byte random
//! nonce per encryption. Decrypted tokens are handed out as [`SecretString`]
//! and should be dropped as soon as the vendor call that needs them returns.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::engine::{general_purpose::STANDARD, Engine};
use rand::RngCore;
use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Build a cipher from a base64-encoded 32-byte key
    pub fn new(key_base64: &str) -> Result<Self, CryptoError> {
        let key_bytes = Zeroizing::new(
            STANDARD
                .decode(key_base64.trim())
                .map_err(|e| CryptoError::InvalidKey(format!("not valid base64: {}", e)))?,
        );

        if key_bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                key_bytes.len()
            )));
        }

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Build a cipher from the key held in environment variable `var`
    pub fn from_env(var: &str) -> Result<Self, CryptoError> {
        let key = Zeroizing::new(
            std::env::var(var).map_err(|_| CryptoError::MissingKey(var.to_string()))?,
        );
        if key.trim().is_empty() {
            return Err(CryptoError::MissingKey(var.to_string()));
        }
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<SecretString, CryptoError> {
        let combined = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::DecryptionFailed(format!("not valid base64: {}", e)))?;

        if combined.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::DecryptionFailed(
                "ciphertext too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                CryptoError::DecryptionFailed("authentication tag mismatch".to_string())
            })?;

        let token = String::from_utf8(plaintext)
            .map_err(|_| CryptoError::DecryptionFailed("token is not UTF-8".to_string()))?;

        Ok(SecretString::from(token))
    }
}

/// Generate a fresh base64 key suitable for `REELCAST_TOKEN_KEY`
pub fn generate_key() -> String {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::thread_rng().fill_bytes(key.as_mut());
    STANDARD.encode(key.as_ref())
}

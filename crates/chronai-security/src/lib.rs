//! chronai-security: credential masking and encryption at rest.
//!
//! API keys are stored encrypted with AES-256-GCM. The stored format is
//! base64 of `nonce (12 bytes) || ciphertext || tag (16 bytes)`; the nonce
//! is random per call, so encrypting the same plaintext twice yields two
//! different ciphertexts.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;

/// Size of the AES-256-GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),
}

/// Mask a credential for display in logs and API responses.
///
/// Keys longer than 8 characters show the first and last 4 characters;
/// anything shorter collapses to `***`.
pub fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "***".to_string()
    }
}

/// Reversible cipher for stored API keys, keyed by the process-wide
/// 32-byte encryption key from configuration.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl CredentialCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, SecurityError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| SecurityError::InvalidCiphertext(format!("bad key encoding: {e}")))?;
        if bytes.len() != 32 {
            return Err(SecurityError::InvalidKeyLength(bytes.len()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    /// Encrypt a plain-text credential for storage.
    pub fn encrypt(&self, plain_text: &str) -> Result<String, SecurityError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| SecurityError::EncryptionFailed(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plain_text.as_bytes())
            .map_err(|e| SecurityError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a stored credential back to plain text.
    pub fn decrypt(&self, encrypted: &str) -> Result<String, SecurityError> {
        let data = BASE64
            .decode(encrypted.trim())
            .map_err(|e| SecurityError::InvalidCiphertext(e.to_string()))?;

        // Minimum: nonce (12) + tag (16); GCM allows empty plaintext.
        if data.len() < NONCE_SIZE + 16 {
            return Err(SecurityError::InvalidCiphertext("too short".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| SecurityError::DecryptionFailed(e.to_string()))?;
        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);

        let plain = cipher
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|e| SecurityError::DecryptionFailed(e.to_string()))?;
        String::from_utf8(plain)
            .map_err(|e| SecurityError::DecryptionFailed(format!("invalid UTF-8: {e}")))
    }
}

/// Generate a fresh random 32-byte key, base64-encoded for storage.
pub fn generate_key() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    BASE64.encode(key)
}

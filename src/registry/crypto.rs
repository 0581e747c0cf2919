//! Credential encryption for stored node passwords
//!
//! AES-256-GCM with a key derived from the configured secret. The stored
//! form is base64 of `nonce || ciphertext`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Encrypts and decrypts node passwords
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Derive the key from `secret`
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt `plaintext` into its stored form
    pub fn encrypt(&self, plaintext: &str) -> Result<String, String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| "encryption failed".to_string())?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a stored value. The error is a reason, not the secret.
    pub fn decrypt(&self, stored: &str) -> Result<String, String> {
        let bytes = BASE64
            .decode(stored.trim())
            .map_err(|e| format!("invalid base64: {}", e))?;
        if bytes.len() <= NONCE_LEN {
            return Err("ciphertext too short".to_string());
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| "authentication failed (wrong secret or corrupted value)".to_string())?;

        String::from_utf8(plaintext).map_err(|_| "plaintext is not UTF-8".to_string())
    }
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

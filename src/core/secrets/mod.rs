//! Symmetric encryption for credentials stored in the database.
//!
//! Stored form is `base64(nonce):base64(ciphertext)` using AES-256-GCM.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::core::error::CoreError;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("Mailbox encryption key is not configured")]
    MissingKey,
    #[error("Malformed encrypted value")]
    Malformed,
    #[error("Invalid {0} encoding")]
    Encoding(&'static str),
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed; wrong key or corrupted value")]
    Decrypt,
}

impl From<CipherError> for CoreError {
    fn from(err: CipherError) -> Self {
        CoreError::Validation(err.to_string())
    }
}

#[derive(Clone)]
pub struct PasswordCipher {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for PasswordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordCipher").finish_non_exhaustive()
    }
}

impl PasswordCipher {
    /// Accepts a base64 encoded 32-byte key; anything else is hashed with SHA-256.
    pub fn from_secret(secret: &str) -> Result<Self, CipherError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(CipherError::MissingKey);
        }
        let mut key = [0u8; KEY_SIZE];
        match BASE64.decode(secret) {
            Ok(bytes) if bytes.len() == KEY_SIZE => key.copy_from_slice(&bytes),
            _ => key.copy_from_slice(&Sha256::digest(secret.as_bytes())),
        }
        Ok(Self { key })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut rng = rand::rng();
        let nonce_bytes: [u8; NONCE_SIZE] = std::array::from_fn(|_| rng.random());
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;
        Ok(format!(
            "{}:{}",
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CipherError> {
        let (nonce_b64, ciphertext_b64) = stored.split_once(':').ok_or(CipherError::Malformed)?;
        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|_| CipherError::Encoding("nonce"))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CipherError::Malformed);
        }
        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .map_err(|_| CipherError::Encoding("ciphertext"))?;
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypted_value_has_nonce_prefix() {
        let cipher = PasswordCipher::from_secret("correct horse battery staple").unwrap();
        let stored = cipher.encrypt("hunter2").unwrap();
        let (nonce, body) = stored.split_once(':').unwrap();
        assert_eq!(BASE64.decode(nonce).unwrap().len(), NONCE_SIZE);
        assert!(!body.is_empty());
        assert_eq!(cipher.decrypt(&stored).unwrap(), "hunter2");
        assert_ne!(cipher.encrypt("hunter2").unwrap(), stored);
    }

    #[test]
    fn test_wrong_key_fails() {
        let stored = PasswordCipher::from_secret("one").unwrap().encrypt("pw").unwrap();
        let other = PasswordCipher::from_secret("two").unwrap();
        assert_eq!(other.decrypt(&stored), Err(CipherError::Decrypt));
        assert_eq!(other.decrypt("no-separator"), Err(CipherError::Malformed));
    }

    #[test]
    fn test_raw_base64_key_is_used_directly() {
        let key = BASE64.encode([7u8; KEY_SIZE]);
        let cipher = PasswordCipher::from_secret(&key).unwrap();
        assert_eq!(cipher.key, [7u8; KEY_SIZE]);
        assert_eq!(PasswordCipher::from_secret("  ").unwrap_err(), CipherError::MissingKey);
    }
}

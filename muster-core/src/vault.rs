//! At-rest encryption for fleet server credentials.
//!
//! Passwords are stored as base64(nonce || ciphertext) in a single text
//! column. The key is derived from the configured passphrase, so the
//! database alone is not enough to recover a credential.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::{Rng, distr::Alphanumeric};
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_SIZE: usize = 12;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("encryption failed")]
    Encrypt,

    #[error("stored value is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("stored value is too short to contain a nonce")]
    Truncated,

    /// Wrong key or tampered ciphertext. GCM authentication means the two
    /// are indistinguishable here.
    #[error("decryption failed")]
    Decrypt,
}

/// Symmetric cipher handle shared by everything that touches stored
/// credentials.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Derive the AES-256 key from a configured passphrase.
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt a credential for storage. A fresh nonce is drawn per call, so
    /// equal plaintexts produce distinct stored values.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;
        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypt a stored credential. Malformed encodings, truncation, and
    /// tampering all surface as errors; callers never see partial plaintext.
    pub fn decrypt(&self, stored: &str) -> Result<String, VaultError> {
        let combined = BASE64.decode(stored)?;
        if combined.len() < NONCE_SIZE {
            return Err(VaultError::Truncated);
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Decrypt)
    }
}

/// Random alphanumeric token for generated account names and passwords.
/// Plain randomness, not encryption; anything secret still goes through the
/// vault before storage.
pub fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

//! Credential encryption.
//!
//! One symmetric key per process run, derived from a passphrase with
//! SHA-256. Blobs are URL-safe base64 of `nonce || ciphertext` produced by
//! ChaCha20-Poly1305, so a wrong key or a tampered blob fails
//! authentication instead of yielding garbage.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::types::RunnerError;

/// Passphrase used when the operator leaves it empty.
pub const DEFAULT_PASSPHRASE: &str = "tradequeue: default vault passphrase";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct Vault {
    cipher: ChaCha20Poly1305,
}

impl Vault {
    /// Derive the vault key. An empty passphrase maps to [`DEFAULT_PASSPHRASE`].
    pub fn from_passphrase(passphrase: &SecretString) -> Self {
        let phrase = passphrase.expose_secret();
        if phrase.is_empty() {
            Self::with_phrase(DEFAULT_PASSPHRASE)
        } else {
            Self::with_phrase(phrase)
        }
    }

    pub fn default_key() -> Self {
        Self::with_phrase(DEFAULT_PASSPHRASE)
    }

    fn with_phrase(phrase: &str) -> Self {
        let digest = Sha256::digest(phrase.as_bytes());
        let key = Key::from_slice(digest.as_slice());
        Self {
            cipher: ChaCha20Poly1305::new(key),
        }
    }

    /// Establish the run's key against an existing queue.
    ///
    /// With no `probe` (empty queue) the supplied passphrase, or the default,
    /// is used as-is. Otherwise the default key is tried first, then the
    /// supplied passphrase; a key that cannot decrypt the probe is rejected.
    pub fn unlock(
        passphrase: Option<&SecretString>,
        probe: Option<&str>,
    ) -> Result<Self, RunnerError> {
        let Some(probe) = probe else {
            return Ok(passphrase.map_or_else(Self::default_key, Self::from_passphrase));
        };

        let default = Self::default_key();
        if default.decrypt(probe).is_ok() {
            debug!("Queue is encrypted with the default passphrase");
            return Ok(default);
        }

        if let Some(passphrase) = passphrase {
            let vault = Self::from_passphrase(passphrase);
            if vault.decrypt(probe).is_ok() {
                info!("Vault unlocked");
                return Ok(vault);
            }
        }

        Err(RunnerError::Credential(
            "invalid passphrase for the stored queue".to_string(),
        ))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, RunnerError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| RunnerError::Credential("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String, RunnerError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(blob.trim())
            .map_err(|e| RunnerError::Credential(format!("malformed encrypted field: {e}")))?;
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(RunnerError::Credential(
                "encrypted field is truncated".to_string(),
            ));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| RunnerError::Credential("wrong key or corrupted data".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| RunnerError::Credential("decrypted field is not UTF-8".to_string()))
    }

    pub fn decrypt_secret(&self, blob: &str) -> Result<SecretString, RunnerError> {
        self.decrypt(blob).map(SecretString::new)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Credential decryption for stored connection secrets.
//!
//! Passwords and connection strings are stored encrypted at rest. The pool
//! only ever needs the decrypt half, consumed through [`CredentialCipher`];
//! [`AesGcmCipher`] is the AES-256-GCM implementation used by the binary.
//!
//! Ciphertexts are stored as `hex(nonce):hex(ciphertext || tag)` with a fresh
//! random 12-byte nonce per encryption.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::CipherError;

const NONCE_LEN: usize = 12;

/// Decrypts stored credentials. Synchronous; called while resolving a
/// connection descriptor.
pub trait CredentialCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError>;
}

/// AES-256-GCM cipher keyed by a 32-byte master key.
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl AesGcmCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Build from a 64-hex-char key.
    pub fn from_hex_key(hex_key: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| CipherError::Key(format!("invalid hex: {e}")))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CipherError::Key(format!(
                "key must be 64 hex chars (32 bytes), got {} bytes",
                bytes.len()
            ))
        })?;
        Ok(Self::new(&key))
    }

    /// Read the key from the named environment variable.
    pub fn from_env(var: &str) -> Result<Self, CipherError> {
        let hex_key =
            std::env::var(var).map_err(|_| CipherError::Key(format!("{var} env var not set")))?;
        Self::from_hex_key(&hex_key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;
        Ok(format!("{}:{}", hex::encode(nonce_bytes), hex::encode(ciphertext)))
    }
}

impl CredentialCipher for AesGcmCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        let (nonce_hex, body_hex) = ciphertext
            .trim()
            .split_once(':')
            .ok_or_else(|| CipherError::Malformed("expected nonce:ciphertext".to_string()))?;
        let nonce = hex::decode(nonce_hex)
            .map_err(|e| CipherError::Malformed(format!("nonce: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(CipherError::Malformed(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let body = hex::decode(body_hex)
            .map_err(|e| CipherError::Malformed(format!("ciphertext: {e}")))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), body.as_slice())
            .map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plaintext)
            .map_err(|_| CipherError::Malformed("plaintext is not UTF-8".to_string()))
    }
}

//! Sealed storage for BYOK provider keys.
//!
//! Keys at rest are AES-256-GCM ciphertexts with the 12-byte nonce prepended,
//! base64-encoded as a single opaque string. The symmetric master key is
//! provided once at startup via an environment variable; plaintext provider
//! keys exist only for the duration of a single upstream call frame.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("master key must be 32 bytes of base64, got {0} bytes")]
    BadKeyLength(usize),
    #[error("master key is not valid base64: {0}")]
    BadKeyEncoding(#[from] base64::DecodeError),
    #[error("sealed value is malformed")]
    Malformed,
    #[error("decryption failed (wrong master key or corrupted ciphertext)")]
    DecryptFailed,
}

/// Process-wide cipher for sealing and opening BYOK keys.
#[derive(Clone)]
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl KeyCipher {
    /// Build from a base64-encoded 32-byte master key.
    pub fn from_base64(master_key_b64: &str) -> Result<Self, CryptoError> {
        let raw = BASE64.decode(master_key_b64.trim())?;
        if raw.len() != 32 {
            return Err(CryptoError::BadKeyLength(raw.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(&raw);
        Ok(Self { cipher: Aes256Gcm::new(key) })
    }

    /// Encrypt a plaintext provider key. Output is base64(nonce ‖ ciphertext).
    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::DecryptFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Decrypt a sealed value produced by [`seal`][Self::seal].
    ///
    /// The returned plaintext must not outlive the call frame that uses it.
    pub fn open(&self, sealed_b64: &str) -> Result<String, CryptoError> {
        let sealed = BASE64.decode(sealed_b64).map_err(|_| CryptoError::Malformed)?;
        if sealed.len() <= NONCE_LEN {
            return Err(CryptoError::Malformed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Malformed)
    }
}

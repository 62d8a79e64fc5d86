use std::sync::Arc;
use zeroize::Zeroizing;

use crate::crypto::aes::{self, SecureKey};
use crate::crypto::keypair::{self, WireguardKeypair};
use crate::error::{AppError, Result};

/// Generates per-session WireGuard keys and seals private halves for storage.
///
/// ⚠️ Only the sealed form (`ciphertext || nonce`) may be persisted.
#[derive(Clone)]
pub struct KeyManager {
    key: Arc<SecureKey>,
}

impl KeyManager {
    /// Creates a `KeyManager` from the process-wide master key.
    pub fn new(master_key: &[u8]) -> Result<Self> {
        Ok(Self {
            key: Arc::new(SecureKey::from_slice(master_key)?),
        })
    }

    /// Generates a fresh client keypair.
    pub fn generate(&self) -> WireguardKeypair {
        keypair::generate()
    }

    /// Seals a base64 private key under the master key with a fresh nonce.
    pub fn encrypt_private_key(&self, private_key: &str) -> Result<Vec<u8>> {
        aes::seal(&self.key, private_key.as_bytes())
    }

    /// Opens a sealed private key.
    pub fn decrypt_private_key(&self, sealed: &[u8]) -> Result<Zeroizing<String>> {
        let plaintext = Zeroizing::new(aes::open(&self.key, sealed)?);
        let private_key = std::str::from_utf8(&plaintext).map_err(|_| AppError::Decryption)?;
        Ok(Zeroizing::new(private_key.to_string()))
    }
}

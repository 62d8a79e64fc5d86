use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use std::fs;
use std::path::Path;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{AppError, Result};

/// Length of a raw WireGuard (Curve25519) key.
pub const WG_KEY_LEN: usize = 32;

/// A WireGuard keypair in the base64 form `wg` tooling reads and writes.
pub struct WireguardKeypair {
    /// Base64 public key, safe to store and transmit.
    pub public_key: String,
    /// Base64 private key, wiped when dropped.
    pub private_key: Zeroizing<String>,
}

/// Generates a fresh X25519 keypair.
pub fn generate() -> WireguardKeypair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    WireguardKeypair {
        public_key: general_purpose::STANDARD.encode(public.as_bytes()),
        private_key: Zeroizing::new(general_purpose::STANDARD.encode(secret.to_bytes())),
    }
}

/// Decodes a base64 WireGuard key, checking it is exactly 32 bytes.
pub fn decode_key(b64: &str) -> Result<Zeroizing<[u8; WG_KEY_LEN]>> {
    let bytes = Zeroizing::new(
        general_purpose::STANDARD
            .decode(b64.trim())
            .map_err(|e| AppError::Validation(format!("Invalid base64 key: {}", e)))?,
    );
    let key: [u8; WG_KEY_LEN] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| AppError::Validation("Invalid key length".to_string()))?;
    Ok(Zeroizing::new(key))
}

/// Derives the base64 public key for a base64 private key.
pub fn public_key_for(private_b64: &str) -> Result<String> {
    let secret = StaticSecret::from(*decode_key(private_b64)?);
    Ok(general_purpose::STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

/// The server's own keypair, read once at startup and immutable afterwards.
#[derive(Clone)]
pub struct ServerKeypair {
    public_key: String,
    private_key: Zeroizing<String>,
}

impl std::fmt::Debug for ServerKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeypair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl ServerKeypair {
    /// Validates a private/public pair. The public half must match the one
    /// derived from the private half.
    pub fn from_base64(private_b64: &str, public_b64: &str) -> Result<Self> {
        let derived = public_key_for(private_b64)
            .map_err(|e| AppError::InvalidConfiguration(format!("Server private key: {}", e)))?;
        decode_key(public_b64)
            .map_err(|e| AppError::InvalidConfiguration(format!("Server public key: {}", e)))?;

        if derived != public_b64.trim() {
            return Err(AppError::InvalidConfiguration(
                "Server public key does not match private key".to_string(),
            ));
        }

        Ok(Self {
            public_key: derived,
            private_key: Zeroizing::new(private_b64.trim().to_string()),
        })
    }

    /// Reads `server_private.key` and `server_public.key` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let read = |name: &str| -> Result<Zeroizing<String>> {
            let path = dir.join(name);
            fs::read_to_string(&path).map(Zeroizing::new).map_err(|e| {
                AppError::InvalidConfiguration(format!("Cannot read {}: {}", path.display(), e))
            })
        };

        let private_b64 = read("server_private.key")?;
        let public_b64 = read("server_public.key")?;
        let keys = Self::from_base64(&private_b64, &public_b64)?;

        tracing::info!("✅ Server WireGuard keys loaded from {}", dir.display());
        Ok(keys)
    }

    /// Base64 public key handed to clients.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Base64 private key.
    pub fn private_key(&self) -> &str {
        &self.private_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_public_key_matches_private_key() {
        let pair = generate();
        assert_eq!(public_key_for(&pair.private_key).unwrap(), pair.public_key);
        assert_eq!(decode_key(&pair.public_key).unwrap().len(), WG_KEY_LEN);
    }

    #[test]
    fn server_keypair_rejects_mismatched_halves() {
        let a = generate();
        let b = generate();

        let ok = ServerKeypair::from_base64(&a.private_key, &a.public_key).unwrap();
        assert_eq!(ok.public_key(), a.public_key);

        assert!(matches!(
            ServerKeypair::from_base64(&a.private_key, &b.public_key),
            Err(AppError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            ServerKeypair::from_base64("AAAA", &a.public_key),
            Err(AppError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn server_keypair_load_reports_missing_files() {
        let dir = std::env::temp_dir().join(format!("vpn-keys-missing-{}", uuid::Uuid::new_v4()));
        assert!(matches!(
            ServerKeypair::load(&dir),
            Err(AppError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn server_keypair_load_trims_key_files() {
        let pair = generate();
        let dir = std::env::temp_dir().join(format!("vpn-keys-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("server_private.key"), format!("{}\n", &*pair.private_key)).unwrap();
        fs::write(dir.join("server_public.key"), format!("{}\n", pair.public_key)).unwrap();

        let keys = ServerKeypair::load(&dir).unwrap();
        assert_eq!(keys.public_key(), pair.public_key);
        assert_eq!(keys.private_key(), pair.private_key.as_str());

        fs::remove_dir_all(&dir).unwrap();
    }
}

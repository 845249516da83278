//! Key pair generation and key-file handling.

use std::path::Path;

use k256::ecdsa::SigningKey;

use skald_types::{KeyPair, PrivateKey, PublicKey, SkaldError};

/// Generate a fresh Secp256k1 key pair.
pub fn generate_keypair() -> KeyPair {
    let signing_key = SigningKey::random(&mut rand::thread_rng());
    keypair_from_signing_key(&signing_key)
}

/// Reconstruct a key pair from raw private key bytes.
pub fn keypair_from_private(private: &[u8; 32]) -> Result<KeyPair, SkaldError> {
    let signing_key = SigningKey::from_slice(private)
        .map_err(|e| SkaldError::InvalidKey(format!("invalid private scalar: {e}")))?;
    Ok(keypair_from_signing_key(&signing_key))
}

/// Load the node key from `path`, or generate and persist one if the
/// file does not exist. A present-but-unreadable file is an error so a
/// mistyped path never silently mints a new identity.
pub fn load_or_generate_keypair(path: &Path) -> Result<KeyPair, SkaldError> {
    if path.exists() {
        let raw = std::fs::read(path)?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| SkaldError::InvalidKey(format!("key file {} is not 32 bytes", path.display())))?;
        return keypair_from_private(&bytes);
    }

    let kp = generate_keypair();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, kp.private.0)?;
    Ok(kp)
}

fn keypair_from_signing_key(signing_key: &SigningKey) -> KeyPair {
    let public_bytes = signing_key.verifying_key().to_sec1_bytes();
    let mut public = [0u8; 33];
    public.copy_from_slice(&public_bytes);

    let mut private = [0u8; 32];
    private.copy_from_slice(&signing_key.to_bytes());
    KeyPair {
        public: PublicKey(public),
        private: PrivateKey(private),
    }
}

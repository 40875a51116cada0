use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use std::fs;
use std::path::Path;

/// Ed25519 device identity.
///
/// Its public key is what peers know us by: the hex fingerprint goes into the
/// mDNS TXT record and is proven during the link handshake.
///
/// NOTE: the secret key is stored as a plain 32-byte file in the data
/// directory.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Fresh identity that is never written to disk.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Generate a new identity and persist its secret key to `path`.
    pub fn generate_and_store(path: &Path) -> Result<Self> {
        let identity = Self::generate();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, identity.signing_key.to_bytes()).context("writing identity file")?;
        tracing::info!("Generated new identity at {:?}", path);
        Ok(identity)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).context("reading identity file")?;
        let key_bytes: [u8; 32] = data.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "Invalid key file length: expected 32 bytes, got {}",
                data.len()
            )
        })?;
        tracing::debug!("Loaded identity from {:?}", path);
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::generate_and_store(path)
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Full hex fingerprint; this is the stable half of a peer id.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public_key_bytes())
    }

    /// First 8 hex chars, for display.
    pub fn short_fingerprint(&self) -> String {
        short(&self.fingerprint()).to_string()
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }

    pub fn verify_with_pubkey(
        pubkey: &[u8; 32],
        msg: &[u8],
        sig: &Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        let pk = VerifyingKey::from_bytes(pubkey)?;
        pk.verify(msg, sig)
    }
}

pub fn fingerprint_of(pubkey: &[u8; 32]) -> String {
    hex::encode(pubkey)
}

pub(crate) fn short(fingerprint: &str) -> &str {
    fingerprint.get(..8).unwrap_or(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let created = Identity::load_or_generate(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), 32);

        let loaded = Identity::load_or_generate(&path).unwrap();
        assert_eq!(created.fingerprint(), loaded.fingerprint());
        assert_eq!(created.fingerprint().len(), 64);
        assert_eq!(created.short_fingerprint(), created.fingerprint()[..8]);
    }

    #[test]
    fn test_rejects_truncated_key_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, [7u8; 12]).unwrap();
        assert!(Identity::load(&path).is_err());
    }

    #[test]
    fn test_signature_verifies_only_for_signed_message() {
        let id = Identity::generate();
        let sig = id.sign(b"ephemeral||nonce");
        let pk = id.public_key_bytes();
        assert!(Identity::verify_with_pubkey(&pk, b"ephemeral||nonce", &sig).is_ok());
        assert!(Identity::verify_with_pubkey(&pk, b"something else", &sig).is_err());
    }
}

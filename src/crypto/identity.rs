//! Long-lived identity keys: Ed25519 signing keys loaded from a key file at
//! startup, distinct from the per-session X25519 ephemeral keys in
//! [`super::x25519`]. The identity key signs a session's ephemeral public
//! key; it never participates in key agreement itself.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::path::Path;

use crate::error::CryptoError;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// A daemon's long-lived identity: a signing keypair plus its public
/// identity bytes.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a fresh identity keypair (used by installers/first-run
    /// tooling, not by the daemon's own startup path).
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load an identity from a 32-byte raw private key file.
    pub fn from_private_key_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                got: bytes.len(),
            })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key),
        })
    }

    /// Load an identity from the identity key file named in the
    /// configuration directory (`id_ed25519`, raw 32-byte secret).
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let bytes = std::fs::read(path).map_err(|e| CryptoError::IdentityFile {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_private_key_bytes(&bytes).map_err(|_| CryptoError::IdentityFile {
            reason: format!("{} is not a valid 32-byte Ed25519 secret key", path.display()),
        })
    }

    pub fn to_private_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The daemon's public identity, as presented to peers and the tracker.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign arbitrary bytes (in practice, a session's ephemeral X25519
    /// public key) with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verify that `signature` over `message` was produced by the identity
/// whose public key is `public_key`.
pub fn verify(
    public_key: &[u8; PUBLIC_KEY_LEN],
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let signature = Signature::from_bytes(signature);
    verifying_key.verify(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_and_verifies() {
        let identity = Identity::generate();
        let message = b"an ephemeral public key";
        let signature = identity.sign(message);

        assert!(verify(&identity.public_key(), message, &signature));
    }

    #[test]
    fn rejects_tampered_message() {
        let identity = Identity::generate();
        let signature = identity.sign(b"original message");

        assert!(!verify(&identity.public_key(), b"different message", &signature));
    }

    #[test]
    fn rejects_wrong_key() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let signature = identity.sign(b"message");

        assert!(!verify(&other.public_key(), b"message", &signature));
    }

    #[test]
    fn roundtrips_through_bytes() {
        let identity = Identity::generate();
        let bytes = identity.to_private_key_bytes();
        let reloaded = Identity::from_private_key_bytes(&bytes).unwrap();

        assert_eq!(identity.public_key(), reloaded.public_key());
    }

    #[test]
    fn rejects_short_key_bytes() {
        assert!(Identity::from_private_key_bytes(&[0u8; 16]).is_err());
    }
}

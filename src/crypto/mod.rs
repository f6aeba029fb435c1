//! Identity keys, per-session ephemeral keys, signing, peer verification,
//! and symmetric payload encryption: the crypter (§4.1).

pub mod aead;
pub mod identity;
pub mod x25519;

use std::collections::{HashMap, HashSet};

use crate::error::CryptoError;

/// Ephemeral key state for one in-progress or established session.
struct SessionKeys {
    local_private: [u8; x25519::KEY_LEN],
    local_public: [u8; x25519::KEY_LEN],
    peer_public: Option<[u8; x25519::KEY_LEN]>,
    shared_key: Option<[u8; aead::KEY_LEN]>,
}

/// Outcome of verifying a peer's handshake signature and identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub verified: bool,
    pub peer_name: Option<String>,
}

/// Holds the daemon's long-lived identity and the ephemeral key material
/// for every session currently being negotiated or established. Owned
/// exclusively by whichever task drives the peer-session subsystem; callers
/// from other components reach it through the narrow operations below, per
/// the shared-resource policy in §5.
pub struct Crypter {
    identity: identity::Identity,
    sessions: HashMap<String, SessionKeys>,
    /// Cached `(tracker, identity bytes) -> canonical name` bindings,
    /// populated as a side effect of tracker responses (registration,
    /// connections-list entries, address resolutions).
    identity_names: HashMap<(String, [u8; identity::PUBLIC_KEY_LEN]), String>,
}

impl Crypter {
    pub fn new(identity: identity::Identity) -> Self {
        Self {
            identity,
            sessions: HashMap::new(),
            identity_names: HashMap::new(),
        }
    }

    /// The daemon's public identity.
    pub fn identity(&self) -> [u8; identity::PUBLIC_KEY_LEN] {
        self.identity.public_key()
    }

    /// Record (or refresh) the tracker-supplied canonical name for an
    /// identity. Called by the tracker-client subsystem whenever a response
    /// carries an identity/name pair; never called by the session subsystem
    /// itself.
    pub fn bind_identity_name(
        &mut self,
        tracker_name: &str,
        peer_identity: [u8; identity::PUBLIC_KEY_LEN],
        name: String,
    ) {
        self.identity_names
            .insert((tracker_name.to_string(), peer_identity), name);
    }

    /// Generate ephemeral key material for a new session, indexed by
    /// `session_id`.
    pub fn new_session(&mut self, session_id: &str) {
        let (local_private, local_public) = x25519::generate_keypair();
        self.sessions.insert(
            session_id.to_string(),
            SessionKeys {
                local_private,
                local_public,
                peer_public: None,
                shared_key: None,
            },
        );
    }

    fn session(&self, session_id: &str) -> Result<&SessionKeys, CryptoError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| CryptoError::NoSessionKeys {
                session_id: session_id.to_string(),
            })
    }

    /// Sign the local ephemeral public key for `session_id` with the
    /// identity key.
    pub fn sign(&self, session_id: &str) -> Result<[u8; identity::SIGNATURE_LEN], CryptoError> {
        let session = self.session(session_id)?;
        Ok(self.identity.sign(&session.local_public))
    }

    /// Verify a peer's handshake signature and, when `fixed_peers` is
    /// supplied, that the peer's canonical name is among them.
    pub fn verify(
        &mut self,
        session_id: &str,
        tracker_name: &str,
        peer_identity: [u8; identity::PUBLIC_KEY_LEN],
        peer_ephemeral_pub_key: [u8; x25519::KEY_LEN],
        peer_signature: [u8; identity::SIGNATURE_LEN],
        fixed_peers: Option<&HashSet<String>>,
    ) -> Result<VerifyResult, CryptoError> {
        if !identity::verify(&peer_identity, &peer_ephemeral_pub_key, &peer_signature) {
            return Ok(VerifyResult {
                verified: false,
                peer_name: None,
            });
        }

        let peer_name = self
            .identity_names
            .get(&(tracker_name.to_string(), peer_identity))
            .cloned();

        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CryptoError::NoSessionKeys {
                session_id: session_id.to_string(),
            })?;
        session.peer_public = Some(peer_ephemeral_pub_key);

        let verified = match (&peer_name, fixed_peers) {
            (Some(name), Some(allowed)) => allowed.contains(name),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            // A tracker that cannot resolve the identity but imposes no
            // fixed-peer restriction still gets a verified signature.
            (None, None) => true,
        };

        Ok(VerifyResult { verified, peer_name })
    }

    /// Compute the shared symmetric key for `session_id` once both the
    /// local and the peer's ephemeral public keys are present.
    pub fn derive(&mut self, session_id: &str) -> Result<(), CryptoError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CryptoError::NoSessionKeys {
                session_id: session_id.to_string(),
            })?;
        let peer_public = session.peer_public.ok_or(CryptoError::KeyDerivation)?;
        let shared = x25519::dh(&session.local_private, &peer_public);
        session.shared_key = Some(shared);
        Ok(())
    }

    /// Authenticated-encrypt `plaintext` for `session_id`.
    pub fn encrypt(
        &self,
        session_id: &str,
        plaintext: &[u8],
    ) -> Result<([u8; aead::NONCE_LEN], Vec<u8>), CryptoError> {
        let session = self.session(session_id)?;
        let key = session.shared_key.ok_or(CryptoError::KeyDerivation)?;
        aead::encrypt(&key, plaintext)
    }

    /// Authenticated-decrypt `ciphertext` for `session_id`. Returns `None`
    /// on authentication failure without raising an error: callers must
    /// treat that as "tear this session down", not as a propagating error.
    pub fn decrypt(
        &self,
        session_id: &str,
        nonce: &[u8; aead::NONCE_LEN],
        ciphertext: &[u8],
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        let session = self.session(session_id)?;
        let key = session.shared_key.ok_or(CryptoError::KeyDerivation)?;
        Ok(aead::decrypt(&key, nonce, ciphertext))
    }

    /// Local ephemeral public key for `session_id`, to be sent in
    /// `ConnectRequest`/`ConnectResponse`.
    pub fn local_ephemeral_public(&self, session_id: &str) -> Result<[u8; x25519::KEY_LEN], CryptoError> {
        Ok(self.session(session_id)?.local_public)
    }

    /// Discard a session's key material once it closes.
    pub fn forget_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypter() -> Crypter {
        Crypter::new(identity::Identity::generate())
    }

    #[test]
    fn sign_and_verify_succeeds_for_genuine_peer() {
        let mut local = crypter();
        let mut peer = Crypter::new(identity::Identity::generate());

        local.new_session("s1");
        peer.new_session("s1");
        let peer_ephemeral = peer.local_ephemeral_public("s1").unwrap();
        let peer_signature = peer.sign("s1").unwrap();

        let result = local
            .verify("s1", "tracker1", peer.identity(), peer_ephemeral, peer_signature, None)
            .unwrap();
        assert!(result.verified);
    }

    #[test]
    fn verify_fails_on_tampered_signature() {
        let mut local = crypter();
        let mut peer = Crypter::new(identity::Identity::generate());
        peer.new_session("s1");
        local.new_session("s1");

        let mut bad_signature = peer.sign("s1").unwrap();
        bad_signature[0] ^= 0xff;
        let peer_ephemeral = peer.local_ephemeral_public("s1").unwrap();

        let result = local
            .verify("s1", "tracker1", peer.identity(), peer_ephemeral, bad_signature, None)
            .unwrap();
        assert!(!result.verified);
    }

    #[test]
    fn fixed_peers_rejects_unknown_name() {
        let mut local = crypter();
        let mut peer = Crypter::new(identity::Identity::generate());
        peer.new_session("s1");
        let peer_ephemeral = peer.local_ephemeral_public("s1").unwrap();
        let peer_signature = peer.sign("s1").unwrap();

        local.new_session("s1");
        local.bind_identity_name("tracker1", peer.identity(), "eve@example?srv".into());

        let mut allowed = HashSet::new();
        allowed.insert("alice@example?srv".to_string());

        let result = local
            .verify("s1", "tracker1", peer.identity(), peer_ephemeral, peer_signature, Some(&allowed))
            .unwrap();
        assert!(!result.verified);
        assert_eq!(result.peer_name.as_deref(), Some("eve@example?srv"));
    }

    #[test]
    fn encrypt_decrypt_roundtrip_after_derive() {
        let mut local = crypter();
        let mut peer = crypter();

        local.new_session("s1");
        peer.new_session("s1");

        let local_pub = local.local_ephemeral_public("s1").unwrap();
        let peer_pub = peer.local_ephemeral_public("s1").unwrap();

        local
            .verify("s1", "t", peer.identity(), peer_pub, peer.sign("s1").unwrap(), None)
            .unwrap();
        peer.verify("s1", "t", local.identity(), local_pub, local.sign("s1").unwrap(), None)
            .unwrap();

        local.derive("s1").unwrap();
        peer.derive("s1").unwrap();

        let (nonce, ciphertext) = local.encrypt("s1", b"hello").unwrap();
        let decrypted = peer.decrypt("s1", &nonce, &ciphertext).unwrap();
        assert_eq!(decrypted, Some(b"hello".to_vec()));
    }

    #[test]
    fn decrypt_without_derive_errors() {
        let mut local = crypter();
        local.new_session("s1");
        assert!(local.encrypt("s1", b"x").is_err());
    }

    #[test]
    fn tampered_ciphertext_yields_no_plaintext() {
        let mut local = crypter();
        let mut peer = crypter();
        local.new_session("s1");
        peer.new_session("s1");
        let local_pub = local.local_ephemeral_public("s1").unwrap();
        let peer_pub = peer.local_ephemeral_public("s1").unwrap();
        local
            .verify("s1", "t", peer.identity(), peer_pub, peer.sign("s1").unwrap(), None)
            .unwrap();
        peer.verify("s1", "t", local.identity(), local_pub, local.sign("s1").unwrap(), None)
            .unwrap();
        local.derive("s1").unwrap();
        peer.derive("s1").unwrap();

        let (nonce, mut ciphertext) = local.encrypt("s1", b"hello").unwrap();
        ciphertext[0] ^= 0x01;
        assert_eq!(peer.decrypt("s1", &nonce, &ciphertext).unwrap(), None);
    }
}

//! Symmetric payload encryption for established peer sessions.
//!
//! ChaCha20-Poly1305 with a random 96-bit nonce generated per call, carried
//! alongside the ciphertext on the wire (`EncryptedData { nonce, payload }`)
//! rather than derived from an implicit counter, since sessions here
//! multiplex many substreams and messages may be reordered by retransmission
//! below the inner-message layer.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` under `key`, returning a fresh random nonce and the
/// ciphertext (tag appended, per the `chacha20poly1305` crate's convention).
pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .map_err(|_| CryptoError::Encryption)?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt `ciphertext` under `key` and `nonce`. Returns `None` on any
/// authentication failure rather than propagating an error: per the
/// crypter's contract, a failed decryption tears down the offending
/// session but must never be treated as a fatal daemon error.
pub fn decrypt(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Option<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return None;
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(nonce);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [7u8; KEY_LEN];
        let plaintext = b"hello warren";

        let (nonce, ciphertext) = encrypt(&key, plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);

        let decrypted = decrypt(&key, &nonce, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn nonces_are_not_reused() {
        let key = [7u8; KEY_LEN];
        let (n1, _) = encrypt(&key, b"one").unwrap();
        let (n2, _) = encrypt(&key, b"two").unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let key = [7u8; KEY_LEN];
        let (nonce, mut ciphertext) = encrypt(&key, b"hello warren").unwrap();
        ciphertext[0] ^= 0x01;

        assert!(decrypt(&key, &nonce, &ciphertext).is_none());
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let key = [7u8; KEY_LEN];
        let wrong_key = [9u8; KEY_LEN];
        let (nonce, ciphertext) = encrypt(&key, b"hello warren").unwrap();

        assert!(decrypt(&wrong_key, &nonce, &ciphertext).is_none());
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let key = [0u8; KEY_LEN];
        let (nonce, ciphertext) = encrypt(&key, &[]).unwrap();
        assert_eq!(ciphertext.len(), TAG_LEN);
        assert_eq!(decrypt(&key, &nonce, &ciphertext).unwrap(), Vec::<u8>::new());
    }
}

//! Credential envelope: AES-256-GCM `seal`/`open` over credential bytes.
//!
//! The master key is loaded once from `CWATCHER_MASTER_KEY` (32 raw bytes,
//! base64) and held as a `zeroize`-on-drop key object. Plaintext is never
//! logged; callers that decrypt credentials must scope the plaintext
//! tightly and let it drop as soon as the SSH dial consumes it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CwError, CwResult};

const NONCE_LEN: usize = 12;

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MasterKey(bytes)
    }

    /// Loads the key from `CWATCHER_MASTER_KEY` (standard base64 of 32 raw
    /// bytes).
    pub fn from_env() -> CwResult<Self> {
        let encoded = std::env::var("CWATCHER_MASTER_KEY")
            .map_err(|_| CwError::Validation("CWATCHER_MASTER_KEY is not set".into()))?;
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CwError::Validation(format!("CWATCHER_MASTER_KEY is not valid base64: {e}")))?;
        let arr: [u8; 32] = raw
            .try_into()
            .map_err(|_| CwError::Validation("CWATCHER_MASTER_KEY must decode to 32 bytes".into()))?;
        Ok(MasterKey(arr))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&self.0).expect("key is exactly 32 bytes")
    }
}

/// Envelope: `seal`/`open` over a single [`MasterKey`].
pub struct Envelope {
    key: MasterKey,
}

impl Envelope {
    pub fn new(key: MasterKey) -> Self {
        Envelope { key }
    }

    /// Seals `plaintext`, prefixing a fresh random 96-bit nonce to the
    /// ciphertext. Safe to persist and log the result.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let cipher = self.key.cipher();
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .expect("AES-GCM encryption over bounded plaintext cannot fail");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Opens a blob produced by [`Envelope::seal`].
    pub fn open(&self, sealed: &[u8]) -> CwResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(CwError::Validation("sealed blob too short".into()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = self.key.cipher();
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CwError::Validation("sealed blob failed to authenticate".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_envelope() -> Envelope {
        Envelope::new(MasterKey::from_bytes([7u8; 32]))
    }

    #[test]
    fn seal_then_open_round_trips() {
        let env = test_envelope();
        let plaintext = b"hunter2".to_vec();
        let sealed = env.seal(&plaintext);
        assert_ne!(sealed, plaintext);
        let opened = env.open(&sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let env = test_envelope();
        let mut sealed = env.seal(b"secret-password");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(env.open(&sealed).is_err());
    }

    #[test]
    fn two_seals_of_same_plaintext_differ() {
        let env = test_envelope();
        let a = env.seal(b"same");
        let b = env.seal(b"same");
        assert_ne!(a, b);
    }

    #[test]
    fn master_key_from_env_decodes_standard_base64() {
        std::env::set_var("CWATCHER_MASTER_KEY", base64::engine::general_purpose::STANDARD.encode([9u8; 32]));
        let key = MasterKey::from_env().unwrap();
        assert_eq!(key.0, [9u8; 32]);
        std::env::remove_var("CWATCHER_MASTER_KEY");
    }
}

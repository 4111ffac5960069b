//! The AEAD cipher container.
//!
//! Holds the current group key and the previous one. Encryption always uses
//! the current key; decryption tries the current key first and falls back to
//! the previous one, which is what keeps concurrent sessions alive across a
//! rekey: a frame sealed under key `K_n` still opens after the container
//! rotated to `K_{n+1}`.

use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand_core::{OsRng, RngCore};
use tokio::sync::RwLock;

use crate::error::CipherError;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

#[derive(Default)]
pub struct Cipher {
    current: Option<ChaCha20Poly1305>,
    previous: Option<ChaCha20Poly1305>,
}

impl Cipher {
    /// Install `key` as the current key, rotating the previous current key
    /// into the fallback slot.
    pub fn update(&mut self, key: &[u8]) -> Result<(), CipherError> {
        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKey);
        }

        let fresh = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?;
        self.previous = self.current.take();
        self.current = Some(fresh);
        Ok(())
    }

    /// Seal `plaintext` under the current key with a fresh random nonce.
    /// Returns `nonce ‖ ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let aead = self.current.as_ref().ok_or(CipherError::NoKey)?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let sealed = aead
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: ad,
                },
            )
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open `ciphertext`, trying the current key and then the previous one.
    pub fn decrypt(&self, nonce: &[u8], ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        if nonce.len() != NONCE_SIZE {
            return Err(CipherError::Decrypt);
        }

        let current = self.current.as_ref().ok_or(CipherError::NoKey)?;
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload {
            msg: ciphertext,
            aad: ad,
        };

        if let Ok(plaintext) = current.decrypt(nonce, payload) {
            return Ok(plaintext);
        }

        let previous = self.previous.as_ref().ok_or(CipherError::Decrypt)?;
        previous
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: ad,
                },
            )
            .map_err(|_| CipherError::Decrypt)
    }

    pub fn ok(&self) -> bool {
        self.current.is_some()
    }
}

/// A cipher container shared between components.
///
/// `update` is exclusive with `encrypt`/`decrypt`, so no reader ever
/// observes a torn key pair.
#[derive(Clone, Default)]
pub struct SharedCipher(Arc<RwLock<Cipher>>);

impl SharedCipher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, key: &[u8]) -> Result<(), CipherError> {
        self.0.write().await.update(key)
    }

    pub async fn encrypt(&self, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.0.read().await.encrypt(plaintext, ad)
    }

    pub async fn decrypt(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
        ad: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        self.0.read().await.decrypt(nonce, ciphertext, ad)
    }

    pub async fn ok(&self) -> bool {
        self.0.read().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(cipher: &Cipher, plaintext: &[u8], ad: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let bytes = cipher.encrypt(plaintext, ad).unwrap();
        (bytes[..NONCE_SIZE].to_vec(), bytes[NONCE_SIZE..].to_vec())
    }

    #[test]
    fn rejects_bad_key_sizes() {
        let mut cipher = Cipher::default();
        assert_eq!(cipher.update(&[0u8; 16]), Err(CipherError::InvalidKey));
        assert_eq!(cipher.update(&[0u8; 33]), Err(CipherError::InvalidKey));
        assert!(!cipher.ok());
        assert!(cipher.update(&[0u8; KEY_SIZE]).is_ok());
        assert!(cipher.ok());
    }

    #[test]
    fn no_key_no_service() {
        let cipher = Cipher::default();
        assert_eq!(cipher.encrypt(b"x", b""), Err(CipherError::NoKey));
        assert_eq!(cipher.decrypt(&[0; NONCE_SIZE], b"x", b""), Err(CipherError::NoKey));
    }

    #[test]
    fn round_trip_with_associated_data() {
        let mut cipher = Cipher::default();
        cipher.update(&[7u8; KEY_SIZE]).unwrap();

        let (nonce, ct) = sealed(&cipher, b"payload", b"context");
        assert_eq!(cipher.decrypt(&nonce, &ct, b"context").unwrap(), b"payload");
        assert_eq!(
            cipher.decrypt(&nonce, &ct, b"other"),
            Err(CipherError::Decrypt)
        );
    }

    #[test]
    fn previous_key_still_decrypts_after_update() {
        let mut cipher = Cipher::default();
        cipher.update(&[1u8; KEY_SIZE]).unwrap();
        let (old_nonce, old_ct) = sealed(&cipher, b"old epoch", b"");

        cipher.update(&[2u8; KEY_SIZE]).unwrap();
        let (new_nonce, new_ct) = sealed(&cipher, b"new epoch", b"");

        assert_eq!(cipher.decrypt(&old_nonce, &old_ct, b"").unwrap(), b"old epoch");
        assert_eq!(cipher.decrypt(&new_nonce, &new_ct, b"").unwrap(), b"new epoch");

        // A second rotation finally retires the first key.
        cipher.update(&[3u8; KEY_SIZE]).unwrap();
        assert_eq!(
            cipher.decrypt(&old_nonce, &old_ct, b""),
            Err(CipherError::Decrypt)
        );
    }

    #[test]
    fn truncated_nonce_is_rejected() {
        let mut cipher = Cipher::default();
        cipher.update(&[7u8; KEY_SIZE]).unwrap();
        assert_eq!(cipher.decrypt(&[0; 4], b"ct", b""), Err(CipherError::Decrypt));
    }
}

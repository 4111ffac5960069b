//! Wire field types shared by the session messages.
//!
//! All multi-byte integers are big-endian on the wire. Each fixed-width
//! field carries a `WIRE_SIZE` so the message layouts can be computed as
//! constants.

use std::fmt;

use codec::{Decode, Encode};
use rand_core::{CryptoRng, RngCore};

use crate::cipher::{SharedCipher, NONCE_SIZE, TAG_SIZE};
use crate::error::{CipherError, Error};

/// A 32-bit session identifier, drawn uniformly at random on the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct SessionId(pub u32);

impl SessionId {
    pub const WIRE_SIZE: usize = 4;

    pub fn random(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        Self(rng.next_u32())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A one-byte chunk counter, advancing mod 256.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct SequenceNumber(pub u8);

impl SequenceNumber {
    pub const WIRE_SIZE: usize = 1;

    pub fn advance(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Total byte count of a session's message, announced in the start frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct MessageLength(pub u16);

impl MessageLength {
    pub const WIRE_SIZE: usize = 2;
}

/// 30 bytes of caller-supplied plaintext context, zero-padded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct ExtraData(pub [u8; 30]);

impl ExtraData {
    pub const WIRE_SIZE: usize = 30;

    /// Zero-pad (or truncate) `value` into the fixed field width.
    pub fn from_slice(value: &[u8]) -> Self {
        let mut data = [0u8; Self::WIRE_SIZE];
        let take = value.len().min(Self::WIRE_SIZE);
        data[..take].copy_from_slice(&value[..take]);
        Self(data)
    }
}

/// `nonce ‖ ciphertext` as produced by the cipher container. The trailing
/// position in every message layout lets the ciphertext swallow the
/// remainder of the frame.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct CipherData {
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl CipherData {
    /// Bytes the field occupies beyond the plaintext: nonce plus tag.
    pub const WIRE_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

    /// Seal `plaintext` with `ad` as associated data.
    pub async fn seal(
        cipher: &SharedCipher,
        plaintext: &[u8],
        ad: &[u8],
    ) -> Result<Self, CipherError> {
        let bytes = cipher.encrypt(plaintext, ad).await?;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);
        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_SIZE..].to_vec(),
        })
    }

    /// Decrypt against `ad`, trying the container's current and previous
    /// keys.
    pub async fn open(&self, cipher: &SharedCipher, ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        cipher.decrypt(&self.nonce, &self.ciphertext, ad).await
    }

    /// Parse from raw bytes; there must be at least room for nonce and tag.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::WIRE_OVERHEAD {
            return Err(Error::Format);
        }
        Ok(Self::decode(&mut &data[..])?)
    }
}

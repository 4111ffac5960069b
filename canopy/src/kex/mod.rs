//! Key exchange.
//!
//! The keyserver owns a long-term X25519 scalar and an Ed25519 signing key.
//! Peers learn the public halves from a broadcast, derive a per-peer wrap
//! key over X25519 + HKDF-SHA256, and receive the current group key sealed
//! under that wrap key. The group key lands in the shared cipher container
//! that Canopy sessions draw from.

pub mod client;
pub mod server;

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use blake2::{Blake2s256, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use curve25519_dalek::scalar::clamp_integer;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use log::info;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::bus::Filter;
use crate::cipher::{NONCE_SIZE, TAG_SIZE};
use crate::error::{CipherError, Error};

pub use client::{Client, ClientHandle};
pub use server::Server;

/// HKDF info string binding derived wrap keys to this exchange.
pub const EXCHANGE_INFO: &[u8] = b"keyserver-exch";

/// Size of `x25519_public ‖ second half`, shared by the broadcast key
/// block and the request block.
pub const KEY_BLOCK_LEN: usize = 64;

pub const PRIVATE_KEY_FILE: &str = "private.key";
pub const SIGNING_KEY_FILE: &str = "signing.key";

/// Message ids the keyserver side listens on and emits. The per-peer request
/// ids carry a display label so the log tells the peers apart.
#[derive(Clone, Debug)]
pub struct ServerIds {
    pub pubkey_broadcast: u32,
    pub share_symmetric: u32,
    pub rekey_notify: u32,
    pub request: u32,
    pub symmetric_req: Vec<(u32, String)>,
    pub rekey_req: Vec<(u32, String)>,
}

impl ServerIds {
    pub fn recv_ids(&self) -> Vec<u32> {
        let mut ids = vec![self.request];
        ids.extend(self.symmetric_req.iter().map(|(id, _)| *id));
        ids.extend(self.rekey_req.iter().map(|(id, _)| *id));
        ids
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.recv_ids().into_iter().map(Filter::exact).collect()
    }
}

/// Message ids a peer listens on and emits.
#[derive(Clone, Copy, Debug)]
pub struct ClientIds {
    pub recv_pubkey: u32,
    pub recv_symmetric: u32,
    pub recv_rekey: u32,
    pub request: u32,
}

impl ClientIds {
    pub fn recv_ids(&self) -> [u32; 3] {
        [self.recv_pubkey, self.recv_symmetric, self.recv_rekey]
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.recv_ids().iter().copied().map(Filter::exact).collect()
    }
}

/// The keyserver's long-term keys. Created once at start-up and passed to
/// the components that need it (the exchange server, the ticket issuer).
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        Self::from_scalar(raw, SigningKey::generate(&mut OsRng))
    }

    /// Build from stored key material: a 32-byte X25519 scalar and 64 bytes
    /// of Ed25519 keypair data.
    pub fn from_bytes(private: [u8; 32], signing: &[u8]) -> Result<Self, Error> {
        let signing: [u8; 64] = signing.try_into().map_err(|_| Error::Format)?;
        let signing = SigningKey::from_keypair_bytes(&signing).map_err(|_| Error::Format)?;
        Ok(Self::from_scalar(private, signing))
    }

    fn from_scalar(raw: [u8; 32], signing: SigningKey) -> Self {
        let secret = StaticSecret::from(clamp_integer(raw));
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            signing,
        }
    }

    /// Load keys from `data_dir`, generating and persisting (mode 0600) any
    /// piece that is missing or unreadable.
    pub fn load_or_generate(data_dir: &Path) -> io::Result<Self> {
        let private_path = data_dir.join(PRIVATE_KEY_FILE);
        let signing_path = data_dir.join(SIGNING_KEY_FILE);

        let stored_private: Option<[u8; 32]> = fs::read(&private_path)
            .ok()
            .and_then(|bytes| bytes.try_into().ok());
        let stored_signing = fs::read(&signing_path)
            .ok()
            .and_then(|bytes| <[u8; 64]>::try_from(bytes.as_slice()).ok())
            .and_then(|bytes| SigningKey::from_keypair_bytes(&bytes).ok());

        let private = match stored_private {
            Some(private) => private,
            None => {
                let mut raw = [0u8; 32];
                OsRng.fill_bytes(&mut raw);
                // Persist the clamped form, which is what the exchange uses.
                let clamped = clamp_integer(raw);
                write_secret(&private_path, &clamped)?;
                info!("saved freshly generated private key");
                clamped
            }
        };
        let signing = match stored_signing {
            Some(signing) => signing,
            None => {
                let signing = SigningKey::generate(&mut OsRng);
                write_secret(&signing_path, &signing.to_keypair_bytes())?;
                info!("saved freshly generated signing key");
                signing
            }
        };

        Ok(Self::from_scalar(private, signing))
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The broadcast payload: `x25519_public ‖ ed25519_verifying`.
    pub fn public_block(&self) -> [u8; KEY_BLOCK_LEN] {
        let mut block = [0u8; KEY_BLOCK_LEN];
        block[..32].copy_from_slice(self.public.as_bytes());
        block[32..].copy_from_slice(self.verifying_key().as_bytes());
        block
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing.sign(data)
    }

    /// The wrap key shared with `peer_public`.
    pub fn wrap_key_for(&self, peer_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CipherError> {
        derive_wrap_key(&self.secret, peer_public)
    }
}

fn write_secret(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

/// `HKDF-SHA256(X25519(secret, peer_public), info = "keyserver-exch")`.
pub fn derive_wrap_key(
    secret: &StaticSecret,
    peer_public: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, CipherError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    let mut wrap = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(None, shared.as_bytes())
        .expand(EXCHANGE_INFO, &mut wrap[..])
        .map_err(|_| CipherError::Derive)?;
    Ok(wrap)
}

/// A peer's key request: `public ‖ BLAKE2s-256(public)`.
pub fn request_block(public: &[u8; 32]) -> [u8; KEY_BLOCK_LEN] {
    let digest = Blake2s256::digest(public);
    let mut block = [0u8; KEY_BLOCK_LEN];
    block[..32].copy_from_slice(public);
    block[32..].copy_from_slice(&digest);
    block
}

/// Validate a request block and extract the peer public key.
pub fn parse_request_block(data: &[u8]) -> Result<[u8; 32], Error> {
    if data.len() != KEY_BLOCK_LEN {
        return Err(Error::Format);
    }

    let mut public = [0u8; 32];
    public.copy_from_slice(&data[..32]);
    let digest = Blake2s256::digest(public);
    if digest.as_slice() != &data[32..] {
        return Err(Error::Format);
    }
    Ok(public)
}

/// Seal `plaintext` under a raw 32-byte key with a fresh nonce and no
/// associated data; used for key transport and ticket replies.
pub fn seal_with_key(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let aead = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?;
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let sealed = aead
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a `nonce ‖ ciphertext` blob sealed with [`seal_with_key`]. This is
/// how a peer opens the ticket replies sealed under its wrap key.
pub fn open_with_key(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CipherError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CipherError::Decrypt);
    }
    let aead = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?;
    aead.decrypt(Nonce::from_slice(&data[..NONCE_SIZE]), &data[NONCE_SIZE..])
        .map_err(|_| CipherError::Decrypt)
}

//! Signed single-use capabilities.
//!
//! The keyserver issues a ticket over Canopy: a `(id, timestamp)` pair,
//! signed with its Ed25519 key and sealed under the requesting peer's wrap
//! key. A consumer verifies the signature and expiry and burns the id in a
//! single-use table, so each ticket authorises exactly one action within
//! its validity window.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use codec::{Decode, Encode, Opaque};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use log::warn;
use rand_core::{OsRng, RngCore};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::error::{Error, TicketError};
use crate::kex::{seal_with_key, Keypair};
use crate::proto::SessionId;
use crate::server::{ReplyBuilder, SessionState};

pub const TICKET_VALID_SECS: u64 = 20;

/// The signed payload: a random id and an issue timestamp in unix seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Ticket {
    pub ticket_id: u32,
    pub timestamp: u32,
}

impl Ticket {
    pub fn to_bytes(&self) -> Vec<u8> {
        codec::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TicketError> {
        let mut buffer = data;
        let ticket = Self::decode(&mut buffer).map_err(|_| TicketError::Malformed)?;
        if !buffer.is_empty() {
            return Err(TicketError::Malformed);
        }
        Ok(ticket)
    }
}

/// The outer envelope: the serialised ticket and its Ed25519 signature,
/// each length-prefixed.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SignedTicket {
    pub data: Opaque<u16>,
    pub signature: Opaque<u16>,
}

impl SignedTicket {
    pub fn to_bytes(&self) -> Vec<u8> {
        codec::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, TicketError> {
        let mut buffer = data;
        let signed = Self::decode(&mut buffer).map_err(|_| TicketError::Malformed)?;
        if !buffer.is_empty() {
            return Err(TicketError::Malformed);
        }
        Ok(signed)
    }
}

/// Issues tickets on the keyserver. Plugged into a Canopy server as its
/// reply builder: the request payload is the peer's X25519 public key, the
/// reply is the sealed ticket.
pub struct TicketIssuer {
    keys: Arc<Keypair>,
}

impl TicketIssuer {
    pub fn new(keys: Arc<Keypair>) -> Self {
        Self { keys }
    }

    /// Mint, sign and seal one ticket for `peer_public`.
    pub fn issue(&self, peer_public: &[u8; 32]) -> Result<Vec<u8>, Error> {
        let ticket = Ticket {
            ticket_id: OsRng.next_u32(),
            timestamp: unix_now() as u32,
        };

        let data = ticket.to_bytes();
        let signature = self.keys.sign(&data);
        let signed = SignedTicket {
            data: data.into(),
            signature: signature.to_bytes().to_vec().into(),
        };

        let wrap = self.keys.wrap_key_for(peer_public)?;
        Ok(seal_with_key(&wrap, &signed.to_bytes())?)
    }
}

#[async_trait]
impl ReplyBuilder for TicketIssuer {
    async fn build_reply(
        &self,
        session: SessionId,
        request: &[u8],
        _state: &mut SessionState,
    ) -> Vec<u8> {
        let Ok(peer_public) = <[u8; 32]>::try_from(request) else {
            return b"Err: expected a 32 byte public key".to_vec();
        };

        match self.issue(&peer_public) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("[{session}] could not issue ticket: {e}");
                b"Err: could not issue ticket".to_vec()
            }
        }
    }
}

/// Verifies tickets on a consumer and enforces single use.
#[derive(Default)]
pub struct TicketVerifier {
    verify_key: RwLock<Option<VerifyingKey>>,
    // ticket id → unix expiry; rows outlive their window only until the
    // next write-locked pass prunes them.
    used: RwLock<FxHashMap<u32, u64>>,
}

impl TicketVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the keyserver's verification key, as learned over KEX.
    pub async fn set_public_key(&self, key: VerifyingKey) {
        *self.verify_key.write().await = Some(key);
    }

    /// Check signature, expiry and uniqueness, and burn the ticket id.
    pub async fn verify(&self, raw: &[u8]) -> Result<(), TicketError> {
        let key = self
            .verify_key
            .read()
            .await
            .clone()
            .ok_or(TicketError::MissingKey)?;

        let signed = SignedTicket::from_bytes(raw)?;
        let ticket = Ticket::from_bytes(&signed.data)?;

        let now = unix_now();
        let expires_at = u64::from(ticket.timestamp) + TICKET_VALID_SECS;
        if now > expires_at {
            return Err(TicketError::Expired);
        }

        // Cheap read-locked check first; the authoritative one comes after
        // the signature, under the write lock.
        if self.is_used(ticket.ticket_id, now).await {
            return Err(TicketError::AlreadyUsed);
        }

        let signature =
            Signature::from_slice(&signed.signature).map_err(|_| TicketError::BadSignature)?;
        key.verify(&signed.data, &signature)
            .map_err(|_| TicketError::BadSignature)?;

        // The double-check closes the race between two concurrent uses of
        // the same ticket.
        let mut used = self.used.write().await;
        used.retain(|_, expiry| *expiry > now);
        if used.contains_key(&ticket.ticket_id) {
            return Err(TicketError::AlreadyUsed);
        }
        used.insert(ticket.ticket_id, expires_at);
        Ok(())
    }

    async fn is_used(&self, ticket_id: u32, now: u64) -> bool {
        self.used
            .read()
            .await
            .get(&ticket_id)
            .is_some_and(|expiry| *expiry > now)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

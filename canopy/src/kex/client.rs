//! The peer role of the exchange.

use std::sync::Arc;
use std::time::Duration;

use curve25519_dalek::scalar::clamp_integer;
use ed25519_dalek::VerifyingKey;
use log::{debug, info};
use rand_core::{OsRng, RngCore};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::bus::Frame;
use crate::cipher::{SharedCipher, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{BusError, CipherError, Error};

use super::{derive_wrap_key, open_with_key, request_block, ClientIds, KEY_BLOCK_LEN};

/// What a peer has learned from the keyserver so far.
#[derive(Default)]
struct PeerKeys {
    wrap_key: Option<Zeroizing<[u8; KEY_SIZE]>>,
    ticket_key: Option<VerifyingKey>,
}

/// Read access to the exchange results for other subsystems: the ticket
/// verifier needs the keyserver's Ed25519 key, per-user side channels need
/// the wrap key.
#[derive(Clone)]
pub struct ClientHandle {
    peer: Arc<RwLock<PeerKeys>>,
}

impl ClientHandle {
    pub async fn wrap_key(&self) -> Option<Zeroizing<[u8; KEY_SIZE]>> {
        self.peer.read().await.wrap_key.clone()
    }

    pub async fn ticket_verifying_key(&self) -> Option<VerifyingKey> {
        self.peer.read().await.ticket_key.clone()
    }
}

/// The exchange client: requests the group key until the cipher container
/// is usable and keeps following rekeys afterwards.
pub struct Client {
    cipher: SharedCipher,
    send_queue: mpsc::Sender<Frame>,
    ids: ClientIds,
    secret: StaticSecret,
    public: PublicKey,
    peer: Arc<RwLock<PeerKeys>>,
}

impl Client {
    pub fn new(
        cipher: SharedCipher,
        send_queue: mpsc::Sender<Frame>,
        ids: ClientIds,
    ) -> (Self, ClientHandle) {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        Self::with_secret(cipher, send_queue, ids, raw)
    }

    /// Build from a preseeded scalar (clamped here, as everywhere).
    pub fn with_secret(
        cipher: SharedCipher,
        send_queue: mpsc::Sender<Frame>,
        ids: ClientIds,
        secret: [u8; 32],
    ) -> (Self, ClientHandle) {
        let secret = StaticSecret::from(clamp_integer(secret));
        let public = PublicKey::from(&secret);
        let peer: Arc<RwLock<PeerKeys>> = Default::default();

        debug!("exchange client public key {}", hex::encode(public.as_bytes()));

        let handle = ClientHandle { peer: peer.clone() };
        (
            Self {
                cipher,
                send_queue,
                ids,
                secret,
                public,
                peer,
            },
            handle,
        )
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Drive the exchange until the inbox closes. Requests go out at 1 Hz
    /// while either the wrap key or the cipher container is missing.
    pub async fn run(self, mut inbox: mpsc::Receiver<Frame>) {
        let mut ticker = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                maybe = inbox.recv() => {
                    let Some(frame) = maybe else { break };
                    if let Err(e) = self.handle_frame(&frame).await {
                        debug!("exchange frame on {:x} dropped: {e}", frame.id);
                    }
                }
                _ = ticker.tick() => {
                    if !self.ready().await {
                        if let Err(e) = self.send_request().await {
                            debug!("could not request group key: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn ready(&self) -> bool {
        self.peer.read().await.wrap_key.is_some() && self.cipher.ok().await
    }

    async fn send_request(&self) -> Result<(), Error> {
        let block = request_block(self.public.as_bytes());
        self.send_queue
            .send(Frame::new(self.ids.request, block.to_vec()))
            .await
            .map_err(|_| BusError::Closed)?;
        Ok(())
    }

    async fn handle_frame(&self, frame: &Frame) -> Result<(), Error> {
        if frame.id == self.ids.recv_pubkey {
            self.handle_public_key(&frame.data).await
        } else if frame.id == self.ids.recv_symmetric {
            self.handle_symmetric(&frame.data).await
        } else if frame.id == self.ids.recv_rekey {
            debug!("got re-key notification");
            self.handle_public_key(&frame.data).await?;
            self.send_request().await
        } else {
            Ok(())
        }
    }

    /// `server_x25519 ‖ server_ed25519`: derive the wrap key and remember
    /// the ticket verification key.
    async fn handle_public_key(&self, data: &[u8]) -> Result<(), Error> {
        if data.len() != KEY_BLOCK_LEN {
            return Err(Error::Format);
        }

        let mut server_public = [0u8; 32];
        server_public.copy_from_slice(&data[..32]);
        let ticket_key = VerifyingKey::from_bytes(data[32..].try_into().map_err(|_| Error::Format)?)
            .map_err(|_| Error::Format)?;

        let wrap = derive_wrap_key(&self.secret, &server_public)?;

        let mut peer = self.peer.write().await;
        peer.wrap_key = Some(wrap);
        peer.ticket_key = Some(ticket_key);
        Ok(())
    }

    /// A sealed group key went by. If our wrap key opens it, install it;
    /// otherwise it was addressed to another peer and is not an error.
    async fn handle_symmetric(&self, data: &[u8]) -> Result<(), Error> {
        let wrap = self
            .peer
            .read()
            .await
            .wrap_key
            .clone()
            .ok_or(CipherError::NoKey)?;

        if data.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
            return Err(Error::Format);
        }

        match open_with_key(&wrap, data) {
            Err(_) => Ok(()),
            Ok(group_key) => {
                self.cipher.update(&group_key).await?;
                info!("shared key updated");
                Ok(())
            }
        }
    }
}

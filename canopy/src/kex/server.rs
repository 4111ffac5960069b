//! The keyserver role of the exchange.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand_core::{OsRng, RngCore};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use zeroize::Zeroizing;

use crate::bus::Frame;
use crate::cipher::{SharedCipher, KEY_SIZE};
use crate::error::{BusError, CipherError, Error};

use super::{parse_request_block, seal_with_key, Keypair, ServerIds};

pub const DEFAULT_REKEY_INTERVAL: Duration = Duration::from_secs(75);

/// The exchange server: answers key requests and rotates the group key.
pub struct Server {
    cipher: SharedCipher,
    send_queue: mpsc::Sender<Frame>,
    ids: ServerIds,
    keys: Arc<Keypair>,
    group_key: Zeroizing<[u8; KEY_SIZE]>,
    rekey_interval: Duration,
}

impl Server {
    /// Create the server, minting the initial group key and installing it
    /// into the local cipher container.
    pub async fn new(
        cipher: SharedCipher,
        send_queue: mpsc::Sender<Frame>,
        ids: ServerIds,
        keys: Arc<Keypair>,
        rekey_interval: Duration,
    ) -> Result<Self, CipherError> {
        let mut group_key = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut group_key[..]);
        cipher.update(&group_key[..]).await?;

        info!(
            "key exchange server up, public key {}",
            hex::encode(keys.public_bytes())
        );

        Ok(Self {
            cipher,
            send_queue,
            ids,
            keys,
            group_key,
            rekey_interval,
        })
    }

    pub fn recv_ids(&self) -> Vec<u32> {
        self.ids.recv_ids()
    }

    /// Drive the exchange until the inbox closes.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Frame>) {
        let mut rekey = interval_at(Instant::now() + self.rekey_interval, self.rekey_interval);

        loop {
            tokio::select! {
                maybe = inbox.recv() => {
                    let Some(frame) = maybe else { break };
                    if let Err(e) = self.handle_frame(&frame).await {
                        debug!("key exchange frame on {:x} dropped: {e}", frame.id);
                    }
                }
                _ = rekey.tick() => self.rotate_group_key().await,
            }
        }
    }

    async fn handle_frame(&self, frame: &Frame) -> Result<(), Error> {
        if frame.id == self.ids.request {
            if frame.data.is_empty() {
                self.broadcast_public_key().await?;
            }
            return Ok(());
        }

        if let Some((_, label)) = self.ids.symmetric_req.iter().find(|(id, _)| *id == frame.id) {
            debug!("{label}: sharing the group key");
            return self.share_symmetric(&frame.data, true).await;
        }

        if let Some((_, label)) = self.ids.rekey_req.iter().find(|(id, _)| *id == frame.id) {
            debug!("{label}: sharing the group key after rekey");
            return self.share_symmetric(&frame.data, false).await;
        }

        Ok(())
    }

    /// Answer a peer's request: validate its key block, wrap the current
    /// group key for it, and put the transport on the bus. Initial requests
    /// also get the public-key broadcast so the peer can verify tickets.
    async fn share_symmetric(&self, data: &[u8], send_pubkey: bool) -> Result<(), Error> {
        let peer_public = parse_request_block(data)?;
        let wrap = self.keys.wrap_key_for(&peer_public)?;
        let sealed = seal_with_key(&wrap, &self.group_key[..])?;

        if send_pubkey {
            self.broadcast_public_key().await?;
        }

        self.dispatch(Frame::new(self.ids.share_symmetric, sealed))
            .await
    }

    async fn broadcast_public_key(&self) -> Result<(), Error> {
        self.dispatch(Frame::new(
            self.ids.pubkey_broadcast,
            self.keys.public_block().to_vec(),
        ))
        .await
    }

    /// Mint a new group key. The notification goes out before the local
    /// container rotates so peers that answer promptly are served the new
    /// key, and the container keeps the old key in its fallback slot for
    /// sessions still in flight.
    async fn rotate_group_key(&mut self) {
        let mut fresh = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut fresh[..]);

        info!("sending re-key notification");
        if let Err(e) = self
            .dispatch(Frame::new(
                self.ids.rekey_notify,
                self.keys.public_block().to_vec(),
            ))
            .await
        {
            warn!("could not broadcast re-key notification: {e}");
            return;
        }

        if let Err(e) = self.cipher.update(&fresh[..]).await {
            warn!("could not install new group key: {e}");
            return;
        }
        self.group_key = fresh;
    }

    async fn dispatch(&self, frame: Frame) -> Result<(), Error> {
        self.send_queue
            .send(frame)
            .await
            .map_err(|_| BusError::Closed)?;
        Ok(())
    }
}

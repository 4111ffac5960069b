//! The Canopy client: submits one message per session and awaits the reply.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rand_core::{CryptoRng, OsRng, RngCore};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;

use crate::bus::Frame;
use crate::cipher::SharedCipher;
use crate::error::{BusError, CipherError, Error};
use crate::proto::{
    ChannelIds, CipherData, ExtraData, MessageLength, SequenceNumber, SessionData, SessionId,
    SessionStart, MAX_MESSAGE,
};

pub const REPLY_TIMEOUT: Duration = Duration::from_secs(6);

/// Reassembly state of one outstanding request, owned by the session table
/// and filled in by the reply handlers.
struct Pending {
    remaining: usize,
    buffer: Vec<u8>,
    seq: SequenceNumber,
    done: Option<oneshot::Sender<Vec<u8>>>,
}

/// A Canopy client over one channel. Cheap to clone; `send` may be called
/// from any number of tasks concurrently while one task drives [`run`].
#[derive(Clone)]
pub struct Client {
    cipher: SharedCipher,
    send_queue: mpsc::Sender<Frame>,
    ids: ChannelIds,
    sessions: Arc<RwLock<FxHashMap<SessionId, Pending>>>,
}

impl Client {
    pub fn new(cipher: SharedCipher, send_queue: mpsc::Sender<Frame>, ids: ChannelIds) -> Self {
        Self {
            cipher,
            send_queue,
            ids,
            sessions: Default::default(),
        }
    }

    pub fn recv_ids(&self) -> [u32; 2] {
        self.ids.reply_ids()
    }

    /// Send `payload` and await the peer's reply.
    pub async fn send(&self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        self.send_with_start_data(payload, ExtraData::default()).await
    }

    /// Send `payload` with 30 bytes of plaintext context in the start frame.
    pub async fn send_with_start_data(
        &self,
        payload: &[u8],
        start_data: ExtraData,
    ) -> Result<Vec<u8>, Error> {
        if !self.cipher.ok().await {
            return Err(CipherError::NoKey.into());
        }

        // The whole-message authenticator: an empty-plaintext seal over the
        // full payload, appended so the receiver can detect anything the
        // per-frame tags cannot, like chunks missing off the end.
        let tag = CipherData::seal(&self.cipher, &[], payload).await?;
        let mut message = payload.to_vec();
        message.extend_from_slice(&codec::to_vec(&tag));

        if message.len() > MAX_MESSAGE {
            return Err(Error::PayloadTooLarge {
                len: message.len(),
                max: MAX_MESSAGE,
            });
        }

        let (session, done) = self.open_session(&mut OsRng).await;
        let result = self.exchange(session, &message, start_data, done).await;
        self.sessions.write().await.remove(&session);
        result
    }

    /// Reserve a fresh random session id, drawing again on collision.
    async fn open_session(
        &self,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> (SessionId, oneshot::Receiver<Vec<u8>>) {
        let mut table = self.sessions.write().await;
        loop {
            let session = SessionId::random(rng);
            if table.contains_key(&session) {
                continue;
            }

            let (done, reply) = oneshot::channel();
            table.insert(
                session,
                Pending {
                    remaining: 0,
                    buffer: Vec::new(),
                    seq: SequenceNumber::default(),
                    done: Some(done),
                },
            );
            return (session, reply);
        }
    }

    async fn exchange(
        &self,
        session: SessionId,
        message: &[u8],
        start_data: ExtraData,
        reply: oneshot::Receiver<Vec<u8>>,
    ) -> Result<Vec<u8>, Error> {
        let start = SessionStart::seal(
            &self.cipher,
            session,
            MessageLength(message.len() as u16),
            start_data,
        )
        .await?;
        self.dispatch(start.into_frame(self.ids.start)).await?;

        for (index, chunk) in message.chunks(SessionData::MAX_CHUNK).enumerate() {
            let seq = SequenceNumber((index % 256) as u8);
            let data = SessionData::seal(&self.cipher, session, seq, chunk).await?;
            self.dispatch(data.into_frame(self.ids.data)).await?;
        }

        match timeout(REPLY_TIMEOUT, reply).await {
            Ok(Ok(buffer)) => Ok(buffer),
            Ok(Err(_)) | Err(_) => Err(Error::Timeout),
        }
    }

    async fn dispatch(&self, frame: Frame) -> Result<(), Error> {
        self.send_queue
            .send(frame)
            .await
            .map_err(|_| BusError::Closed)?;
        Ok(())
    }

    /// Consume reply frames until the inbox closes.
    pub async fn run(self, mut inbox: mpsc::Receiver<Frame>) {
        while let Some(frame) = inbox.recv().await {
            let result = if frame.id == self.ids.reply_start {
                self.handle_reply_start(&frame).await
            } else if frame.id == self.ids.reply_data {
                self.handle_reply_data(&frame).await
            } else {
                Ok(())
            };

            if let Err(e) = result {
                debug!("reply frame on {:x} dropped: {e}", frame.id);
            }
        }
    }

    async fn handle_reply_start(&self, frame: &Frame) -> Result<(), Error> {
        let msg = SessionStart::from_frame(frame)?;

        let mut table = self.sessions.write().await;
        let pending = table.get_mut(&msg.session).ok_or(Error::UnknownSession)?;

        // Forged or wrong-epoch start frames never touch the session.
        msg.open(&self.cipher).await?;

        pending.remaining = msg.length.0 as usize;
        if pending.remaining == 0 {
            complete(pending);
        }
        Ok(())
    }

    async fn handle_reply_data(&self, frame: &Frame) -> Result<(), Error> {
        let msg = SessionData::from_frame(frame)?;

        let mut table = self.sessions.write().await;
        let pending = table.get_mut(&msg.session).ok_or(Error::UnknownSession)?;

        if msg.seq != pending.seq {
            return Err(Error::Sequence {
                got: msg.seq.0,
                expected: pending.seq.0,
            });
        }

        let plaintext = msg.open(&self.cipher).await?;
        if plaintext.len() > pending.remaining {
            return Err(Error::Budget {
                got: plaintext.len(),
                remaining: pending.remaining,
            });
        }

        pending.buffer.extend_from_slice(&plaintext);
        pending.seq.advance();
        pending.remaining -= plaintext.len();
        if pending.remaining == 0 {
            complete(pending);
        }
        Ok(())
    }
}

fn complete(pending: &mut Pending) {
    if let Some(done) = pending.done.take() {
        let _ = done.send(mem::take(&mut pending.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An RngCore handing out a scripted list of ids.
    struct ScriptedRng {
        values: Vec<u32>,
        drawn: usize,
    }

    impl ScriptedRng {
        fn new(values: &[u32]) -> Self {
            Self {
                values: values.to_vec(),
                drawn: 0,
            }
        }
    }

    impl RngCore for ScriptedRng {
        fn next_u32(&mut self) -> u32 {
            let value = self.values[self.drawn % self.values.len()];
            self.drawn += 1;
            value
        }

        fn next_u64(&mut self) -> u64 {
            u64::from(self.next_u32())
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest {
                *byte = 0;
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for ScriptedRng {}

    fn test_client() -> Client {
        // None of these tests reach the bus, so the receive end can go.
        let (send_queue, _) = mpsc::channel(1);
        Client::new(
            SharedCipher::new(),
            send_queue,
            ChannelIds {
                start: 1,
                data: 2,
                reply_start: 3,
                reply_data: 4,
            },
        )
    }

    #[tokio::test]
    async fn colliding_session_ids_are_redrawn() {
        let client = test_client();

        let mut rng = ScriptedRng::new(&[0x1111]);
        let (first, _reply) = client.open_session(&mut rng).await;
        assert_eq!(first, SessionId(0x1111));
        assert_eq!(rng.drawn, 1);

        // The same value twice, then a fresh one: the second draw collides
        // and the loop retries until a free slot comes up.
        let mut rng = ScriptedRng::new(&[0x1111, 0x1111, 0x2222]);
        let (second, _reply) = client.open_session(&mut rng).await;
        assert_eq!(second, SessionId(0x2222));
        assert_eq!(rng.drawn, 3);
    }

    #[tokio::test]
    async fn send_without_a_key_fails_fast() {
        let client = test_client();
        match client.send(b"payload").await {
            Err(Error::Cipher(CipherError::NoKey)) => {}
            other => panic!("expected NoKey, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_payloads_are_rejected() {
        let client = test_client();
        client.cipher.update(&[1u8; 32]).await.unwrap();

        let payload = vec![0u8; MAX_MESSAGE];
        match client.send(&payload).await {
            Err(Error::PayloadTooLarge { .. }) => {}
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }
}

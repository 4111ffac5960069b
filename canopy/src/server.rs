//! The Canopy server: reassembles inbound sessions and answers them.
//!
//! Each session id gets its own task and bounded inbox. The task waits for
//! an authenticating start frame, collects data frames in sequence, checks
//! the whole-message tag, and hands the request to the application's reply
//! builder. A reaper drops sessions that stop hearing frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codec::Decode;
use log::{debug, trace, warn};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, timeout, Instant};

use crate::bus::Frame;
use crate::cipher::SharedCipher;
use crate::error::{BusError, Error};
use crate::proto::{
    ChannelIds, CipherData, ExtraData, MessageLength, SequenceNumber, SessionData, SessionId,
    SessionStart, MAX_MESSAGE,
};

/// How long a session task waits for its next frame.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(6);

/// Idle threshold past which the reaper removes a session.
pub const SESSION_IDLE: Duration = Duration::from_secs(2);

const INBOX_CAPACITY: usize = 20;
const INBOX_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-session reassembly state, also visible to the application hooks.
pub struct SessionState {
    /// The cipher this session decrypts and replies with. Installed by the
    /// session initializer before the start frame's authentication check.
    pub cipher: SharedCipher,
    /// Plaintext context from the start frame, mirrored into the reply.
    pub start_data: ExtraData,
    remaining: usize,
    buffer: Vec<u8>,
    seq: SequenceNumber,
}

impl SessionState {
    fn new(remaining: usize, start_data: ExtraData) -> Self {
        Self {
            cipher: SharedCipher::new(),
            start_data,
            remaining,
            buffer: Vec::new(),
            seq: SequenceNumber::default(),
        }
    }
}

/// Builds the application's answer to one completed inbound session.
#[async_trait]
pub trait ReplyBuilder: Send + Sync + 'static {
    async fn build_reply(
        &self,
        session: SessionId,
        request: &[u8],
        state: &mut SessionState,
    ) -> Vec<u8>;
}

/// Prepares a session before the start frame's decryption attempt. The
/// default installs the shared group cipher; custom implementations may
/// install a per-id key fetched over a side channel.
#[async_trait]
pub trait SessionInitializer: Send + Sync + 'static {
    async fn initialize_session(&self, session: SessionId, state: &mut SessionState);
}

struct GlobalCipherInitializer {
    cipher: SharedCipher,
}

#[async_trait]
impl SessionInitializer for GlobalCipherInitializer {
    async fn initialize_session(&self, _session: SessionId, state: &mut SessionState) {
        state.cipher = self.cipher.clone();
    }
}

struct SessionHandle {
    inbox: mpsc::Sender<Frame>,
    last_update_ms: AtomicU64,
}

impl SessionHandle {
    fn touch(&self, epoch: Instant) {
        self.last_update_ms
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle(&self, epoch: Instant) -> Duration {
        let now = epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_update_ms.load(Ordering::Relaxed)))
    }
}

struct Inner {
    send_queue: mpsc::Sender<Frame>,
    ids: ChannelIds,
    sessions: RwLock<FxHashMap<SessionId, SessionHandle>>,
    initializer: Box<dyn SessionInitializer>,
    builder: Box<dyn ReplyBuilder>,
    epoch: Instant,
}

/// A Canopy server over one channel.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// A server answering with `builder`, decrypting every session with the
    /// shared group cipher.
    pub fn new(
        cipher: SharedCipher,
        send_queue: mpsc::Sender<Frame>,
        ids: ChannelIds,
        builder: Box<dyn ReplyBuilder>,
    ) -> Self {
        Self::with_initializer(
            send_queue,
            ids,
            builder,
            Box::new(GlobalCipherInitializer { cipher }),
        )
    }

    pub fn with_initializer(
        send_queue: mpsc::Sender<Frame>,
        ids: ChannelIds,
        builder: Box<dyn ReplyBuilder>,
        initializer: Box<dyn SessionInitializer>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                send_queue,
                ids,
                sessions: RwLock::new(FxHashMap::default()),
                initializer,
                builder,
                epoch: Instant::now(),
            }),
        }
    }

    pub fn recv_ids(&self) -> [u32; 2] {
        self.inner.ids.request_ids()
    }

    /// Route frames into per-session tasks until the inbox closes.
    pub async fn run(self, mut inbox: mpsc::Receiver<Frame>) {
        let reaper = tokio::spawn({
            let server = self.clone();
            async move { server.reap_loop().await }
        });

        while let Some(frame) = inbox.recv().await {
            self.route(frame).await;
        }

        reaper.abort();
    }

    async fn reap_loop(self) {
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            self.remove_stale_sessions().await;
        }
    }

    async fn remove_stale_sessions(&self) {
        let mut reaped = Vec::new();
        {
            let mut table = self.inner.sessions.write().await;
            let stale: Vec<SessionId> = table
                .iter()
                .filter(|(_, handle)| handle.idle(self.inner.epoch) > SESSION_IDLE)
                .map(|(session, _)| *session)
                .collect();
            for session in stale {
                if let Some(handle) = table.remove(&session) {
                    reaped.push((session, handle));
                }
            }
        }

        // Dropping the handles outside the table lock closes the inboxes
        // and lets the session tasks wind down.
        for (session, _handle) in reaped {
            trace!("[{session}] reaped idle session");
        }
    }

    async fn route(&self, frame: Frame) {
        if frame.id != self.inner.ids.start && frame.id != self.inner.ids.data {
            return;
        }

        // Only the session id is needed for routing; the session task does
        // the full parse and drops malformed frames there.
        let Ok(session) = SessionId::decode(&mut frame.data.as_slice()) else {
            debug!("frame on {:x} too short for a session id", frame.id);
            return;
        };

        let inbox = self.session_inbox(session).await;
        if inbox
            .send_timeout(frame, INBOX_SEND_TIMEOUT)
            .await
            .is_err()
        {
            trace!("[{session}] inbox unavailable, frame dropped");
        }
    }

    /// Look up the session's inbox, lazily creating the session and its
    /// task on the first matching frame.
    async fn session_inbox(&self, session: SessionId) -> mpsc::Sender<Frame> {
        let mut table = self.inner.sessions.write().await;
        if let Some(handle) = table.get(&session) {
            handle.touch(self.inner.epoch);
            return handle.inbox.clone();
        }

        let (inbox, frames) = mpsc::channel(INBOX_CAPACITY);
        let handle = SessionHandle {
            inbox: inbox.clone(),
            last_update_ms: AtomicU64::new(0),
        };
        handle.touch(self.inner.epoch);
        table.insert(session, handle);

        tokio::spawn({
            let server = self.clone();
            async move { server.process_session(session, frames).await }
        });

        inbox
    }

    async fn process_session(self, session: SessionId, mut frames: mpsc::Receiver<Frame>) {
        let Some(mut state) = self.await_session_start(session, &mut frames).await else {
            return;
        };

        if !self.collect_session_data(session, &mut state, &mut frames).await {
            return;
        }

        // The reassembled buffer ends in the whole-message tag: an
        // empty-plaintext seal over everything before it. Anything the
        // per-frame checks let through dies here.
        if state.buffer.len() < CipherData::WIRE_OVERHEAD {
            debug!("[{session}] assembled message too small");
            return;
        }
        let boundary = state.buffer.len() - CipherData::WIRE_OVERHEAD;
        let (request, tag) = state.buffer.split_at(boundary);
        let Ok(tag) = CipherData::from_bytes(tag) else {
            debug!("[{session}] malformed whole-message tag");
            return;
        };
        if tag.open(&state.cipher, request).await.is_err() {
            warn!("[{session}] invalid tag for assembled message");
            return;
        }

        let request = request.to_vec();
        let reply = self
            .inner
            .builder
            .build_reply(session, &request, &mut state)
            .await;

        if let Err(e) = self.send_reply(session, &state, &reply).await {
            warn!("[{session}] could not send reply: {e}");
        }
    }

    /// Wait for a start frame that parses and authenticates. Frames that
    /// fail either check are dropped and the wait continues.
    async fn await_session_start(
        &self,
        session: SessionId,
        frames: &mut mpsc::Receiver<Frame>,
    ) -> Option<SessionState> {
        loop {
            let frame = match timeout(SESSION_TIMEOUT, frames.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return None,
                Err(_) => {
                    trace!("[{session}] timed out waiting for session start");
                    return None;
                }
            };

            if frame.id != self.inner.ids.start {
                continue;
            }

            let msg = match SessionStart::from_frame(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("[{session}] start frame dropped: {e}");
                    continue;
                }
            };

            let mut state = SessionState::new(msg.length.0 as usize, msg.extra);
            self.inner
                .initializer
                .initialize_session(session, &mut state)
                .await;

            // The authentication gate. A failure usually means the frame
            // was forged or sealed under a key we do not hold.
            if msg.open(&state.cipher).await.is_err() {
                debug!("[{session}] session start did not authenticate");
                continue;
            }

            return Some(state);
        }
    }

    /// Collect data frames until the announced length is reached. Returns
    /// false when the session times out or its inbox closes.
    async fn collect_session_data(
        &self,
        session: SessionId,
        state: &mut SessionState,
        frames: &mut mpsc::Receiver<Frame>,
    ) -> bool {
        while state.remaining > 0 {
            let frame = match timeout(SESSION_TIMEOUT, frames.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return false,
                Err(_) => {
                    trace!("[{session}] timed out waiting for session data");
                    return false;
                }
            };

            if frame.id != self.inner.ids.data {
                continue;
            }

            let msg = match SessionData::from_frame(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("[{session}] data frame dropped: {e}");
                    continue;
                }
            };

            if msg.seq != state.seq {
                debug!(
                    "[{session}] sequence mismatch, got {}, expected {}",
                    msg.seq, state.seq
                );
                continue;
            }

            let Ok(plaintext) = msg.open(&state.cipher).await else {
                debug!("[{session}] data frame did not authenticate");
                continue;
            };

            if plaintext.len() > state.remaining {
                debug!(
                    "[{session}] payload bigger than expected, got {}, remaining {}",
                    plaintext.len(),
                    state.remaining
                );
                continue;
            }

            state.buffer.extend_from_slice(&plaintext);
            state.seq.advance();
            state.remaining -= plaintext.len();
        }
        true
    }

    /// Frame the reply symmetrically to the request: one start frame
    /// mirroring the inbound extra data, then the chunks.
    async fn send_reply(
        &self,
        session: SessionId,
        state: &SessionState,
        reply: &[u8],
    ) -> Result<(), Error> {
        if reply.len() > MAX_MESSAGE {
            return Err(Error::PayloadTooLarge {
                len: reply.len(),
                max: MAX_MESSAGE,
            });
        }

        let start = SessionStart::seal(
            &state.cipher,
            session,
            MessageLength(reply.len() as u16),
            state.start_data,
        )
        .await?;
        self.dispatch(start.into_frame(self.inner.ids.reply_start))
            .await?;

        for (index, chunk) in reply.chunks(SessionData::MAX_CHUNK).enumerate() {
            let seq = SequenceNumber((index % 256) as u8);
            let data = SessionData::seal(&state.cipher, session, seq, chunk).await?;
            self.dispatch(data.into_frame(self.inner.ids.reply_data))
                .await?;
        }

        Ok(())
    }

    async fn dispatch(&self, frame: Frame) -> Result<(), Error> {
        self.inner
            .send_queue
            .send(frame)
            .await
            .map_err(|_| BusError::Closed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ReplyBuilder for Echo {
        async fn build_reply(
            &self,
            _session: SessionId,
            request: &[u8],
            _state: &mut SessionState,
        ) -> Vec<u8> {
            request.to_vec()
        }
    }

    fn test_server() -> Server {
        let (send_queue, _) = mpsc::channel(10);
        Server::new(
            SharedCipher::new(),
            send_queue,
            ChannelIds {
                start: 1,
                data: 2,
                reply_start: 3,
                reply_data: 4,
            },
            Box::new(Echo),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_reaped() {
        let server = test_server();

        let _inbox = server.session_inbox(SessionId(9)).await;
        assert_eq!(server.inner.sessions.read().await.len(), 1);

        // Under the idle threshold the session stays.
        tokio::time::sleep(Duration::from_secs(1)).await;
        server.remove_stale_sessions().await;
        assert_eq!(server.inner.sessions.read().await.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        server.remove_stale_sessions().await;
        assert!(server.inner.sessions.read().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn frames_refresh_the_session_heartbeat() {
        let server = test_server();

        let _inbox = server.session_inbox(SessionId(7)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        // A routed frame touches the handle and resets the idle clock.
        server
            .route(Frame::new(1, codec::to_vec(&SessionId(7))))
            .await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        server.remove_stale_sessions().await;
        assert_eq!(server.inner.sessions.read().await.len(), 1);
    }
}

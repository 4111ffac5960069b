//! End-to-end exchanges between a Canopy client and server over the
//! virtual bus, with a monitor endpoint watching the wire.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use canopy::bus::{BusEndpoint, Dispatcher, Frame, VirtualBus, CANFD_MAX_PAYLOAD};
use canopy::cipher::{SharedCipher, KEY_SIZE};
use canopy::client::Client;
use canopy::proto::{
    ChannelIds, ExtraData, MessageLength, SequenceNumber, SessionData, SessionId, SessionStart,
};
use canopy::server::{ReplyBuilder, Server, SessionState, SESSION_TIMEOUT};

const IDS: ChannelIds = ChannelIds {
    start: 0x310,
    data: 0x311,
    reply_start: 0x320,
    reply_data: 0x321,
};

const KEY: [u8; KEY_SIZE] = [0x42; KEY_SIZE];

/// Answers every request with its bytes reversed.
struct ReverseBuilder {
    requests: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl ReplyBuilder for ReverseBuilder {
    async fn build_reply(
        &self,
        _session: SessionId,
        request: &[u8],
        _state: &mut SessionState,
    ) -> Vec<u8> {
        let _ = self.requests.send(request.to_vec()).await;
        let mut reply = request.to_vec();
        reply.reverse();
        reply
    }
}

struct Harness {
    client: Client,
    client_cipher: SharedCipher,
    server_cipher: SharedCipher,
    monitor: mpsc::Receiver<Frame>,
    requests: mpsc::Receiver<Vec<u8>>,
    /// Raw access to the client endpoint, for tests that craft frames by hand.
    raw_send: mpsc::Sender<Frame>,
    /// Keeps the monitor attached to the segment for the whole test.
    _monitor_endpoint: BusEndpoint,
}

async fn spawn_exchange() -> Harness {
    let bus = VirtualBus::new();
    let (requests_tx, requests) = mpsc::channel(8);

    // Server side.
    let server_cipher = SharedCipher::new();
    server_cipher.update(&KEY).await.unwrap();
    let mut server_endpoint = bus.endpoint().await.unwrap();
    server_endpoint
        .set_filters(IDS.request_filters())
        .await
        .unwrap();
    let server = Server::new(
        server_cipher.clone(),
        server_endpoint.send_queue(),
        IDS,
        Box::new(ReverseBuilder {
            requests: requests_tx,
        }),
    );
    let mut dispatcher = Dispatcher::new();
    let server_inbox = dispatcher.subscribe(&server.recv_ids());
    tokio::spawn(dispatcher.run(server_endpoint.take_recv_queue().unwrap()));
    tokio::spawn(server.run(server_inbox));

    // Client side.
    let client_cipher = SharedCipher::new();
    client_cipher.update(&KEY).await.unwrap();
    let mut client_endpoint = bus.endpoint().await.unwrap();
    client_endpoint
        .set_filters(IDS.reply_filters())
        .await
        .unwrap();
    let raw_send = client_endpoint.send_queue();
    let client = Client::new(client_cipher.clone(), client_endpoint.send_queue(), IDS);
    let mut dispatcher = Dispatcher::new();
    let client_inbox = dispatcher.subscribe(&client.recv_ids());
    tokio::spawn(dispatcher.run(client_endpoint.take_recv_queue().unwrap()));
    tokio::spawn(client.clone().run(client_inbox));

    // Monitor hears everything.
    let mut monitor_endpoint = bus.endpoint().await.unwrap();
    let monitor = monitor_endpoint.take_recv_queue().unwrap();

    Harness {
        client,
        client_cipher,
        server_cipher,
        monitor,
        requests,
        raw_send,
        _monitor_endpoint: monitor_endpoint,
    }
}

fn drain(monitor: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = monitor.try_recv() {
        frames.push(frame);
    }
    frames
}

#[tokio::test(start_paused = true)]
async fn single_frame_payload_round_trip() {
    let mut harness = spawn_exchange().await;

    let reply = harness.client.send(&[0x01, 0x02, 0x03]).await.unwrap();
    assert_eq!(reply, vec![0x03, 0x02, 0x01]);

    let frames = drain(&mut harness.monitor);
    let count = |id| frames.iter().filter(|f| f.id == id).count();
    assert_eq!(count(IDS.start), 1);
    assert_eq!(count(IDS.data), 1);
    assert_eq!(count(IDS.reply_start), 1);
    assert_eq!(count(IDS.reply_data), 1);

    assert_eq!(harness.requests.recv().await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn multi_frame_payload_fragments_in_order() {
    let mut harness = spawn_exchange().await;

    let payload: Vec<u8> = (0..512).map(|_| rand::random()).collect();
    let reply = harness.client.send(&payload).await.unwrap();

    let mut expected = payload.clone();
    expected.reverse();
    assert_eq!(reply, expected);
    assert_eq!(harness.requests.recv().await.unwrap(), payload);

    // 512 payload bytes plus the 28-byte whole-message tag, in 31-byte
    // chunks: 18 data frames, sequence numbers counting up from zero.
    let frames = drain(&mut harness.monitor);
    let data_frames: Vec<&Frame> = frames.iter().filter(|f| f.id == IDS.data).collect();
    assert_eq!(data_frames.len(), 18);

    for (index, frame) in data_frames.iter().enumerate() {
        assert!(frame.data.len() <= CANFD_MAX_PAYLOAD);
        let msg = SessionData::from_frame(frame).unwrap();
        assert_eq!(msg.seq, SequenceNumber(index as u8));
    }
}

#[tokio::test(start_paused = true)]
async fn empty_reply_completes_the_session() {
    struct Silent;

    #[async_trait]
    impl ReplyBuilder for Silent {
        async fn build_reply(
            &self,
            _session: SessionId,
            _request: &[u8],
            _state: &mut SessionState,
        ) -> Vec<u8> {
            Vec::new()
        }
    }

    let bus = VirtualBus::new();
    let cipher = SharedCipher::new();
    cipher.update(&KEY).await.unwrap();

    let mut server_endpoint = bus.endpoint().await.unwrap();
    let server = Server::new(cipher.clone(), server_endpoint.send_queue(), IDS, Box::new(Silent));
    let mut dispatcher = Dispatcher::new();
    let server_inbox = dispatcher.subscribe(&server.recv_ids());
    tokio::spawn(dispatcher.run(server_endpoint.take_recv_queue().unwrap()));
    tokio::spawn(server.run(server_inbox));

    let mut client_endpoint = bus.endpoint().await.unwrap();
    let client = Client::new(cipher.clone(), client_endpoint.send_queue(), IDS);
    let mut dispatcher = Dispatcher::new();
    let client_inbox = dispatcher.subscribe(&client.recv_ids());
    tokio::spawn(dispatcher.run(client_endpoint.take_recv_queue().unwrap()));
    tokio::spawn(client.clone().run(client_inbox));

    let reply = client.send(b"anyone listening?").await.unwrap();
    assert!(reply.is_empty());
}

#[tokio::test(start_paused = true)]
async fn wrong_key_data_is_discarded_and_no_reply_is_sent() {
    let mut harness = spawn_exchange().await;

    // A key differing from the server's in a single bit.
    let mut flipped = KEY;
    flipped[0] ^= 0x01;
    let wrong_cipher = SharedCipher::new();
    wrong_cipher.update(&flipped).await.unwrap();

    let session = SessionId(0x5151_5151);
    let start = SessionStart::seal(
        &harness.client_cipher,
        session,
        MessageLength(3),
        ExtraData::default(),
    )
    .await
    .unwrap();
    harness
        .raw_send
        .send(start.into_frame(IDS.start))
        .await
        .unwrap();

    let data = SessionData::seal(&wrong_cipher, session, SequenceNumber(0), b"abc")
        .await
        .unwrap();
    harness
        .raw_send
        .send(data.into_frame(IDS.data))
        .await
        .unwrap();

    // The data frame fails authentication, the session starves to its
    // timeout, and nothing comes back.
    let waited = timeout(SESSION_TIMEOUT + Duration::from_secs(2), async {
        loop {
            match harness.monitor.recv().await {
                Some(frame) if frame.id == IDS.reply_start || frame.id == IDS.reply_data => {
                    break frame;
                }
                Some(_) => continue,
                None => panic!("monitor closed"),
            }
        }
    })
    .await;
    assert!(waited.is_err(), "server must not reply to a forged session");
}

#[tokio::test(start_paused = true)]
async fn key_rotation_mid_session_still_reassembles() {
    let mut harness = spawn_exchange().await;

    let first_key = KEY;
    let second_key = [0x77u8; KEY_SIZE];

    // Craft the message by hand with a sender-side container seeded like
    // the client's.
    let sender = SharedCipher::new();
    sender.update(&first_key).await.unwrap();

    let payload: Vec<u8> = (0..200u16).map(|v| v as u8).collect();
    let tag = {
        use canopy::proto::CipherData;
        CipherData::seal(&sender, &[], &payload).await.unwrap()
    };
    let mut message = payload.clone();
    message.extend_from_slice(&codec::to_vec(&tag));

    let session = SessionId(0x0D0D_0D0D);
    let start = SessionStart::seal(
        &sender,
        session,
        MessageLength(message.len() as u16),
        ExtraData::default(),
    )
    .await
    .unwrap();
    harness
        .raw_send
        .send(start.into_frame(IDS.start))
        .await
        .unwrap();

    let chunks: Vec<&[u8]> = message.chunks(SessionData::MAX_CHUNK).collect();
    let half = chunks.len() / 2;

    for (index, chunk) in chunks[..half].iter().enumerate() {
        let data = SessionData::seal(&sender, session, SequenceNumber(index as u8), chunk)
            .await
            .unwrap();
        harness
            .raw_send
            .send(data.into_frame(IDS.data))
            .await
            .unwrap();
    }

    // Rekey: the server learns the new key (its container keeps the old
    // one in the fallback slot), the sender rotates too.
    harness.server_cipher.update(&second_key).await.unwrap();
    sender.update(&second_key).await.unwrap();

    for (offset, chunk) in chunks[half..].iter().enumerate() {
        let index = half + offset;
        let data = SessionData::seal(&sender, session, SequenceNumber(index as u8), chunk)
            .await
            .unwrap();
        harness
            .raw_send
            .send(data.into_frame(IDS.data))
            .await
            .unwrap();
    }

    // The server reassembled the exact payload despite the epoch change.
    let request = timeout(Duration::from_secs(5), harness.requests.recv())
        .await
        .expect("server never completed the session")
        .unwrap();
    assert_eq!(request, payload);
}

#[tokio::test(start_paused = true)]
async fn missing_tail_times_out_without_reply() {
    let mut harness = spawn_exchange().await;

    // Announce more bytes than we deliver: the session must never reach
    // the builder.
    let session = SessionId(0x3333_2222);
    let start = SessionStart::seal(
        &harness.client_cipher,
        session,
        MessageLength(500),
        ExtraData::default(),
    )
    .await
    .unwrap();
    harness
        .raw_send
        .send(start.into_frame(IDS.start))
        .await
        .unwrap();

    let data = SessionData::seal(&harness.client_cipher, session, SequenceNumber(0), b"partial")
        .await
        .unwrap();
    harness
        .raw_send
        .send(data.into_frame(IDS.data))
        .await
        .unwrap();

    tokio::time::sleep(SESSION_TIMEOUT + Duration::from_secs(2)).await;
    assert!(harness.requests.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn client_times_out_without_a_server() {
    let bus = VirtualBus::new();
    let cipher = SharedCipher::new();
    cipher.update(&KEY).await.unwrap();

    let mut endpoint = bus.endpoint().await.unwrap();
    let client = Client::new(cipher, endpoint.send_queue(), IDS);
    let mut dispatcher = Dispatcher::new();
    let inbox = dispatcher.subscribe(&client.recv_ids());
    tokio::spawn(dispatcher.run(endpoint.take_recv_queue().unwrap()));
    tokio::spawn(client.clone().run(inbox));

    match client.send(b"hello?").await {
        Err(canopy::Error::Timeout) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
}

//! A complete in-process deployment: a keyserver and a peer attached to a
//! virtual bus segment. The peer fetches the group key over the exchange,
//! requests a ticket over Canopy, and verifies it.
//!
//! ```text
//! RUST_LOG=debug cargo run --example loopback -- --payload "hello canopy"
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use log::info;
use tokio::time::{sleep, timeout};

use canopy::bus::{Dispatcher, VirtualBus};
use canopy::cipher::SharedCipher;
use canopy::client::Client;
use canopy::kex::{self, ClientIds, Keypair, ServerIds};
use canopy::proto::ChannelIds;
use canopy::server::Server;
use canopy::ticket::{TicketIssuer, TicketVerifier};

const TICKET_IDS: ChannelIds = ChannelIds {
    start: 0x210,
    data: 0x211,
    reply_start: 0x220,
    reply_data: 0x221,
};

#[derive(Parser, Debug)]
#[command(version)]
struct Config {
    /// Directory holding (or receiving) the keyserver's long-term keys
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seconds between group key rotations
    #[arg(long, default_value_t = 75)]
    rekey_interval: u64,

    /// Extra payload to echo through the ticket channel before the ticket
    /// request itself
    #[arg(long)]
    payload: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::parse();
    info!("config: {config:?}");

    let bus = VirtualBus::new();

    // ── Keyserver side ──
    let server_cipher = SharedCipher::new();
    let keys = Arc::new(match &config.data_dir {
        Some(dir) => Keypair::load_or_generate(dir).context("loading long-term keys")?,
        None => Keypair::generate(),
    });

    let server_ids = ServerIds {
        pubkey_broadcast: 0x100,
        share_symmetric: 0x101,
        rekey_notify: 0x102,
        request: 0x103,
        symmetric_req: vec![(0x110, "loopback peer key exchange".into())],
        rekey_req: vec![(0x111, "loopback peer rekey".into())],
    };

    let mut keyserver_endpoint = bus.endpoint().await?;
    let mut filters = server_ids.filters();
    filters.extend(TICKET_IDS.request_filters());
    keyserver_endpoint.set_filters(filters).await?;

    let exchange = kex::Server::new(
        server_cipher.clone(),
        keyserver_endpoint.send_queue(),
        server_ids,
        keys.clone(),
        Duration::from_secs(config.rekey_interval),
    )
    .await?;

    let tickets = Server::new(
        server_cipher.clone(),
        keyserver_endpoint.send_queue(),
        TICKET_IDS,
        Box::new(TicketIssuer::new(keys.clone())),
    );

    let mut dispatcher = Dispatcher::new();
    let exchange_inbox = dispatcher.subscribe(&exchange.recv_ids());
    let ticket_inbox = dispatcher.subscribe(&tickets.recv_ids());
    tokio::spawn(dispatcher.run(
        keyserver_endpoint
            .take_recv_queue()
            .context("keyserver receive queue")?,
    ));
    tokio::spawn(exchange.run(exchange_inbox));
    tokio::spawn(tickets.run(ticket_inbox));

    // ── Peer side ──
    let peer_cipher = SharedCipher::new();
    let client_ids = ClientIds {
        recv_pubkey: 0x100,
        recv_symmetric: 0x101,
        recv_rekey: 0x102,
        request: 0x110,
    };

    let mut peer_endpoint = bus.endpoint().await?;
    let mut filters = client_ids.filters();
    filters.extend(TICKET_IDS.reply_filters());
    peer_endpoint.set_filters(filters).await?;

    let (exchange_client, handle) =
        kex::Client::new(peer_cipher.clone(), peer_endpoint.send_queue(), client_ids);
    let public_key = exchange_client.public_key();
    let canopy_client = Client::new(peer_cipher.clone(), peer_endpoint.send_queue(), TICKET_IDS);

    let mut dispatcher = Dispatcher::new();
    let exchange_inbox = dispatcher.subscribe(&client_ids.recv_ids());
    let canopy_inbox = dispatcher.subscribe(&canopy_client.recv_ids());
    tokio::spawn(dispatcher.run(
        peer_endpoint
            .take_recv_queue()
            .context("peer receive queue")?,
    ));
    tokio::spawn(exchange_client.run(exchange_inbox));
    tokio::spawn(canopy_client.clone().run(canopy_inbox));

    // ── Wait for the exchange to key the peer ──
    timeout(Duration::from_secs(10), async {
        while !peer_cipher.ok().await {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .context("peer never obtained the group key")?;
    info!("peer keyed");

    if let Some(payload) = &config.payload {
        // The issuer rejects anything that is not a 32-byte public key,
        // which makes it a handy smoke test for arbitrary payloads.
        let reply = canopy_client.send(payload.as_bytes()).await?;
        info!("payload reply: {}", String::from_utf8_lossy(&reply));
    }

    // ── Fetch and verify a ticket ──
    let sealed = canopy_client.send(&public_key).await?;
    if sealed.starts_with(b"Err:") {
        bail!("issuer refused: {}", String::from_utf8_lossy(&sealed));
    }

    let wrap = handle
        .wrap_key()
        .await
        .context("wrap key vanished after keying")?;
    let envelope = kex::open_with_key(&wrap, &sealed)?;

    let verifier = TicketVerifier::new();
    let ticket_key = handle
        .ticket_verifying_key()
        .await
        .context("ticket key missing")?;
    verifier.set_public_key(ticket_key).await;

    verifier.verify(&envelope).await?;
    info!("ticket verified");

    match verifier.verify(&envelope).await {
        Err(e) => info!("second use refused, as it should be: {e}"),
        Ok(()) => bail!("a ticket must not verify twice"),
    }

    Ok(())
}

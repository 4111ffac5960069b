//! The frame bus abstraction.
//!
//! A bus endpoint is a pair of channels (send queue, receive queue) plus the
//! `(id, mask)` filter set the kernel would apply for a socketcan-backed
//! endpoint. The socketcan driver itself is a collaborator outside this
//! crate; what lives here is the carrier codec, the filter semantics, the
//! [`VirtualBus`] hub used by tests and in-process deployments, and the
//! [`Dispatcher`] that fans received frames out to components by message id.

use log::{debug, trace};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};

use crate::error::BusError;

pub const CANFD_MAX_PAYLOAD: usize = 64;
pub const CAN_MTU: usize = 16;
pub const CANFD_MTU: usize = 72;
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
pub const CAN_EXTENDED_MASK: u32 = 0x1FFF_FFFF;
pub const CAN_STANDARD_MASK: u32 = 0x0000_07FF;

/// Depth of an endpoint's send queue, matching the socket driver's buffering.
pub const QUEUE_DEPTH: usize = 10;

/// Depth of the per-endpoint delivery queue inside the virtual hub. Delivery
/// is best-effort: a burst beyond this is dropped, as a CAN controller would.
const DELIVERY_DEPTH: usize = 64;

/// One bus transmission unit: a 29-bit extended identifier and up to 64
/// payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Marshal into the 72-byte Linux CAN-FD carrier: little-endian id word
    /// (EFF flag set for ids beyond the standard range), DLC byte, payload
    /// from offset 8.
    pub fn marshal(&self) -> Result<[u8; CANFD_MTU], BusError> {
        if self.data.len() > CANFD_MAX_PAYLOAD {
            return Err(BusError::Oversize(self.data.len()));
        }

        let mut raw = [0u8; CANFD_MTU];
        let mut id = self.id;
        if id > CAN_STANDARD_MASK {
            id |= CAN_EFF_FLAG;
        }
        raw[..4].copy_from_slice(&id.to_le_bytes());
        raw[4] = self.data.len() as u8;
        raw[8..8 + self.data.len()].copy_from_slice(&self.data);
        Ok(raw)
    }

    /// Unmarshal a classic (16-byte) or CAN-FD (72-byte) carrier.
    pub fn unmarshal(raw: &[u8]) -> Result<Self, BusError> {
        if raw.len() != CAN_MTU && raw.len() != CANFD_MTU {
            return Err(BusError::Malformed("unexpected carrier size"));
        }

        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&raw[..4]);
        let raw_id = u32::from_le_bytes(id_bytes);

        let dlc = raw[4] as usize;
        if raw.len() < 8 + dlc {
            return Err(BusError::Malformed("DLC exceeds carrier"));
        }

        let id = if raw_id & CAN_EFF_FLAG != 0 {
            raw_id & CAN_EXTENDED_MASK
        } else {
            raw_id & CAN_STANDARD_MASK
        };

        Ok(Self {
            id,
            data: raw[8..8 + dlc].to_vec(),
        })
    }
}

/// A kernel-style receive filter: a frame passes when
/// `frame.id & mask == id & mask`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Filter {
    pub id: u32,
    pub mask: u32,
}

impl Filter {
    pub const ALLOW_ALL: Filter = Filter { id: 0, mask: 0 };

    /// An exact-match filter for one extended id.
    pub fn exact(id: u32) -> Self {
        Self {
            id,
            mask: CAN_EXTENDED_MASK,
        }
    }

    pub fn matches(&self, id: u32) -> bool {
        id & self.mask == self.id & self.mask
    }
}

enum HubCommand {
    Attach {
        reply: oneshot::Sender<(usize, mpsc::Receiver<Frame>)>,
    },
    SetFilters {
        port: usize,
        filters: Vec<Filter>,
        done: oneshot::Sender<()>,
    },
    Detach {
        port: usize,
    },
    Broadcast {
        from: usize,
        frame: Frame,
    },
}

struct Port {
    sink: mpsc::Sender<Frame>,
    filters: Option<Vec<Filter>>,
}

impl Port {
    fn accepts(&self, id: u32) -> bool {
        match &self.filters {
            None => true,
            Some(filters) => filters.iter().any(|f| f.matches(id)),
        }
    }
}

/// An in-process broadcast hub standing in for a physical CAN segment.
///
/// Every attached endpoint hears every frame that passes its filters,
/// except its own transmissions.
#[derive(Clone)]
pub struct VirtualBus {
    commands: mpsc::Sender<HubCommand>,
}

impl VirtualBus {
    pub fn new() -> Self {
        let (commands, inbox) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(hub_loop(inbox));
        Self { commands }
    }

    /// Attach a new endpoint to the segment.
    pub async fn endpoint(&self) -> Result<BusEndpoint, BusError> {
        let (reply, port) = oneshot::channel();
        self.commands
            .send(HubCommand::Attach { reply })
            .await
            .map_err(|_| BusError::Closed)?;
        let (port, delivery) = port.await.map_err(|_| BusError::Closed)?;

        let (send, mut pending) = mpsc::channel(QUEUE_DEPTH);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            // The endpoint's sender loop, draining its send queue onto the
            // segment. Ends when the last send-queue handle is dropped.
            while let Some(frame) = pending.recv().await {
                if commands
                    .send(HubCommand::Broadcast { from: port, frame })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = commands.send(HubCommand::Detach { port }).await;
        });

        Ok(BusEndpoint {
            port,
            commands: self.commands.clone(),
            send,
            recv: Some(delivery),
        })
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn hub_loop(mut inbox: mpsc::Receiver<HubCommand>) {
    let mut ports: Vec<Option<Port>> = Vec::new();

    while let Some(command) = inbox.recv().await {
        match command {
            HubCommand::Attach { reply } => {
                let (sink, delivery) = mpsc::channel(DELIVERY_DEPTH);
                ports.push(Some(Port {
                    sink,
                    filters: None,
                }));
                let _ = reply.send((ports.len() - 1, delivery));
            }
            HubCommand::SetFilters {
                port,
                filters,
                done,
            } => {
                if let Some(Some(port)) = ports.get_mut(port) {
                    port.filters = Some(filters);
                }
                let _ = done.send(());
            }
            HubCommand::Detach { port } => {
                if let Some(slot) = ports.get_mut(port) {
                    *slot = None;
                }
            }
            HubCommand::Broadcast { from, frame } => {
                for (index, slot) in ports.iter().enumerate() {
                    if index == from {
                        continue;
                    }
                    let Some(port) = slot else { continue };
                    if !port.accepts(frame.id) {
                        continue;
                    }
                    if port.sink.try_send(frame.clone()).is_err() {
                        trace!("delivery queue of port {index} full, frame {:x} dropped", frame.id);
                    }
                }
            }
        }
    }
}

/// One attachment point on a bus.
pub struct BusEndpoint {
    port: usize,
    commands: mpsc::Sender<HubCommand>,
    send: mpsc::Sender<Frame>,
    recv: Option<mpsc::Receiver<Frame>>,
}

impl BusEndpoint {
    /// The queue outgoing frames are written to.
    pub fn send_queue(&self) -> mpsc::Sender<Frame> {
        self.send.clone()
    }

    /// Take the queue of received frames. Can be taken once; the caller is
    /// expected to hand it to a [`Dispatcher`] or drain it itself.
    pub fn take_recv_queue(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.recv.take()
    }

    /// Replace the endpoint's receive filters.
    pub async fn set_filters(&self, filters: Vec<Filter>) -> Result<(), BusError> {
        let (done, applied) = oneshot::channel();
        self.commands
            .send(HubCommand::SetFilters {
                port: self.port,
                filters,
                done,
            })
            .await
            .map_err(|_| BusError::Closed)?;
        applied.await.map_err(|_| BusError::Closed)
    }

    /// Detach from the segment.
    pub async fn shutdown(self) {
        let _ = self
            .commands
            .send(HubCommand::Detach { port: self.port })
            .await;
    }
}

/// Fans received frames out to component inboxes by message id.
///
/// This is the receive half of the bus contract: each component subscribes
/// with the exact id set it declared, and the dispatch loop forwards frames
/// accordingly. Frames with no subscriber are dropped.
pub struct Dispatcher {
    routes: FxHashMap<u32, mpsc::Sender<Frame>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            routes: FxHashMap::default(),
        }
    }

    /// Register an inbox for every id in `ids` and return its receive end.
    pub fn subscribe(&mut self, ids: &[u32]) -> mpsc::Receiver<Frame> {
        let (sink, inbox) = mpsc::channel(QUEUE_DEPTH);
        for id in ids {
            self.routes.insert(*id, sink.clone());
        }
        inbox
    }

    /// Consume `frames` until the queue closes, forwarding each frame to its
    /// subscriber.
    pub async fn run(self, mut frames: mpsc::Receiver<Frame>) {
        while let Some(frame) = frames.recv().await {
            let Some(sink) = self.routes.get(&frame.id) else {
                trace!("no subscriber for frame {:x}", frame.id);
                continue;
            };
            let id = frame.id;
            if sink.send(frame).await.is_err() {
                debug!("subscriber for frame {id:x} is gone");
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carrier_round_trip() {
        let frame = Frame::new(0x314, vec![1, 2, 3, 4, 5]);
        let raw = frame.marshal().unwrap();
        assert_eq!(raw.len(), CANFD_MTU);
        assert_eq!(raw[4], 5);
        assert_eq!(Frame::unmarshal(&raw).unwrap(), frame);
    }

    #[test]
    fn extended_ids_carry_the_eff_flag() {
        let frame = Frame::new(0x0010_0314, vec![0xAB]);
        let raw = frame.marshal().unwrap();
        let id_word = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        assert_ne!(id_word & CAN_EFF_FLAG, 0);
        assert_eq!(Frame::unmarshal(&raw).unwrap(), frame);
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let frame = Frame::new(1, vec![0; CANFD_MAX_PAYLOAD + 1]);
        assert_eq!(frame.marshal(), Err(BusError::Oversize(65)));
    }

    #[test]
    fn malformed_carriers_are_rejected() {
        assert!(Frame::unmarshal(&[0; 17]).is_err());

        let mut raw = Frame::new(1, vec![1, 2]).marshal().unwrap();
        raw[4] = 70; // DLC beyond the carrier
        assert!(Frame::unmarshal(&raw).is_err());
    }

    #[test]
    fn filter_matching() {
        assert!(Filter::ALLOW_ALL.matches(0x123));
        assert!(Filter::exact(0x314).matches(0x314));
        assert!(!Filter::exact(0x314).matches(0x315));

        let group = Filter {
            id: 0x100,
            mask: 0x1FC,
        };
        assert!(group.matches(0x100));
        assert!(group.matches(0x101));
        assert!(!group.matches(0x104));
    }

    #[tokio::test]
    async fn frames_reach_other_endpoints_but_not_the_sender() {
        let bus = VirtualBus::new();
        let mut alpha = bus.endpoint().await.unwrap();
        let mut beta = bus.endpoint().await.unwrap();

        let mut alpha_recv = alpha.take_recv_queue().unwrap();
        let mut beta_recv = beta.take_recv_queue().unwrap();

        alpha
            .send_queue()
            .send(Frame::new(0x42, vec![1]))
            .await
            .unwrap();

        assert_eq!(beta_recv.recv().await.unwrap(), Frame::new(0x42, vec![1]));
        assert!(alpha_recv.try_recv().is_err());
    }

    #[tokio::test]
    async fn filters_drop_unwanted_traffic() {
        let bus = VirtualBus::new();
        let alpha = bus.endpoint().await.unwrap();
        let mut beta = bus.endpoint().await.unwrap();

        beta.set_filters(vec![Filter::exact(0x10)]).await.unwrap();
        let mut beta_recv = beta.take_recv_queue().unwrap();

        alpha
            .send_queue()
            .send(Frame::new(0x99, vec![0]))
            .await
            .unwrap();
        alpha
            .send_queue()
            .send(Frame::new(0x10, vec![7]))
            .await
            .unwrap();

        // Only the matching frame arrives.
        assert_eq!(beta_recv.recv().await.unwrap(), Frame::new(0x10, vec![7]));
        assert!(beta_recv.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatcher_routes_by_id() {
        let (frames_tx, frames_rx) = mpsc::channel(QUEUE_DEPTH);
        let mut dispatcher = Dispatcher::new();
        let mut tens = dispatcher.subscribe(&[0x10, 0x11]);
        let mut twenties = dispatcher.subscribe(&[0x20]);
        tokio::spawn(dispatcher.run(frames_rx));

        frames_tx.send(Frame::new(0x20, vec![2])).await.unwrap();
        frames_tx.send(Frame::new(0x30, vec![3])).await.unwrap();
        frames_tx.send(Frame::new(0x11, vec![1])).await.unwrap();

        assert_eq!(tens.recv().await.unwrap(), Frame::new(0x11, vec![1]));
        assert_eq!(twenties.recv().await.unwrap(), Frame::new(0x20, vec![2]));
    }
}

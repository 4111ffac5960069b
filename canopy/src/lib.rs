//! Canopy: a secure request/reply transport over a frame-oriented
//! broadcast bus (CAN-FD), together with the key exchange that feeds it and
//! a single-use ticket subsystem built on top.
//!
//! # Module layout
//! - [`bus`]: frames, filters, the in-process virtual bus and the per-id
//!   dispatcher
//! - [`cipher`]: the two-slot ChaCha20-Poly1305 container shared between
//!   components
//! - [`kex`]: group-key distribution and rotation (server and peer roles),
//!   long-term key storage
//! - [`proto`]: wire fields and the session message layouts
//! - [`client`]: submit a message, await the reply
//! - [`server`]: per-session reassembly tasks and application hooks
//! - [`ticket`]: signed single-use capabilities
//!
//! The physical socketcan driver is deliberately not here: anything that
//! can produce and consume [`bus::Frame`] queues can carry this transport.

pub mod bus;
pub mod cipher;
pub mod client;
pub mod error;
pub mod kex;
pub mod proto;
pub mod server;
pub mod ticket;

pub use error::Error;

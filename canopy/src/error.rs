//! Typed errors for the transport core.
//!
//! Single-frame faults (format, sequence, budget, per-frame authentication)
//! never tear a session down; they are logged and the frame is dropped. The
//! variants here exist so the drop sites can say precisely what happened and
//! so decisive faults can be surfaced to callers.

use std::convert::Infallible;

use thiserror::Error;

/// Faults of the AEAD cipher container.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("symmetric key must be 32 bytes")]
    InvalidKey,

    #[error("no symmetric key installed")]
    NoKey,

    #[error("encryption failed")]
    Encrypt,

    #[error("authentication tag mismatch")]
    Decrypt,

    #[error("key derivation failed")]
    Derive,
}

/// Faults of the frame bus.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus closed")]
    Closed,

    #[error("frame payload of {0} bytes exceeds the CAN-FD maximum")]
    Oversize(usize),

    #[error("malformed CAN carrier: {0}")]
    Malformed(&'static str),
}

/// Faults reported by ticket verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TicketError {
    #[error("ticket public key missing, try later")]
    MissingKey,

    #[error("could not parse ticket")]
    Malformed,

    #[error("ticket has already expired")]
    Expired,

    #[error("ticket has already been used")]
    AlreadyUsed,

    #[error("ticket signature invalid")]
    BadSignature,
}

/// The transport error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("frame not in expected format for its message id")]
    Format,

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("sequence number mismatch, got {got}, expected {expected}")]
    Sequence { got: u8, expected: u8 },

    #[error("payload bigger than expected, got {got}, remaining {remaining}")]
    Budget { got: usize, remaining: usize },

    #[error("timed out waiting for reply from peer")]
    Timeout,

    #[error("message of {len} bytes exceeds the {max} byte session ceiling")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("no session with the given id")]
    UnknownSession,

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Ticket(#[from] TicketError),
}

impl From<codec::decode::DecodeError> for Error {
    fn from(_: codec::decode::DecodeError) -> Self {
        Error::Format
    }
}

impl From<Infallible> for Error {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

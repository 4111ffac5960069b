//! Session message layouts.
//!
//! Two messages exist per direction: a start frame announcing the message
//! length and carrying plaintext context, and data frames carrying the
//! encrypted chunks. Flow information (session id, length, sequence number,
//! extra data) stays in plaintext but is bound into the AEAD tag as
//! associated data, so a forged or replayed header fails authentication.

pub mod fields;

use codec::{Decode, Encode};

use crate::bus::{Filter, Frame, CANFD_MAX_PAYLOAD};
use crate::cipher::SharedCipher;
use crate::error::{CipherError, Error};

pub use fields::{CipherData, ExtraData, MessageLength, SequenceNumber, SessionId};

/// The largest message one session can carry: the one-byte sequence number
/// must never wrap, so a session is capped at 255 chunks (~7.9 kB).
pub const MAX_MESSAGE: usize = u8::MAX as usize * SessionData::MAX_CHUNK;

/// The four message ids of one Canopy channel. Ids are convention between
/// the two peers and always supplied as configuration.
#[derive(Clone, Copy, Debug)]
pub struct ChannelIds {
    pub start: u32,
    pub data: u32,
    pub reply_start: u32,
    pub reply_data: u32,
}

impl ChannelIds {
    /// Ids a server on this channel consumes.
    pub fn request_ids(&self) -> [u32; 2] {
        [self.start, self.data]
    }

    /// Ids a client on this channel consumes.
    pub fn reply_ids(&self) -> [u32; 2] {
        [self.reply_start, self.reply_data]
    }

    pub fn request_filters(&self) -> Vec<Filter> {
        self.request_ids().iter().copied().map(Filter::exact).collect()
    }

    pub fn reply_filters(&self) -> Vec<Filter> {
        self.reply_ids().iter().copied().map(Filter::exact).collect()
    }
}

/// Opens a session: `session ‖ length ‖ extra ‖ cipher(empty)`, 64 bytes
/// exactly. The cipher data carries no plaintext; its tag authenticates the
/// three header fields.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SessionStart {
    pub session: SessionId,
    pub length: MessageLength,
    pub extra: ExtraData,
    cipher: CipherData,
}

impl SessionStart {
    pub async fn seal(
        cipher: &SharedCipher,
        session: SessionId,
        length: MessageLength,
        extra: ExtraData,
    ) -> Result<Self, CipherError> {
        let ad = start_associated_data(session, length, extra);
        Ok(Self {
            session,
            length,
            extra,
            cipher: CipherData::seal(cipher, &[], &ad).await?,
        })
    }

    /// The authentication gate: succeeds only for a peer holding the key.
    pub async fn open(&self, cipher: &SharedCipher) -> Result<(), CipherError> {
        let ad = start_associated_data(self.session, self.length, self.extra);
        self.cipher.open(cipher, &ad).await.map(|_| ())
    }

    pub fn into_frame(self, id: u32) -> Frame {
        Frame::new(id, codec::to_vec(&self))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, Error> {
        Ok(Self::decode(&mut frame.data.as_slice())?)
    }
}

/// Carries one encrypted chunk: `session ‖ seq ‖ cipher(chunk)`.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SessionData {
    pub session: SessionId,
    pub seq: SequenceNumber,
    cipher: CipherData,
}

impl SessionData {
    /// Header and tag bytes of every data frame.
    pub const FIXED_SIZE: usize =
        SessionId::WIRE_SIZE + SequenceNumber::WIRE_SIZE + CipherData::WIRE_OVERHEAD;

    /// Plaintext bytes one frame can carry.
    pub const MAX_CHUNK: usize = CANFD_MAX_PAYLOAD - Self::FIXED_SIZE;

    pub async fn seal(
        cipher: &SharedCipher,
        session: SessionId,
        seq: SequenceNumber,
        chunk: &[u8],
    ) -> Result<Self, CipherError> {
        let ad = data_associated_data(session, seq);
        Ok(Self {
            session,
            seq,
            cipher: CipherData::seal(cipher, chunk, &ad).await?,
        })
    }

    pub async fn open(&self, cipher: &SharedCipher) -> Result<Vec<u8>, CipherError> {
        let ad = data_associated_data(self.session, self.seq);
        self.cipher.open(cipher, &ad).await
    }

    pub fn into_frame(self, id: u32) -> Frame {
        Frame::new(id, codec::to_vec(&self))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, Error> {
        Ok(Self::decode(&mut frame.data.as_slice())?)
    }
}

fn start_associated_data(session: SessionId, length: MessageLength, extra: ExtraData) -> Vec<u8> {
    let mut ad = codec::to_vec(&session);
    ad.extend_from_slice(&codec::to_vec(&length));
    ad.extend_from_slice(&codec::to_vec(&extra));
    ad
}

fn data_associated_data(session: SessionId, seq: SequenceNumber) -> Vec<u8> {
    let mut ad = codec::to_vec(&session);
    ad.extend_from_slice(&codec::to_vec(&seq));
    ad
}

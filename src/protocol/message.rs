//! Control messages: one datagram carries exactly one MessagePack map with
//! the keys `msg_type`, `seq`, `timestamp` and `payload`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::protocol::value::PropertyMap;
use crate::utils::clock::epoch_seconds;

/// Numeric tag on the wire: 1 = sample, 2 = actuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    Sample = 1,
    Actuation = 2,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(tag: u8) -> std::result::Result<Self, Self::Error> {
        match tag {
            1 => Ok(MessageKind::Sample),
            2 => Ok(MessageKind::Actuation),
            other => Err(format!("unknown message type {other}")),
        }
    }
}

/// Why a buffer did not yield a message.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Nothing to decode; the caller should stop processing this buffer.
    #[error("no message in buffer")]
    NoMessage,
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl From<rmp_serde::decode::Error> for ParseError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ParseError::Malformed(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    msg_type: MessageKind,
    seq: u64,
    timestamp: f64,
    payload: PropertyMap,
}

impl ControlMessage {
    /// Samples are only minted by a [`MessageFactory`](super::MessageFactory).
    pub(crate) fn sample(seq: u64, timestamp: f64, payload: PropertyMap) -> Self {
        Self {
            msg_type: MessageKind::Sample,
            seq,
            timestamp,
            payload,
        }
    }

    /// Builds the actuation answering this message. The reply carries the
    /// sample's sequence number so the plant can correlate it.
    pub fn reply_to(&self, payload: PropertyMap) -> ControlMessage {
        ControlMessage {
            msg_type: MessageKind::Actuation,
            seq: self.seq,
            timestamp: epoch_seconds(),
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.msg_type
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Seconds since the UNIX epoch at creation on the sending side.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn payload(&self) -> &PropertyMap {
        &self.payload
    }

    pub fn into_payload(self) -> PropertyMap {
        self.payload
    }

    /// Encodes as a MessagePack map with field names preserved.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn parse(bytes: &[u8]) -> std::result::Result<ControlMessage, ParseError> {
        if bytes.is_empty() {
            return Err(ParseError::NoMessage);
        }
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

//! Transport envelope encoding and decoding.
//!
//! Every message on a publication is one envelope:
//!
//! ```text
//! +-------------+-------------+------------------------+
//! | Sequence    | Kind        | Payload                |
//! | 2 bytes LE  | 2 bytes LE  | remaining bytes        |
//! +-------------+-------------+------------------------+
//! ```
//!
//! Handshake payloads:
//! - ESTABLISH_CONNECTION: `[len: u32 LE][response channel: UTF-8]`
//! - ESTABLISH_CONNECTION_RESPONSE: `[session id: i32 LE]`
//! - CONNECTION_DISCONNECT: empty

use bytes::{BufMut, BytesMut};

use crate::core::{
    CHANNEL_LENGTH_SIZE, EnvelopeError, HEADER_SIZE, KIND_CONNECTION_DISCONNECT,
    KIND_ESTABLISH_CONNECTION, KIND_ESTABLISH_CONNECTION_RESPONSE, KIND_FRAME, SESSION_ID_SIZE,
    SessionId,
};

/// Message kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    /// Client asks the server to open a connection back to it.
    EstablishConnection = KIND_ESTABLISH_CONNECTION,
    /// Server acknowledges an establish request.
    EstablishConnectionResponse = KIND_ESTABLISH_CONNECTION_RESPONSE,
    /// Peer is closing the connection.
    ConnectionDisconnect = KIND_CONNECTION_DISCONNECT,
    /// Opaque RPC frame.
    Frame = KIND_FRAME,
}

impl MessageKind {
    /// Parse a kind from its wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            KIND_ESTABLISH_CONNECTION => Some(Self::EstablishConnection),
            KIND_ESTABLISH_CONNECTION_RESPONSE => Some(Self::EstablishConnectionResponse),
            KIND_CONNECTION_DISCONNECT => Some(Self::ConnectionDisconnect),
            KIND_FRAME => Some(Self::Frame),
            _ => None,
        }
    }

    /// Wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// A decoded envelope borrowing its payload from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    /// Per-connection sequence number.
    pub sequence: u16,
    /// Message kind.
    pub kind: MessageKind,
    /// Payload bytes.
    pub payload: &'a [u8],
}

impl<'a> Envelope<'a> {
    /// Create an envelope over `payload`.
    pub fn new(kind: MessageKind, sequence: u16, payload: &'a [u8]) -> Self {
        Self {
            sequence,
            kind,
            payload,
        }
    }

    /// Encoded size.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize to a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        encode(self.kind, self.sequence, self.payload)
    }
}

/// Encode an envelope into a fresh buffer of `payload.len() + HEADER_SIZE` bytes.
pub fn encode(kind: MessageKind, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(&kind.as_u16().to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Append an encoded envelope to `buf`.
pub fn encode_into(buf: &mut BytesMut, kind: MessageKind, sequence: u16, payload: &[u8]) {
    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_u16_le(sequence);
    buf.put_u16_le(kind.as_u16());
    buf.put_slice(payload);
}

/// Decode an envelope without copying the payload.
pub fn decode(bytes: &[u8]) -> Result<Envelope<'_>, EnvelopeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(EnvelopeError::TooShort {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }

    let sequence = u16::from_le_bytes([bytes[0], bytes[1]]);
    let raw_kind = u16::from_le_bytes([bytes[2], bytes[3]]);
    let kind = MessageKind::from_u16(raw_kind).ok_or(EnvelopeError::UnknownKind(raw_kind))?;

    Ok(Envelope {
        sequence,
        kind,
        payload: &bytes[HEADER_SIZE..],
    })
}

/// ESTABLISH_CONNECTION payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishRequest {
    /// Channel the server must publish responses to.
    pub response_channel: String,
}

impl EstablishRequest {
    /// Create a request naming the requester's response channel.
    pub fn new(response_channel: impl Into<String>) -> Self {
        Self {
            response_channel: response_channel.into(),
        }
    }

    /// Serialize the payload.
    pub fn encode(&self) -> Vec<u8> {
        let channel = self.response_channel.as_bytes();
        let mut buf = Vec::with_capacity(CHANNEL_LENGTH_SIZE + channel.len());
        buf.extend_from_slice(&(channel.len() as u32).to_le_bytes());
        buf.extend_from_slice(channel);
        buf
    }

    /// Parse the payload.
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        if payload.len() < CHANNEL_LENGTH_SIZE {
            return Err(EnvelopeError::TooShort {
                expected: CHANNEL_LENGTH_SIZE,
                actual: payload.len(),
            });
        }

        let mut len_bytes = [0u8; CHANNEL_LENGTH_SIZE];
        len_bytes.copy_from_slice(&payload[..CHANNEL_LENGTH_SIZE]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        let rest = &payload[CHANNEL_LENGTH_SIZE..];
        if rest.len() < len {
            return Err(EnvelopeError::TooShort {
                expected: CHANNEL_LENGTH_SIZE + len,
                actual: payload.len(),
            });
        }

        let response_channel = std::str::from_utf8(&rest[..len])
            .map_err(|_| EnvelopeError::InvalidPayload("response channel is not UTF-8"))?;
        if response_channel.is_empty() {
            return Err(EnvelopeError::InvalidPayload("empty response channel"));
        }

        Ok(Self::new(response_channel))
    }
}

/// ESTABLISH_CONNECTION_RESPONSE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstablishResponse {
    /// Session of the requester's publication being acknowledged.
    pub session_id: SessionId,
}

impl EstablishResponse {
    /// Serialize the payload.
    pub fn encode(&self) -> [u8; SESSION_ID_SIZE] {
        self.session_id.to_le_bytes()
    }

    /// Parse the payload.
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        if payload.len() < SESSION_ID_SIZE {
            return Err(EnvelopeError::TooShort {
                expected: SESSION_ID_SIZE,
                actual: payload.len(),
            });
        }
        let mut bytes = [0u8; SESSION_ID_SIZE];
        bytes.copy_from_slice(&payload[..SESSION_ID_SIZE]);
        Ok(Self {
            session_id: SessionId::from_le_bytes(bytes),
        })
    }
}

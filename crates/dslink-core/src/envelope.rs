//! Binary envelope codec for uplink datagrams.
//!
//! Every datagram exchanged with the monitor is one envelope:
//!
//! ```text
//! +-------+---------+--------+-----------+-------+-------------+---------+--------+
//! | magic | version | opcode | token_len | token | payload_len | payload | crc32c |
//! | u8    | u8      | u8     | u8        | N     | u16 (BE)    | M JSON  | u32 BE |
//! +-------+---------+--------+-----------+-------+-------------+---------+--------+
//! ```
//!
//! The checksum covers every byte preceding it.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

/// Leading byte of every envelope.
pub const MAGIC: u8 = 0xD5;

/// Current envelope version.
pub const VERSION: u8 = 1;

/// Fixed bytes before the token: magic, version, opcode, token length.
const PREFIX_LEN: usize = 4;

/// Size of the payload length field.
const PAYLOAD_LEN_SIZE: usize = 2;

/// Size of the checksum trailer.
const CRC_LEN: usize = 4;

/// Smallest possible envelope (empty token, empty payload).
pub const MIN_ENVELOPE_LEN: usize = PREFIX_LEN + PAYLOAD_LEN_SIZE + CRC_LEN;

/// Longest session token that fits the length prefix.
pub const MAX_TOKEN_LEN: usize = u8::MAX as usize;

/// Largest payload that fits the length prefix.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Envelope opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Session control: connect requests, heartbeats, monitor replies.
    Status = 0x10,
    /// Remote job announcements and output.
    Job = 0x11,
    /// Relayed flight telemetry.
    Telemetry = 0xFD,
}

impl Opcode {
    /// Creates an opcode from its wire value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(Self::Status),
            0x11 => Some(Self::Job),
            0xFD => Some(Self::Telemetry),
            _ => None,
        }
    }

    /// Returns the wire value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Job => write!(f, "job"),
            Self::Telemetry => write!(f, "telemetry"),
        }
    }
}

/// Envelope codec errors.
///
/// Receivers treat every variant as a dropped packet.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("envelope too short: {0} bytes (minimum {MIN_ENVELOPE_LEN})")]
    TooShort(usize),
    #[error("invalid magic byte: 0x{0:02X}")]
    InvalidMagic(u8),
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),
    #[error("declared {field} length {declared} exceeds remaining {available} bytes")]
    LengthOverrun {
        field: &'static str,
        declared: usize,
        available: usize,
    },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("checksum mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("session token is not valid UTF-8")]
    InvalidToken,
    #[error("session token too long: {0} bytes (max {MAX_TOKEN_LEN})")]
    TokenTooLong(usize),
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_LEN})")]
    PayloadTooLarge(usize),
    #[error("payload JSON error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A decoded (or to-be-encoded) uplink envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub opcode: Opcode,
    pub session_token: String,
    pub payload: Value,
}

impl Envelope {
    /// Creates an envelope from an already structured payload.
    #[must_use]
    pub fn new(opcode: Opcode, session_token: impl Into<String>, payload: Value) -> Self {
        Self {
            opcode,
            session_token: session_token.into(),
            payload,
        }
    }

    /// Creates an envelope from any serializable payload.
    ///
    /// # Errors
    /// Returns error if the payload cannot be represented as JSON.
    pub fn from_payload<T: Serialize>(
        opcode: Opcode,
        session_token: impl Into<String>,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(opcode, session_token, serde_json::to_value(payload)?))
    }

    /// Interprets the payload as `T`.
    ///
    /// # Errors
    /// Returns error if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Whether the envelope carries a session token.
    #[must_use]
    pub fn has_token(&self) -> bool {
        !self.session_token.is_empty()
    }

    /// Encodes this envelope.
    ///
    /// # Errors
    /// See [`encode`].
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        encode(self.opcode, &self.session_token, &self.payload)
    }
}

/// Encodes one envelope into a datagram.
///
/// # Errors
/// Returns error if the token or serialized payload exceed their length prefix.
pub fn encode(opcode: Opcode, session_token: &str, payload: &Value) -> Result<Bytes, ProtocolError> {
    let token = session_token.as_bytes();
    let token_len =
        u8::try_from(token.len()).map_err(|_| ProtocolError::TokenTooLong(token.len()))?;

    let body = serde_json::to_vec(payload)?;
    let body_len =
        u16::try_from(body.len()).map_err(|_| ProtocolError::PayloadTooLarge(body.len()))?;

    let mut buf = BytesMut::with_capacity(MIN_ENVELOPE_LEN + token.len() + body.len());
    buf.put_u8(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(opcode.as_u8());
    buf.put_u8(token_len);
    buf.put_slice(token);
    buf.put_u16(body_len);
    buf.put_slice(&body);
    let crc = crc32c::crc32c(&buf);
    buf.put_u32(crc);

    Ok(buf.freeze())
}

/// Decodes one datagram into an envelope.
///
/// # Errors
/// Returns [`ProtocolError`] for any malformed input; never panics.
pub fn decode(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    if bytes.len() < MIN_ENVELOPE_LEN {
        return Err(ProtocolError::TooShort(bytes.len()));
    }
    if bytes[0] != MAGIC {
        return Err(ProtocolError::InvalidMagic(bytes[0]));
    }
    if bytes[1] != VERSION {
        return Err(ProtocolError::UnsupportedVersion(bytes[1]));
    }
    let opcode = Opcode::from_u8(bytes[2]).ok_or(ProtocolError::UnknownOpcode(bytes[2]))?;

    let body_end = bytes.len() - CRC_LEN;
    let mut cursor = PREFIX_LEN;

    let token_len = bytes[3] as usize;
    ensure_len(body_end, cursor, token_len, "token")?;
    let token = &bytes[cursor..cursor + token_len];
    cursor += token_len;

    ensure_len(body_end, cursor, PAYLOAD_LEN_SIZE, "payload length")?;
    let payload_len = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]) as usize;
    cursor += PAYLOAD_LEN_SIZE;

    ensure_len(body_end, cursor, payload_len, "payload")?;
    let payload = &bytes[cursor..cursor + payload_len];
    cursor += payload_len;

    if cursor != body_end {
        return Err(ProtocolError::TrailingBytes(body_end - cursor));
    }

    let expected = u32::from_be_bytes([
        bytes[body_end],
        bytes[body_end + 1],
        bytes[body_end + 2],
        bytes[body_end + 3],
    ]);
    let actual = crc32c::crc32c(&bytes[..body_end]);
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }

    let session_token = std::str::from_utf8(token)
        .map_err(|_| ProtocolError::InvalidToken)?
        .to_owned();
    let payload = serde_json::from_slice(payload)?;

    Ok(Envelope {
        opcode,
        session_token,
        payload,
    })
}

const fn ensure_len(
    end: usize,
    cursor: usize,
    declared: usize,
    field: &'static str,
) -> Result<(), ProtocolError> {
    let available = end.saturating_sub(cursor);
    if declared > available {
        return Err(ProtocolError::LengthOverrun {
            field,
            declared,
            available,
        });
    }
    Ok(())
}

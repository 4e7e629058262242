//! PDU framing.
//!
//! Every message on the tunnel wire is one framed PDU:
//!
//! ```text
//! byte 0        type identifier
//! bytes 1..9    payload length, u64 big-endian (excludes the header)
//! bytes 9..     payload (see [`crate::fields`])
//! ```
//!
//! The header is always 9 bytes. Decoding is incremental: callers
//! accumulate received bytes and call [`try_decode`] until it yields a
//! frame, consuming exactly the reported byte count and leaving any
//! following frame's bytes in place.

use bytes::Bytes;

use crate::fields::PayloadWriter;

/// Fixed wire header size: 1-byte type + 8-byte payload length.
pub const HEADER_LEN: usize = 9;

/// PDU type identifiers. The discriminants are the wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    /// Client credentials presented to the relay.
    Authenticate = 0x01,
    /// Relay verdict on an `Authenticate`.
    AuthResp = 0x02,
    /// Relay assigns the client a new instance id.
    AssignKey = 0x03,
    /// Heartbeat; carried in both directions with an empty payload.
    Enquire = 0x04,
    /// Proxied inbound request from the relay.
    Request = 0x05,
    /// Client reply to a `Request`.
    Response = 0x06,
}

impl PduType {
    /// Map a wire byte back to a known type.
    pub const fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Authenticate),
            0x02 => Some(Self::AuthResp),
            0x03 => Some(Self::AssignKey),
            0x04 => Some(Self::Enquire),
            0x05 => Some(Self::Request),
            0x06 => Some(Self::Response),
            _ => None,
        }
    }
}

/// One decoded protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub kind: PduType,
    pub payload: Bytes,
}

/// Outcome of [`try_decode`] on an accumulation buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete PDU; the caller must consume exactly `consumed` bytes.
    Pdu {
        pdu: Pdu,
        /// Header plus payload length.
        consumed: usize,
    },
    /// Not enough bytes buffered yet for a full frame; read more.
    Incomplete,
    /// A fully-buffered frame with an unrecognized type identifier.
    /// Consuming `skip` bytes discards the frame and resynchronizes the
    /// stream on the next one.
    Malformed { type_id: u8, skip: usize },
}

/// Serialize one PDU: fixed header followed by the payload bytes.
pub fn encode(kind: PduType, payload: &[u8]) -> Bytes {
    let mut w = PayloadWriter::new();
    w.add_value(&[kind as u8]);
    w.add_value(&(payload.len() as u64).to_be_bytes());
    w.add_value(payload);
    w.finish()
}

/// Attempt to decode one PDU from the front of `buf`.
///
/// Returns [`Decoded::Incomplete`] until the declared frame is fully
/// buffered; never an error for short input. Bytes after the frame are
/// left untouched for the next call.
pub fn try_decode(buf: &[u8]) -> Decoded {
    if buf.len() < HEADER_LEN {
        return Decoded::Incomplete;
    }

    let type_id = buf[0];
    let mut len_word = [0u8; 8];
    len_word.copy_from_slice(&buf[1..HEADER_LEN]);
    let declared = u64::from_be_bytes(len_word);

    let Ok(payload_len) = usize::try_from(declared) else {
        // A length that does not fit usize can never be satisfied; on
        // 64-bit targets this arm is unreachable.
        return Decoded::Incomplete;
    };
    let Some(frame_len) = HEADER_LEN.checked_add(payload_len) else {
        return Decoded::Incomplete;
    };
    if buf.len() < frame_len {
        return Decoded::Incomplete;
    }

    let Some(kind) = PduType::from_wire(type_id) else {
        return Decoded::Malformed {
            type_id,
            skip: frame_len,
        };
    };

    Decoded::Pdu {
        pdu: Pdu {
            kind,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..frame_len]),
        },
        consumed: frame_len,
    }
}

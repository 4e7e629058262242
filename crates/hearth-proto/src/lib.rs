//! Wire protocol for the Hearth relay tunnel.
//!
//! The relay speaks a small positional binary protocol: a stream of
//! framed PDUs ([`pdu`]), each carrying an ordered list of typed fields
//! ([`fields`]). There is no schema on the wire; the field sequence for
//! each PDU kind is a fixed contract between client and relay.

pub mod fields;
pub mod pdu;

pub use fields::{FieldError, PayloadReader, PayloadWriter};
pub use pdu::{Decoded, HEADER_LEN, Pdu, PduType, encode, try_decode};

/// Subsystem bit for proxied web requests. The only subsystem the
/// daemon currently serves; further bits are reserved by the relay.
pub const SUBSYSTEM_HTTP: u32 = 1;

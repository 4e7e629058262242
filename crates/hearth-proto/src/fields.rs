//! Positional payload field codec.
//!
//! A PDU payload is an ordered run of fields of two shapes:
//!
//! * **value**: raw bytes, fixed size, no prefix; the size is implied
//!   by the field's position in the PDU's contract. The common 4-byte
//!   integer flavor is a big-endian `u32`.
//! * **part**: variable size, preceded by a 4-byte big-endian length.
//!
//! Nothing on the wire says which shape comes next; the reader must be
//! driven in exactly the order the PDU kind defines. Reading past the
//! available bytes reports [`FieldError::Truncated`] and leaves the
//! cursor where it was.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Width of a part's length prefix and of integer values.
pub const INT_LEN: usize = 4;

/// Errors reported by [`PayloadReader`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    /// The payload ended before the expected field was fully present.
    #[error("payload truncated: needed {needed} more bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the field still required.
        needed: usize,
        /// Bytes left in the payload.
        remaining: usize,
    },
}

/// Builds a payload by appending fields in order.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes with no length prefix.
    pub fn add_value(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Append a 4-byte big-endian integer value.
    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Append a length-prefixed part.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is longer than `u32::MAX`, which no real
    /// payload approaches.
    #[allow(clippy::cast_possible_truncation)]
    pub fn add_part(&mut self, bytes: &[u8]) -> &mut Self {
        assert!(u32::try_from(bytes.len()).is_ok(), "part exceeds u32 length");
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
        self
    }

    /// Finish the payload and hand back its bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Cursor over one PDU payload, consuming fields in declared order.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub const fn new(payload: &'a [u8]) -> Self {
        Self {
            buf: payload,
            pos: 0,
        }
    }

    /// Bytes not yet consumed.
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FieldError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(FieldError::Truncated {
                needed: len - remaining,
                remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read a fixed-size value of `len` bytes.
    pub fn next_value(&mut self, len: usize) -> Result<&'a [u8], FieldError> {
        self.take(len)
    }

    /// Read a 4-byte big-endian integer value.
    pub fn next_u32(&mut self) -> Result<u32, FieldError> {
        let raw = self.take(INT_LEN)?;
        let mut word = [0u8; INT_LEN];
        word.copy_from_slice(raw);
        Ok(u32::from_be_bytes(word))
    }

    /// Read a length-prefixed part.
    pub fn next_part(&mut self) -> Result<&'a [u8], FieldError> {
        let start = self.pos;
        let len = self.next_u32()? as usize;
        match self.take(len) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                // A half-read part would desynchronize every later field.
                self.pos = start;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_reads_in_order() {
        let mut w = PayloadWriter::new();
        w.add_part(b"api-key");
        w.add_part(b"");
        w.add_u32(0xDEAD_BEEF);
        w.add_value(&[1, 2, 3]);
        let payload = w.finish();

        let mut r = PayloadReader::new(&payload);
        assert_eq!(r.next_part().unwrap(), b"api-key");
        assert_eq!(r.next_part().unwrap(), b"");
        assert_eq!(r.next_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.next_value(3).unwrap(), &[1, 2, 3]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn part_length_prefix_is_big_endian() {
        let mut w = PayloadWriter::new();
        w.add_part(b"ab");
        let payload = w.finish();
        assert_eq!(&payload[..], &[0, 0, 0, 2, b'a', b'b'][..]);
    }

    #[test]
    fn value_read_past_end_is_truncated() {
        let mut r = PayloadReader::new(&[1, 2]);
        let err = r.next_value(4).unwrap_err();
        assert_eq!(
            err,
            FieldError::Truncated {
                needed: 2,
                remaining: 2
            }
        );
        // cursor untouched, a correctly-sized read still works
        assert_eq!(r.next_value(2).unwrap(), &[1, 2]);
    }

    #[test]
    fn u32_on_empty_payload_is_truncated() {
        let mut r = PayloadReader::new(&[]);
        assert!(matches!(
            r.next_u32(),
            Err(FieldError::Truncated {
                needed: 4,
                remaining: 0
            })
        ));
    }

    #[test]
    fn part_with_short_body_is_truncated_and_rewinds() {
        // declares 8 bytes, carries 3
        let mut w = PayloadWriter::new();
        w.add_u32(8);
        w.add_value(b"abc");
        let payload = w.finish();

        let mut r = PayloadReader::new(&payload);
        assert!(matches!(
            r.next_part(),
            Err(FieldError::Truncated {
                needed: 5,
                remaining: 3
            })
        ));
        // the failed read must not have consumed the prefix
        assert_eq!(r.remaining(), payload.len());
    }

    #[test]
    fn reading_in_wrong_order_fails_without_oob() {
        // payload holds one part; reading it as a wide value overruns
        let mut w = PayloadWriter::new();
        w.add_part(b"xy");
        let payload = w.finish();

        let mut r = PayloadReader::new(&payload);
        assert!(r.next_value(16).is_err());
        // declared order still succeeds afterwards
        assert_eq!(r.next_part().unwrap(), b"xy");
    }
}

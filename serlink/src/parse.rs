//! Checksum-framed packet parsing for buffered interfaces.
//!
//! On the wire one packet is laid out as:
//!
//! ```text
//! [ destination:u8 | source:u8 | length:u8 | payload bytes | crc32:u32le ]
//! ```
//!
//! `length` counts payload bytes only; the CRC-32 covers the header and the
//! payload. Interface implementations find packet boundaries however their
//! medium allows (idle gaps, delimiters) and hand the candidate window here.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{addr::Address, circular::CircularIter, fragment::Fragment};

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 3;
/// Size of the checksum footer in bytes.
pub const FOOTER_SIZE: usize = 4;
/// Largest payload one packet can carry.
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Error raised while parsing a candidate packet window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The window size disagrees with the header's self-declared size.
    #[error("bad packet size - expected {expected} bytes, got {actual}")]
    BadSize {
        /// Total packet size implied by the header, or the framing minimum
        /// when the window is too short to hold a header at all.
        expected: usize,
        /// Size of the window that was handed in.
        actual: usize,
    },
    /// The checksum footer does not match the packet contents.
    #[error("bad checksum - computed {computed:#010x}, received {received:#010x}")]
    BadChecksum {
        /// Checksum computed over header and payload.
        computed: u32,
        /// Checksum carried in the footer.
        received: u32,
    },
}

/// Parses one packet from a contiguous window.
///
/// On success the returned [`Fragment`] owns a copy of the payload; the
/// window can be reused immediately.
///
/// # Errors
///
/// [`ParseError::BadSize`] if the window length disagrees with the header,
/// [`ParseError::BadChecksum`] if the footer does not match.
pub fn parse_packet(window: &[u8]) -> Result<Fragment, ParseError> {
    if window.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(ParseError::BadSize {
            expected: HEADER_SIZE + FOOTER_SIZE,
            actual: window.len(),
        });
    }
    let expected = HEADER_SIZE + usize::from(window[2]) + FOOTER_SIZE;
    if expected != window.len() {
        return Err(ParseError::BadSize {
            expected,
            actual: window.len(),
        });
    }

    let (body, footer) = window.split_at(window.len() - FOOTER_SIZE);
    let received = u32::from_le_bytes(footer.try_into().expect("footer is 4 bytes"));
    let computed = crc32fast::hash(body);
    if computed != received {
        return Err(ParseError::BadChecksum { computed, received });
    }

    Ok(Fragment::new(
        Address(body[1]),
        Address(body[0]),
        Bytes::copy_from_slice(&body[HEADER_SIZE..]),
    ))
}

/// Parses one packet of `len` bytes read through a receive-ring iterator.
///
/// The packet image is copied out of the ring first; the ring is never
/// aliased by the returned fragment. `len` is the total packet length the
/// interface's framing has established.
///
/// # Errors
///
/// Same as [`parse_packet`].
pub fn parse_packet_at(window: CircularIter<'_>, len: usize) -> Result<Fragment, ParseError> {
    let image: Vec<u8> = window.take(len).collect();
    parse_packet(&image)
}

/// Builds the on-wire image of a fragment.
///
/// # Panics
///
/// Panics if the payload is longer than [`MAX_PAYLOAD`].
#[must_use]
pub fn build_packet(fragment: &Fragment) -> Bytes {
    assert!(
        fragment.payload.len() <= MAX_PAYLOAD,
        "payload too long for one packet"
    );
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + fragment.payload.len() + FOOTER_SIZE);
    buf.put_u8(fragment.destination.0);
    buf.put_u8(fragment.source.0);
    #[allow(clippy::cast_possible_truncation)] // length checked above
    buf.put_u8(fragment.payload.len() as u8);
    buf.put_slice(&fragment.payload);
    buf.put_u32_le(crc32fast::hash(&buf));
    buf.freeze()
}

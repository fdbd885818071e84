//! # Strand Wire Format
//!
//! Fixed 9-byte header, optional 2-byte fragment sub-header, 4-byte trailer.
//! Everything is big-endian.
//!
//! ## Single packet
//!
//! ```text
//! +------+--------------+--------------+----------------+---------+---------+
//! | kind | sequence u16 | ack u16      | ack_bits u32   | payload | trailer |
//! +------+--------------+--------------+----------------+---------+---------+
//! ```
//!
//! ## Fragment packet
//!
//! ```text
//! +------+-----+-----+----------+---------+-------+------+---------+
//! | kind | seq | ack | ack_bits | frag_id | total | part | trailer |
//! +------+-----+-----+----------+---------+-------+------+---------+
//! ```
//!
//! The leading kind byte classifies the datagram; the receive path never
//! guesses from payload sizes. Every ack field piggybacks the receiver's
//! current `(latest_ack, ack_bits)` pair so that acknowledgements ride on
//! all outbound traffic. The trailer guards against truncated datagrams.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Fixed header size: 1 (kind) + 2 (sequence) + 2 (ack) + 4 (ack bits).
pub const HEADER_LEN: usize = 9;

/// Fragment sub-header size: 1 (fragment id) + 1 (total).
pub const FRAGMENT_HEADER_LEN: usize = 2;

/// Trailer terminating every datagram; protects against truncation.
pub const TRAILER: &[u8; 4] = b"STRD";

/// Number of bits carried by the ack bitfield.
pub const ACK_BITS: u16 = 32;

/// Smallest datagram the codec will accept.
pub const MIN_DATAGRAM_LEN: usize = HEADER_LEN + TRAILER.len();

// ─── Sequence Arithmetic ─────────────────────────────────────────────────────

/// Wrap-aware ordering over the 16-bit sequence circle: `a` is strictly
/// newer than `b` when it sits less than half the circle ahead.
#[inline]
pub fn sequence_newer_than(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Wrap-aware distance from `from` back to `to`.
#[inline]
pub fn sequence_distance(from: u16, to: u16) -> u16 {
    from.wrapping_sub(to)
}

// ─── Packet Kind ─────────────────────────────────────────────────────────────

/// Classification byte leading every datagram.
///
/// Values above `Fragment` are reserved for the connection layer's control
/// frames, which are stripped before datagrams reach this codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Complete payload in one datagram.
    Single = 0,
    /// One slice of an oversized payload.
    Fragment = 1,
}

impl PacketKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PacketKind::Single),
            1 => Some(PacketKind::Fragment),
            _ => None,
        }
    }
}

// ─── Packet Header ───────────────────────────────────────────────────────────

/// Decoded fixed header — present on every Strand datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Single or fragment.
    pub kind: PacketKind,
    /// Sequence number of this packet (shared by all fragments of one payload).
    pub sequence: u16,
    /// Most recently received sequence on the sending side.
    pub ack: u16,
    /// Bit `i` asserts receipt of `ack − i` (mod 65536); bit 0 is `ack` itself.
    pub ack_bits: u32,
}

impl PacketHeader {
    /// Encode the header into a buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.sequence);
        buf.put_u16(self.ack);
        buf.put_u32(self.ack_bits);
    }

    /// Decode a header from a buffer.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(Error::MalformedHeader {
                reason: "datagram shorter than fixed header",
            });
        }
        let kind = PacketKind::from_byte(buf.get_u8()).ok_or(Error::MalformedHeader {
            reason: "unknown packet kind",
        })?;
        Ok(PacketHeader {
            kind,
            sequence: buf.get_u16(),
            ack: buf.get_u16(),
            ack_bits: buf.get_u32(),
        })
    }
}

// ─── Fragment Sub-Header ─────────────────────────────────────────────────────

/// Sub-header carried by fragment datagrams, directly after the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Index of this part, `0..total`.
    pub fragment_id: u8,
    /// Number of parts the payload was split into.
    pub total: u8,
}

impl FragmentHeader {
    /// Encode the sub-header into a buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.fragment_id);
        buf.put_u8(self.total);
    }

    /// Decode the sub-header, validating `total ≥ 1` and `fragment_id < total`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < FRAGMENT_HEADER_LEN {
            return Err(Error::MalformedHeader {
                reason: "datagram shorter than fragment header",
            });
        }
        let fragment_id = buf.get_u8();
        let total = buf.get_u8();
        if total == 0 {
            return Err(Error::MalformedHeader {
                reason: "fragment total of zero",
            });
        }
        if fragment_id >= total {
            return Err(Error::MalformedHeader {
                reason: "fragment id beyond total",
            });
        }
        Ok(FragmentHeader { fragment_id, total })
    }
}

// ─── Datagram Codec ──────────────────────────────────────────────────────────

/// A decoded datagram: fixed header plus everything between it and the
/// trailer. For fragments the body still begins with the fragment sub-header.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// The fixed header.
    pub header: PacketHeader,
    /// Bytes between the fixed header and the trailer.
    pub body: Bytes,
}

/// Encode a complete single-payload datagram.
pub fn encode_single(sequence: u16, ack: u16, ack_bits: u32, payload: &[u8]) -> Bytes {
    let header = PacketHeader {
        kind: PacketKind::Single,
        sequence,
        ack,
        ack_bits,
    };
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len() + TRAILER.len());
    header.encode(&mut buf);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(TRAILER);
    buf.freeze()
}

/// Encode one fragment datagram.
pub fn encode_fragment(
    sequence: u16,
    ack: u16,
    ack_bits: u32,
    fragment_id: u8,
    total: u8,
    part: &[u8],
) -> Bytes {
    let header = PacketHeader {
        kind: PacketKind::Fragment,
        sequence,
        ack,
        ack_bits,
    };
    let sub = FragmentHeader { fragment_id, total };
    let mut buf =
        BytesMut::with_capacity(HEADER_LEN + FRAGMENT_HEADER_LEN + part.len() + TRAILER.len());
    header.encode(&mut buf);
    sub.encode(&mut buf);
    buf.extend_from_slice(part);
    buf.extend_from_slice(TRAILER);
    buf.freeze()
}

/// Decode a raw datagram: verify and strip the trailer, parse the fixed
/// header, and hand back the body.
pub fn decode(datagram: &[u8]) -> Result<Datagram> {
    if datagram.len() < MIN_DATAGRAM_LEN {
        return Err(Error::MalformedHeader {
            reason: "datagram shorter than header and trailer",
        });
    }
    let (framed, trailer) = datagram.split_at(datagram.len() - TRAILER.len());
    if trailer != TRAILER {
        return Err(Error::MalformedHeader {
            reason: "missing trailer",
        });
    }

    let mut buf = framed;
    let header = PacketHeader::decode(&mut buf)?;
    match header.kind {
        PacketKind::Single if buf.is_empty() => {
            return Err(Error::MalformedHeader {
                reason: "empty payload",
            });
        }
        PacketKind::Fragment if buf.len() <= FRAGMENT_HEADER_LEN => {
            return Err(Error::MalformedHeader {
                reason: "empty fragment",
            });
        }
        _ => {}
    }

    Ok(Datagram {
        header,
        body: Bytes::copy_from_slice(buf),
    })
}

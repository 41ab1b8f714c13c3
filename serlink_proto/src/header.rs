//! See [`FragmentHeader`].

use arbitrary::Arbitrary;
use bytes::{Buf, BufMut};

use crate::transfer::TransferId;

/// What a fragment carries.
///
/// The wire values are fixed by the shipped codec; peers must agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub enum FragmentKind {
    /// A piece of transfer data.
    Data,
    /// Confirmation that a whole transfer has been received.
    Ack,
    /// Request to retransmit one fragment of a transfer.
    Req,
}

impl FragmentKind {
    const fn to_wire(self) -> u8 {
        match self {
            Self::Data => 1,
            Self::Ack => 2,
            Self::Req => 3,
        }
    }

    const fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Data),
            2 => Some(Self::Ack),
            3 => Some(Self::Req),
            _ => None,
        }
    }
}

/// Fixed header prepended to every on-wire fragment.
///
/// ```text
/// [ kind:u8 | index:u8 | total:u8 | id:u16le | prev_id:u16le ]
/// ```
///
/// `index` is 1-based. For [`FragmentKind::Ack`] the index/total pair echoes
/// the acknowledged transfer's fragment count; for [`FragmentKind::Req`] the
/// index names the fragment whose retransmission is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub struct FragmentHeader {
    /// What the fragment carries.
    pub kind: FragmentKind,
    /// 1-based position of this fragment within its transfer.
    pub index: u8,
    /// How many fragments the transfer is split into.
    pub total: u8,
    /// Identifier of the transfer, chosen by its sender.
    pub id: TransferId,
    /// Identifier of the transfer this one responds to, passed through for
    /// higher layers.
    pub prev_id: TransferId,
}

impl FragmentHeader {
    /// Encoded size of the header in bytes.
    pub const SIZE: usize = 7;

    /// Writes the wire image of this header into `dst`.
    ///
    /// # Panics
    ///
    /// Panics if `dst` has less than [`FragmentHeader::SIZE`] bytes of
    /// capacity left.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.kind.to_wire());
        dst.put_u8(self.index);
        dst.put_u8(self.total);
        dst.put_u16_le(self.id.0);
        dst.put_u16_le(self.prev_id.0);
    }

    /// Reads a header from the front of `src`.
    ///
    /// Returns `None` when `src` holds fewer than [`FragmentHeader::SIZE`]
    /// bytes or the kind byte is not a known code.
    #[must_use]
    pub fn decode(src: &mut impl Buf) -> Option<Self> {
        if src.remaining() < Self::SIZE {
            return None;
        }
        let kind = FragmentKind::from_wire(src.get_u8())?;
        Some(Self {
            kind,
            index: src.get_u8(),
            total: src.get_u8(),
            id: TransferId(src.get_u16_le()),
            prev_id: TransferId(src.get_u16_le()),
        })
    }

    /// Whether the index fields are consistent: a positive total and an
    /// index inside `1..=total`.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.total > 0 && self.index >= 1 && self.index <= self.total
    }
}

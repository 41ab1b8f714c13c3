//! See [`Transfer`].

use std::time::Instant;

use arbitrary::Arbitrary;
use bytes::{Bytes, BytesMut};

use serlink::{Address, Fragment, InterfaceId};

use crate::header::FragmentHeader;

/// Identifier of a transfer, chosen by its sender and scoped to the peer
/// pair. Compared for equality only; ids are expected to wrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Arbitrary)]
pub struct TransferId(pub u16);

/// Everything about a transfer except its payload.
///
/// Handed to higher layers with acknowledgement events, and usable to build
/// a response transfer via [`Transfer::response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    /// Identifier of the transfer.
    pub id: TransferId,
    /// Identifier of the transfer this one responds to; conventionally zero
    /// when it responds to nothing. Passed through, never interpreted here.
    pub prev_id: TransferId,
    /// Peer the transfer came from, or [`Address::NULL`] for an outgoing
    /// transfer that has not been written out yet.
    pub source: Address,
    /// Peer the transfer is for.
    pub destination: Address,
    /// Interface the transfer belongs to, when known.
    pub interface: Option<InterfaceId>,
}

/// Error raised by [`Transfer::assign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AssignError {
    /// The 1-based index is zero or past the transfer's fragment count.
    #[error("fragment index {index} outside 1..={total}")]
    OutOfRange {
        /// The offending index.
        index: u8,
        /// The transfer's fragment count.
        total: u8,
    },
    /// The transfer holds a contiguous payload; only transfers under
    /// reassembly accept fragments.
    #[error("transfer is not in reassembly mode")]
    NotAssembling,
}

/// Storage behind a transfer: sparse slots while reassembling, one
/// contiguous payload when transmitting.
#[derive(Debug, Clone)]
enum TransferData {
    Assembling { slots: Vec<Option<Bytes>> },
    Contiguous { payload: Bytes, max_fragment_data: usize },
}

/// A logical payload spanning one or more fragments, identified by
/// `(peer, id)`.
///
/// A transfer is either *reassembling* (created from the first fragment that
/// arrives for an unknown id, filled slot by slot) or *contiguous* (created
/// locally for transmission, sliced into fragments on demand). The identity
/// fields never change after construction.
#[derive(Debug, Clone)]
pub struct Transfer {
    meta: TransferMetadata,
    data: TransferData,
    modified_at: Instant,
}

impl Transfer {
    /// Creates a contiguous transfer ready for transmission.
    ///
    /// `max_fragment_data` is the number of payload bytes one fragment may
    /// carry (the interface's data size minus the fragment header).
    ///
    /// # Panics
    ///
    /// Panics if `max_fragment_data` is zero.
    #[must_use]
    pub fn outgoing(
        destination: Address,
        id: TransferId,
        payload: Bytes,
        max_fragment_data: usize,
    ) -> Self {
        assert!(max_fragment_data > 0, "fragments must be able to carry data");
        Self {
            meta: TransferMetadata {
                id,
                prev_id: TransferId(0),
                source: Address::NULL,
                destination,
                interface: None,
            },
            data: TransferData::Contiguous {
                payload,
                max_fragment_data,
            },
            modified_at: Instant::now(),
        }
    }

    /// Creates a contiguous transfer that responds to a previously received
    /// one: addressed back to its source, with `prev_id` set to its id.
    ///
    /// # Panics
    ///
    /// Panics if `max_fragment_data` is zero.
    #[must_use]
    pub fn response(
        to: &TransferMetadata,
        id: TransferId,
        payload: Bytes,
        max_fragment_data: usize,
    ) -> Self {
        let mut transfer = Self::outgoing(to.source, id, payload, max_fragment_data);
        transfer.meta.prev_id = to.id;
        transfer.meta.interface = to.interface;
        transfer
    }

    /// Creates a reassembling transfer sized for `header.total` fragments,
    /// taking its identity from the first fragment that arrived.
    #[must_use]
    pub fn incoming(header: &FragmentHeader, first: &Fragment, now: Instant) -> Self {
        debug_assert!(header.is_valid());
        Self {
            meta: TransferMetadata {
                id: header.id,
                prev_id: header.prev_id,
                source: first.source,
                destination: first.destination,
                interface: first.interface,
            },
            data: TransferData::Assembling {
                slots: vec![None; usize::from(header.total)],
            },
            modified_at: now,
        }
    }

    /// Identifier of the transfer.
    #[must_use]
    pub const fn id(&self) -> TransferId {
        self.meta.id
    }

    /// Identifier of the transfer this one responds to.
    #[must_use]
    pub const fn prev_id(&self) -> TransferId {
        self.meta.prev_id
    }

    /// Peer the transfer came from.
    #[must_use]
    pub const fn source(&self) -> Address {
        self.meta.source
    }

    /// Peer the transfer is for.
    #[must_use]
    pub const fn destination(&self) -> Address {
        self.meta.destination
    }

    /// Interface the transfer belongs to, when known.
    #[must_use]
    pub const fn interface(&self) -> Option<InterfaceId> {
        self.meta.interface
    }

    /// A copy of the identity fields.
    #[must_use]
    pub fn metadata(&self) -> TransferMetadata {
        self.meta.clone()
    }

    /// When the transfer's contents last changed.
    #[must_use]
    pub const fn timestamp_modified(&self) -> Instant {
        self.modified_at
    }

    /// Number of payload bytes currently held.
    #[must_use]
    pub fn data_size(&self) -> usize {
        match &self.data {
            TransferData::Assembling { slots } => slots
                .iter()
                .flatten()
                .map(Bytes::len)
                .sum(),
            TransferData::Contiguous { payload, .. } => payload.len(),
        }
    }

    /// How many fragments this transfer spans.
    ///
    /// While reassembling this is the slot count announced by the sender;
    /// for a contiguous payload it is computed from the payload size. An
    /// empty payload still occupies one (empty) fragment so that the
    /// acknowledgement cycle has something to run on.
    #[must_use]
    pub fn fragments_count(&self) -> usize {
        match &self.data {
            TransferData::Assembling { slots } => slots.len(),
            TransferData::Contiguous {
                payload,
                max_fragment_data,
            } => payload.len().div_ceil(*max_fragment_data).max(1),
        }
    }

    /// Whether the transfer holds a contiguous payload (transmission mode)
    /// rather than fragment slots under reassembly.
    #[must_use]
    pub const fn is_contiguous(&self) -> bool {
        matches!(self.data, TransferData::Contiguous { .. })
    }

    /// Whether every fragment of the transfer is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match &self.data {
            TransferData::Assembling { slots } => slots.iter().all(Option::is_some),
            TransferData::Contiguous { .. } => true,
        }
    }

    /// 1-based index of the first empty slot, or `None` when the transfer is
    /// complete or contiguous.
    #[must_use]
    pub fn missing_fragment(&self) -> Option<u8> {
        match &self.data {
            TransferData::Assembling { slots } => slots
                .iter()
                .position(Option::is_none)
                .and_then(|i| u8::try_from(i + 1).ok()),
            TransferData::Contiguous { .. } => None,
        }
    }

    /// Stores one received fragment's payload into slot `index`.
    ///
    /// Assigning the same fragment twice is idempotent; the slot is simply
    /// overwritten. The modification timestamp advances on every accepted
    /// assignment.
    ///
    /// # Errors
    ///
    /// [`AssignError::OutOfRange`] when `index` is outside the slot range,
    /// [`AssignError::NotAssembling`] when the transfer holds a contiguous
    /// payload.
    pub fn assign(&mut self, index: u8, fragment: Fragment, now: Instant) -> Result<(), AssignError> {
        let TransferData::Assembling { slots } = &mut self.data else {
            return Err(AssignError::NotAssembling);
        };
        #[allow(clippy::cast_possible_truncation)] // slot count fits u8
        let total = slots.len() as u8;
        if index == 0 || index > total {
            return Err(AssignError::OutOfRange { index, total });
        }
        slots[usize::from(index) - 1] = Some(fragment.payload);
        self.modified_at = now;
        Ok(())
    }

    /// Materialises the payload slice of fragment `index` (1-based) of a
    /// contiguous transfer.
    ///
    /// The slice is cheap: it shares the transfer's payload allocation.
    ///
    /// # Panics
    ///
    /// Panics if the transfer is reassembling, if `index` is zero, or if
    /// `index` is past [`Transfer::fragments_count`]. Callers validate
    /// peer-supplied indices before calling.
    #[must_use]
    pub fn get_fragment(&self, index: u8) -> Bytes {
        let TransferData::Contiguous {
            payload,
            max_fragment_data,
        } = &self.data
        else {
            panic!("get_fragment on a transfer under reassembly");
        };
        assert!(index >= 1, "fragment index is 1-based");
        assert!(
            usize::from(index) <= self.fragments_count(),
            "fragment index past the end"
        );
        let start = (usize::from(index) - 1) * max_fragment_data;
        let end = (start + max_fragment_data).min(payload.len());
        payload.slice(start..end)
    }

    /// The reassembled (or to-be-transmitted) payload, fragments
    /// concatenated in index order.
    #[must_use]
    pub fn payload(&self) -> Bytes {
        match &self.data {
            TransferData::Assembling { slots } => {
                let mut buf = BytesMut::with_capacity(self.data_size());
                for slot in slots.iter().flatten() {
                    buf.extend_from_slice(slot);
                }
                buf.freeze()
            }
            TransferData::Contiguous { payload, .. } => payload.clone(),
        }
    }

    /// Whether `fragment` belongs to this transfer: same peer, and same
    /// interface when both sides know it.
    #[must_use]
    pub fn matches(&self, fragment: &Fragment) -> bool {
        self.meta.source == fragment.source
            && match (self.meta.interface, fragment.interface) {
                (Some(ours), Some(theirs)) => ours == theirs,
                _ => true,
            }
    }

    /// Whether `fragment` is a response (ACK/REQ) to this outgoing transfer:
    /// it must come from the peer the transfer was sent to.
    #[must_use]
    pub fn matches_as_response(&self, fragment: &Fragment) -> bool {
        self.meta.destination == fragment.source
    }
}

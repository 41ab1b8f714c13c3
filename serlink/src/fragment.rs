//! See [`Fragment`].

use bytes::Bytes;

use crate::addr::{Address, InterfaceId};

/// One link-level unit of data in flight.
///
/// Interfaces construct fragments when a complete packet has been received
/// and parsed; upper layers construct them when they have something to
/// transmit. The payload is opaque at this level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Address of the peer that sent this fragment, or [`Address::NULL`] for
    /// a locally-originated fragment that has not been written out yet.
    pub source: Address,
    /// Address of the peer this fragment is for.
    pub destination: Address,
    /// Payload bytes.
    pub payload: Bytes,
    /// Interface this fragment arrived on, when known.
    pub interface: Option<InterfaceId>,
}

impl Fragment {
    /// Creates a fragment with both endpoint addresses filled in.
    #[must_use]
    pub fn new(source: Address, destination: Address, payload: Bytes) -> Self {
        Self {
            source,
            destination,
            payload,
            interface: None,
        }
    }

    /// Creates an outbound fragment.
    ///
    /// The source is left as [`Address::NULL`]; the interface stamps its own
    /// address when the fragment is written out.
    #[must_use]
    pub fn addressed_to(destination: Address, payload: Bytes) -> Self {
        Self::new(Address::NULL, destination, payload)
    }

    /// Tags this fragment with the interface it belongs to.
    #[must_use]
    pub fn with_interface(mut self, interface: InterfaceId) -> Self {
        self.interface = Some(interface);
        self
    }
}

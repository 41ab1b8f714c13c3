//! The contract between link interface implementations and upper layers.

use crate::{
    addr::{Address, InterfaceId},
    event::Subject,
    fragment::Fragment,
};

/// Snapshot of an interface's transmit capacity.
///
/// Interfaces publish this through [`Interface::status_event`] whenever their
/// capacity changes. Upper layers treat `available_transmit_slots` as a gate:
/// zero means "defer, retry on the next periodic tick".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    /// How many more fragments the interface can accept for transmission
    /// right now.
    pub available_transmit_slots: usize,
}

/// One link interface of the local device (UART, RS-485, loopback, ...).
///
/// Implementations own their receive buffer and transmit queue; upper layers
/// interact with them only through this trait and the two event subjects.
/// Everything runs on one thread of control: events fire synchronously from
/// whatever call is driving the interface, and subscribers run to completion
/// before that call returns.
pub trait Interface {
    /// Identifier of this interface within the local device.
    fn identifier(&self) -> InterfaceId;

    /// The local address on this interface's bus.
    fn address(&self) -> Address;

    /// Largest payload one fragment written to this interface may carry.
    fn max_data_size(&self) -> usize;

    /// Hands a fragment to the interface for transmission.
    ///
    /// Never fails from the caller's point of view: when the transmit queue
    /// is saturated or the fragment is oversized the interface drops it and
    /// the loss is handled like any other on the lossy link.
    fn write_noexcept(&mut self, fragment: Fragment);

    /// Subject fired once per fully received link-level packet.
    fn receive_event(&self) -> Subject<Fragment>;

    /// Subject fired when transmit capacity changes.
    fn status_event(&self) -> Subject<Status>;
}

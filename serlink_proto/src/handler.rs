//! See [`FragmentationHandler`].

use std::{
    cell::RefCell,
    fmt, mem,
    rc::Rc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use serlink::{Address, Fragment, Interface, InterfaceId, Status, Subject};

use crate::{
    header::{FragmentHeader, FragmentKind},
    transfer::{Transfer, TransferId, TransferMetadata},
};

/// Configuration of a [`FragmentationHandler`], immutable for its lifetime.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Size of one on-wire fragment in bytes, header included. Usually the
    /// interface's [`max_data_size`](Interface::max_data_size).
    pub max_fragment_size: usize,
    /// Minimum idle interval before the handler re-emits a probe or a
    /// retransmit request.
    pub retransmit_time: Duration,
    /// Maximum idle interval after which an in-flight transfer is discarded.
    pub drop_time: Duration,
    /// Bounds periodic probing of an unacknowledged outgoing transfer to
    /// `fragments_count * retransmit_multiplier` retransmissions.
    pub retransmit_multiplier: u32,
    /// A delivered transfer's tombstone lingers for
    /// `drop_time * tombstone_multiplier` so a lost acknowledgement can be
    /// regenerated.
    pub tombstone_multiplier: u32,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: 64,
            retransmit_time: Duration::from_millis(300),
            drop_time: Duration::from_secs(3),
            retransmit_multiplier: 3,
            tombstone_multiplier: 5,
        }
    }
}

/// Error raised by [`FragmentationHandler::transmit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransmitError {
    /// The payload would span more fragments than a header can index.
    #[error("transfer needs {count} fragments, more than the {max} a header can index")]
    TransferTooBig {
        /// Fragments the payload would need.
        count: usize,
        /// Most fragments one transfer may span.
        max: usize,
    },
    /// The transfer is under reassembly; only contiguous transfers can be
    /// transmitted.
    #[error("transfer is under reassembly and cannot be transmitted")]
    ReassemblyMode,
}

/// A transfer's place in one of the handler's two lists, or the tombstone
/// left behind once an incoming transfer has been delivered.
#[derive(Debug)]
enum Slot {
    Live(Transfer),
    Tombstone,
}

/// One in-flight transfer plus its bookkeeping.
#[derive(Debug)]
struct TransferProgress {
    slot: Slot,
    last_access: Instant,
    retransmissions: u32,
    /// Shadow of the transfer's id, kept so tombstones stay matchable.
    id: TransferId,
    /// Shadow of the peer address, same reason.
    peer: Address,
}

impl TransferProgress {
    fn new(transfer: Transfer, peer: Address, now: Instant) -> Self {
        Self {
            id: transfer.id(),
            peer,
            slot: Slot::Live(transfer),
            last_access: now,
            retransmissions: 0,
        }
    }

    fn transfer(&self) -> Option<&Transfer> {
        match &self.slot {
            Slot::Live(transfer) => Some(transfer),
            Slot::Tombstone => None,
        }
    }

    fn retransmit_done(&mut self, now: Instant) {
        self.last_access = now;
        self.retransmissions += 1;
    }
}

/// What [`FragmentationHandler::main_task_at`] decided to do with one
/// incoming progress record.
enum IncomingAction {
    Evict,
    Deliver,
    Request(u8),
    Keep,
}

/// The fragmentation state machine of one interface.
///
/// Tracks in-flight transfers in both directions, reassembles incoming
/// fragments, acknowledges completed transfers, answers retransmit requests
/// and probes for lost acknowledgements. Drive it from exactly one thread of
/// control: feed received fragments into
/// [`receive_callback`](Self::receive_callback) (or let
/// [`bind_to`](Self::bind_to) do that) and call
/// [`main_task`](Self::main_task) at a coarse polling rate to advance
/// timeouts.
///
/// Every emission on [`transmit_event`](Self::transmit_event) is gated on the
/// interface's last reported transmit capacity; when the link is saturated
/// the handler defers and the next periodic tick retries. Reliability is
/// best-effort: when a peer stays silent past
/// [`drop_time`](HandlerConfig::drop_time) the transfer is forgotten without
/// any event.
pub struct FragmentationHandler {
    /// Fires when the handler wants a fragment written to the link.
    pub transmit_event: Subject<Fragment>,
    /// Fires exactly once per fully reassembled inbound transfer.
    pub transfer_receive_event: Subject<Transfer>,
    /// Fires when the destination acknowledges a transfer passed to
    /// [`transmit`](Self::transmit).
    pub transfer_ack_event: Subject<TransferMetadata>,
    interface: InterfaceId,
    config: HandlerConfig,
    max_fragment_data: usize,
    status: Status,
    incoming: Vec<TransferProgress>,
    outgoing: Vec<TransferProgress>,
}

impl FragmentationHandler {
    /// Creates a handler for the interface identified by `interface`.
    ///
    /// # Panics
    ///
    /// Panics if [`HandlerConfig::max_fragment_size`] does not leave room for
    /// payload after the fragment header.
    #[must_use]
    pub fn new(interface: InterfaceId, config: HandlerConfig) -> Self {
        assert!(
            config.max_fragment_size > FragmentHeader::SIZE,
            "fragments must have room for payload after the header"
        );
        let max_fragment_data = config.max_fragment_size - FragmentHeader::SIZE;
        Self {
            transmit_event: Subject::new(),
            transfer_receive_event: Subject::new(),
            transfer_ack_event: Subject::new(),
            interface,
            config,
            max_fragment_data,
            status: Status::default(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    /// Creates a handler sized for `interface`, taking the fragment size
    /// from the interface's [`max_data_size`](Interface::max_data_size).
    ///
    /// # Panics
    ///
    /// Panics if the interface's data size does not leave room for payload
    /// after the fragment header.
    #[must_use]
    pub fn for_interface<I: Interface>(interface: &I, mut config: HandlerConfig) -> Self {
        config.max_fragment_size = interface.max_data_size();
        Self::new(interface.identifier(), config)
    }

    /// Number of payload bytes one fragment of this handler carries.
    #[must_use]
    pub const fn max_fragment_data(&self) -> usize {
        self.max_fragment_data
    }

    /// Builds a contiguous transfer sized for this handler's fragments.
    #[must_use]
    pub fn new_transfer(
        &self,
        destination: Address,
        id: TransferId,
        payload: bytes::Bytes,
    ) -> Transfer {
        Transfer::outgoing(destination, id, payload, self.max_fragment_data)
    }

    /// Wires `interface` and `handler` together: received fragments and
    /// status updates flow into the handler, emitted fragments flow into the
    /// interface's transmit path.
    ///
    /// Both sides are held weakly; dropping either simply silences the
    /// wiring.
    pub fn bind_to<I>(handler: &Rc<RefCell<Self>>, interface: &Rc<RefCell<I>>)
    where
        I: Interface + 'static,
    {
        let receive = interface.borrow().receive_event();
        let status = interface.borrow().status_event();

        let weak = Rc::downgrade(handler);
        receive.subscribe(move |fragment| {
            if let Some(handler) = weak.upgrade() {
                handler.borrow_mut().receive_callback(fragment);
            }
        });

        let weak = Rc::downgrade(handler);
        status.subscribe(move |status| {
            if let Some(handler) = weak.upgrade() {
                handler.borrow_mut().interface_status_callback(status);
            }
        });

        let weak = Rc::downgrade(interface);
        handler.borrow().transmit_event.subscribe(move |fragment| {
            if let Some(interface) = weak.upgrade() {
                interface.borrow_mut().write_noexcept(fragment);
            }
        });
    }

    /// Starts transmitting `transfer`.
    ///
    /// Emits as many fragments as the link's transmit capacity allows right
    /// now and stores the transfer; anything unsent goes out through the
    /// retransmission path driven by [`main_task`](Self::main_task).
    ///
    /// # Errors
    ///
    /// See [`TransmitError`].
    pub fn transmit(&mut self, transfer: Transfer) -> Result<(), TransmitError> {
        self.transmit_at(transfer, Instant::now())
    }

    /// [`transmit`](Self::transmit) with an explicit clock reading.
    ///
    /// # Errors
    ///
    /// See [`TransmitError`].
    pub fn transmit_at(&mut self, transfer: Transfer, now: Instant) -> Result<(), TransmitError> {
        if !transfer.is_contiguous() {
            return Err(TransmitError::ReassemblyMode);
        }
        let count = transfer.fragments_count();
        if count > usize::from(u8::MAX) {
            return Err(TransmitError::TransferTooBig {
                count,
                max: usize::from(u8::MAX),
            });
        }

        debug!(
            id = transfer.id().0,
            fragments = count,
            "transmitting transfer"
        );
        for index in 1..=count {
            if !self.can_transmit() {
                debug!(
                    id = transfer.id().0,
                    next = index,
                    "transmit slots exhausted, deferring remainder"
                );
                break;
            }
            #[allow(clippy::cast_possible_truncation)] // count checked above
            let fragment = self.data_fragment(&transfer, index as u8);
            self.emit_fragment(fragment);
        }

        let peer = transfer.destination();
        self.outgoing.push(TransferProgress::new(transfer, peer, now));
        Ok(())
    }

    /// Feeds one received fragment into the state machine.
    ///
    /// Never fails: undersized payloads and invalid headers are dropped
    /// silently, as are fragments that match nothing the handler knows
    /// about.
    pub fn receive_callback(&mut self, fragment: Fragment) {
        self.receive_callback_at(fragment, Instant::now());
    }

    /// [`receive_callback`](Self::receive_callback) with an explicit clock
    /// reading.
    pub fn receive_callback_at(&mut self, mut fragment: Fragment, now: Instant) {
        if fragment.payload.len() < FragmentHeader::SIZE {
            trace!(len = fragment.payload.len(), "dropping undersized fragment");
            return;
        }
        let Some(header) = FragmentHeader::decode(&mut fragment.payload.clone()) else {
            trace!("dropping fragment with unknown kind");
            return;
        };
        if !header.is_valid() {
            trace!(
                index = header.index,
                total = header.total,
                "dropping fragment with inconsistent header"
            );
            return;
        }
        fragment.payload = fragment.payload.slice(FragmentHeader::SIZE..);
        self.handle_fragment(&header, fragment, now);
    }

    /// Records the interface's transmit capacity; emissions are gated on the
    /// most recent snapshot.
    pub fn interface_status_callback(&mut self, status: Status) {
        self.status = status;
    }

    /// Advances timeouts: delivers completed transfers, requests retransmits
    /// of missing fragments, probes unacknowledged outgoing transfers and
    /// evicts anything idle past its drop deadline.
    pub fn main_task(&mut self) {
        self.main_task_at(Instant::now());
    }

    /// [`main_task`](Self::main_task) with an explicit clock reading.
    pub fn main_task_at(&mut self, now: Instant) {
        self.sweep_incoming(now);
        self.sweep_outgoing(now);
    }

    fn sweep_incoming(&mut self, now: Instant) {
        let drop_time = self.config.drop_time;
        let retransmit_time = self.config.retransmit_time;
        let tombstone_lifetime = drop_time * self.config.tombstone_multiplier;

        let mut i = 0;
        while i < self.incoming.len() {
            let progress = &self.incoming[i];
            let idle = now.saturating_duration_since(progress.last_access);
            let action = match progress.transfer() {
                None => {
                    if idle > tombstone_lifetime {
                        trace!(id = progress.id.0, "evicting tombstone");
                        IncomingAction::Evict
                    } else {
                        IncomingAction::Keep
                    }
                }
                Some(transfer) => {
                    let stale = now.saturating_duration_since(transfer.timestamp_modified());
                    if transfer.is_complete() && self.can_transmit() {
                        IncomingAction::Deliver
                    } else if stale > drop_time {
                        warn!(id = progress.id.0, "dropping stalled incoming transfer");
                        IncomingAction::Evict
                    } else if self.can_transmit()
                        && stale > retransmit_time
                        && idle > retransmit_time
                    {
                        match transfer.missing_fragment() {
                            Some(index) => IncomingAction::Request(index),
                            None => IncomingAction::Keep,
                        }
                    } else {
                        IncomingAction::Keep
                    }
                }
            };

            match action {
                IncomingAction::Evict => {
                    self.incoming.remove(i);
                    continue;
                }
                IncomingAction::Deliver => self.deliver_incoming(i, now),
                IncomingAction::Request(index) => self.request_retransmit(i, index, now),
                IncomingAction::Keep => {}
            }
            i += 1;
        }
    }

    /// Acknowledges the completed transfer at `i`, hands it to the
    /// application and leaves a tombstone behind so a lost acknowledgement
    /// can be regenerated.
    fn deliver_incoming(&mut self, i: usize, now: Instant) {
        let transfer = {
            let progress = &mut self.incoming[i];
            progress.last_access = now;
            match mem::replace(&mut progress.slot, Slot::Tombstone) {
                Slot::Live(transfer) => transfer,
                Slot::Tombstone => unreachable!("deliver only runs on live transfers"),
            }
        };

        #[allow(clippy::cast_possible_truncation)] // announced total fits u8
        let count = transfer.fragments_count() as u8;
        let ack = self.control_fragment(
            transfer.source(),
            FragmentHeader {
                kind: FragmentKind::Ack,
                index: count,
                total: count,
                id: transfer.id(),
                prev_id: transfer.prev_id(),
            },
        );
        self.emit_fragment(ack);
        debug!(
            id = transfer.id().0,
            bytes = transfer.data_size(),
            "delivering reassembled transfer"
        );
        self.transfer_receive_event.emit(transfer);
    }

    fn request_retransmit(&mut self, i: usize, index: u8, now: Instant) {
        let (source, header) = {
            let transfer = self.incoming[i]
                .transfer()
                .expect("request only runs on live transfers");
            #[allow(clippy::cast_possible_truncation)] // announced total fits u8
            let total = transfer.fragments_count() as u8;
            (
                transfer.source(),
                FragmentHeader {
                    kind: FragmentKind::Req,
                    index,
                    total,
                    id: transfer.id(),
                    prev_id: transfer.prev_id(),
                },
            )
        };
        debug!(id = header.id.0, index, "requesting retransmit");
        let req = self.control_fragment(source, header);
        self.emit_fragment(req);
        self.incoming[i].retransmit_done(now);
    }

    fn sweep_outgoing(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.outgoing.len() {
            let progress = &self.outgoing[i];
            let idle = now.saturating_duration_since(progress.last_access);
            if idle > self.config.drop_time {
                warn!(
                    id = progress.id.0,
                    "dropping unacknowledged outgoing transfer"
                );
                self.outgoing.remove(i);
                continue;
            }

            let count = progress.transfer().map_or(0, Transfer::fragments_count);
            #[allow(clippy::cast_possible_truncation)] // count fits u8
            let retransmit_budget = count as u32 * self.config.retransmit_multiplier;
            if self.can_transmit()
                && progress.retransmissions < retransmit_budget
                && idle > self.config.retransmit_time
            {
                // the first fragment or our whole burst may have been lost;
                // probe with fragment 1 and let the peer name what it misses
                let probe = {
                    let transfer = self.outgoing[i]
                        .transfer()
                        .expect("outgoing records always hold a transfer");
                    self.data_fragment(transfer, 1)
                };
                debug!(id = self.outgoing[i].id.0, "probing with first fragment");
                self.emit_fragment(probe);
                self.outgoing[i].retransmit_done(now);
            }
            i += 1;
        }
    }

    fn handle_fragment(&mut self, header: &FragmentHeader, fragment: Fragment, now: Instant) {
        match header.kind {
            FragmentKind::Data => self.handle_data(header, fragment, now),
            FragmentKind::Req => self.handle_req(header, &fragment, now),
            FragmentKind::Ack => self.handle_ack(header, &fragment),
        }
    }

    fn handle_data(&mut self, header: &FragmentHeader, fragment: Fragment, now: Instant) {
        trace!(
            id = header.id.0,
            index = header.index,
            total = header.total,
            "data fragment"
        );
        let position = self.incoming.iter().position(|progress| {
            progress.id == header.id
                && match progress.transfer() {
                    Some(transfer) => transfer.matches(&fragment),
                    None => progress.peer == fragment.source,
                }
        });

        let Some(i) = position else {
            let mut transfer = Transfer::incoming(header, &fragment, now);
            transfer
                .assign(header.index, fragment, now)
                .expect("a valid header's index fits the slots it announced");
            let peer = transfer.source();
            self.incoming.push(TransferProgress::new(transfer, peer, now));
            return;
        };

        if let Slot::Live(transfer) = &mut self.incoming[i].slot {
            if let Err(err) = transfer.assign(header.index, fragment, now) {
                debug!(id = header.id.0, %err, "dropping fragment");
            }
        } else {
            // the peer retransmits a transfer we already delivered; our
            // acknowledgement must have been lost
            self.incoming[i].last_access = now;
            if self.can_transmit() {
                debug!(id = header.id.0, "re-acknowledging delivered transfer");
                let ack = self.control_fragment(
                    fragment.source,
                    FragmentHeader {
                        kind: FragmentKind::Ack,
                        ..*header
                    },
                );
                self.emit_fragment(ack);
            }
        }
    }

    fn handle_req(&mut self, header: &FragmentHeader, fragment: &Fragment, now: Instant) {
        let Some(i) = self.find_outgoing(header, fragment) else {
            trace!(id = header.id.0, "retransmit request matches no transfer");
            return;
        };
        if !self.can_transmit() {
            return;
        }
        let count = self.outgoing[i]
            .transfer()
            .map_or(0, Transfer::fragments_count);
        if usize::from(header.index) > count {
            debug!(
                id = header.id.0,
                index = header.index,
                "ignoring retransmit request past the transfer's end"
            );
            return;
        }

        debug!(
            id = header.id.0,
            index = header.index,
            "answering retransmit request"
        );
        let data = {
            let transfer = self.outgoing[i]
                .transfer()
                .expect("outgoing records always hold a transfer");
            self.data_fragment(transfer, header.index)
        };
        self.emit_fragment(data);
        self.outgoing[i].retransmit_done(now);
    }

    fn handle_ack(&mut self, header: &FragmentHeader, fragment: &Fragment) {
        let Some(i) = self.find_outgoing(header, fragment) else {
            trace!(id = header.id.0, "acknowledgement matches no transfer");
            return;
        };
        let progress = self.outgoing.remove(i);
        let Slot::Live(transfer) = progress.slot else {
            return;
        };
        debug!(id = header.id.0, "transfer acknowledged");
        self.transfer_ack_event.emit(transfer.metadata());
    }

    fn find_outgoing(&self, header: &FragmentHeader, fragment: &Fragment) -> Option<usize> {
        self.outgoing.iter().position(|progress| {
            progress.id == header.id
                && progress
                    .transfer()
                    .is_some_and(|transfer| transfer.matches_as_response(fragment))
        })
    }

    fn can_transmit(&self) -> bool {
        self.status.available_transmit_slots > 0
    }

    /// Emits one fragment and consumes a transmit slot from the local
    /// snapshot; the interface's next status event resynchronises it.
    fn emit_fragment(&mut self, fragment: Fragment) {
        self.status.available_transmit_slots -= 1;
        self.transmit_event.emit(fragment);
    }

    /// A header-only fragment (acknowledgement or retransmit request).
    fn control_fragment(&self, destination: Address, header: FragmentHeader) -> Fragment {
        let mut buf = BytesMut::with_capacity(FragmentHeader::SIZE);
        header.encode(&mut buf);
        Fragment::addressed_to(destination, buf.freeze()).with_interface(self.interface)
    }

    /// A data fragment carrying slice `index` of `transfer`'s payload.
    fn data_fragment(&self, transfer: &Transfer, index: u8) -> Fragment {
        let payload = transfer.get_fragment(index);
        #[allow(clippy::cast_possible_truncation)] // transmit checks the count
        let total = transfer.fragments_count() as u8;
        let header = FragmentHeader {
            kind: FragmentKind::Data,
            index,
            total,
            id: transfer.id(),
            prev_id: transfer.prev_id(),
        };
        let mut buf = BytesMut::with_capacity(FragmentHeader::SIZE + payload.len());
        header.encode(&mut buf);
        buf.extend_from_slice(&payload);
        Fragment::addressed_to(transfer.destination(), buf.freeze()).with_interface(self.interface)
    }
}

impl fmt::Debug for FragmentationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentationHandler")
            .field("interface", &self.interface)
            .field("incoming", &self.incoming.len())
            .field("outgoing", &self.outgoing.len())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    const PEER: Address = Address(9);
    const FRAG_SIZE: usize = FragmentHeader::SIZE + 8;

    fn config() -> HandlerConfig {
        HandlerConfig {
            max_fragment_size: FRAG_SIZE,
            retransmit_time: Duration::from_millis(100),
            drop_time: Duration::from_secs(1),
            retransmit_multiplier: 2,
            tombstone_multiplier: 5,
        }
    }

    fn handler_with_slots(slots: usize) -> FragmentationHandler {
        let mut handler = FragmentationHandler::new(InterfaceId(1), config());
        handler.interface_status_callback(Status {
            available_transmit_slots: slots,
        });
        handler
    }

    fn sent(handler: &FragmentationHandler) -> Rc<RefCell<Vec<Fragment>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        handler
            .transmit_event
            .subscribe(move |fragment| sink.borrow_mut().push(fragment));
        log
    }

    fn header_of(fragment: &Fragment) -> FragmentHeader {
        FragmentHeader::decode(&mut fragment.payload.clone()).expect("emitted fragments are framed")
    }

    fn data_fragment_to(handler_peer: Address, header: FragmentHeader, payload: &[u8]) -> Fragment {
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(payload);
        Fragment::new(handler_peer, Address(1), buf.freeze())
    }

    #[test]
    fn transmit_emits_indexed_fragments() {
        let mut handler = handler_with_slots(8);
        let log = sent(&handler);
        let now = Instant::now();

        let transfer = handler.new_transfer(PEER, TransferId(7), Bytes::from(vec![0xaa; 20]));
        handler.transmit_at(transfer, now).unwrap();

        let log = log.borrow();
        assert_eq!(3, log.len());
        for (i, fragment) in log.iter().enumerate() {
            let header = header_of(fragment);
            assert_eq!(FragmentKind::Data, header.kind);
            assert_eq!(i + 1, usize::from(header.index));
            assert_eq!(3, header.total);
            assert_eq!(TransferId(7), header.id);
            assert_eq!(PEER, fragment.destination);
        }
    }

    #[test]
    fn transmit_stops_when_slots_run_out() {
        let mut handler = handler_with_slots(2);
        let log = sent(&handler);

        let transfer = handler.new_transfer(PEER, TransferId(7), Bytes::from(vec![0xaa; 32]));
        handler.transmit_at(transfer, Instant::now()).unwrap();
        assert_eq!(2, log.borrow().len());
    }

    #[test]
    fn transmit_rejects_oversized_transfers() {
        let mut handler = handler_with_slots(0);
        let transfer = handler.new_transfer(PEER, TransferId(1), Bytes::from(vec![0; 8 * 256]));
        assert_eq!(
            Err(TransmitError::TransferTooBig { count: 256, max: 255 }),
            handler.transmit_at(transfer, Instant::now())
        );
    }

    #[test]
    fn reassembles_and_delivers_once() {
        let mut handler = handler_with_slots(8);
        let log = sent(&handler);
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        handler
            .transfer_receive_event
            .subscribe(move |transfer: Transfer| sink.borrow_mut().push(transfer.payload()));

        let now = Instant::now();
        let header = |index| FragmentHeader {
            kind: FragmentKind::Data,
            index,
            total: 2,
            id: TransferId(3),
            prev_id: TransferId(0),
        };
        handler.receive_callback_at(data_fragment_to(PEER, header(2), b"world"), now);
        handler.receive_callback_at(data_fragment_to(PEER, header(1), b"hello "), now);
        assert!(received.borrow().is_empty());

        handler.main_task_at(now);
        assert_eq!(vec![Bytes::from_static(b"hello world")], *received.borrow());

        // one ACK went out, index = total = fragment count
        let log = log.borrow();
        assert_eq!(1, log.len());
        let ack = header_of(&log[0]);
        assert_eq!(FragmentKind::Ack, ack.kind);
        assert_eq!(2, ack.index);
        assert_eq!(2, ack.total);
        assert_eq!(PEER, log[0].destination);

        // the record lingers as a tombstone, no second delivery
        drop(log);
        handler.main_task_at(now);
        assert_eq!(1, received.borrow().len());
    }

    #[test]
    fn tombstone_answers_duplicate_data_with_ack() {
        let mut handler = handler_with_slots(8);
        let log = sent(&handler);
        let now = Instant::now();

        let header = FragmentHeader {
            kind: FragmentKind::Data,
            index: 1,
            total: 1,
            id: TransferId(4),
            prev_id: TransferId(0),
        };
        handler.receive_callback_at(data_fragment_to(PEER, header, b"x"), now);
        handler.main_task_at(now);
        assert_eq!(1, log.borrow().len());

        // same fragment again: only a fresh ACK, no second delivery
        handler.receive_callback_at(data_fragment_to(PEER, header, b"x"), now);
        let log = log.borrow();
        assert_eq!(2, log.len());
        assert_eq!(FragmentKind::Ack, header_of(&log[1]).kind);
    }

    #[test]
    fn requests_missing_fragment_after_retransmit_time() {
        let mut handler = handler_with_slots(8);
        let log = sent(&handler);
        let now = Instant::now();

        let header = |index| FragmentHeader {
            kind: FragmentKind::Data,
            index,
            total: 3,
            id: TransferId(5),
            prev_id: TransferId(0),
        };
        handler.receive_callback_at(data_fragment_to(PEER, header(1), b"aa"), now);
        handler.receive_callback_at(data_fragment_to(PEER, header(3), b"cc"), now);

        // not yet: the transfer was touched just now
        handler.main_task_at(now);
        assert!(log.borrow().is_empty());

        let later = now + Duration::from_millis(150);
        handler.main_task_at(later);
        let req = header_of(&log.borrow()[0]);
        assert_eq!(FragmentKind::Req, req.kind);
        assert_eq!(2, req.index);
        assert_eq!(TransferId(5), req.id);

        // the request refreshed last_access, so the next tick stays quiet
        handler.main_task_at(later + Duration::from_millis(50));
        assert_eq!(1, log.borrow().len());
    }

    #[test]
    fn answers_retransmit_request() {
        let mut handler = handler_with_slots(8);
        let log = sent(&handler);
        let now = Instant::now();

        let transfer = handler.new_transfer(PEER, TransferId(7), Bytes::from(vec![0xaa; 20]));
        handler.transmit_at(transfer, now).unwrap();
        log.borrow_mut().clear();

        let req = FragmentHeader {
            kind: FragmentKind::Req,
            index: 2,
            total: 3,
            id: TransferId(7),
            prev_id: TransferId(0),
        };
        handler.receive_callback_at(data_fragment_to(PEER, req, b""), now);

        let log = log.borrow();
        assert_eq!(1, log.len());
        let resent = header_of(&log[0]);
        assert_eq!(FragmentKind::Data, resent.kind);
        assert_eq!(2, resent.index);
    }

    #[test]
    fn ignores_retransmit_request_past_the_end() {
        let mut handler = handler_with_slots(8);
        let log = sent(&handler);
        let now = Instant::now();

        let transfer = handler.new_transfer(PEER, TransferId(7), Bytes::from(vec![0xaa; 20]));
        handler.transmit_at(transfer, now).unwrap();
        log.borrow_mut().clear();

        let req = FragmentHeader {
            kind: FragmentKind::Req,
            index: 9,
            total: 9,
            id: TransferId(7),
            prev_id: TransferId(0),
        };
        handler.receive_callback_at(data_fragment_to(PEER, req, b""), now);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn ack_fires_event_and_stops_retransmissions() {
        let mut handler = handler_with_slots(8);
        let log = sent(&handler);
        let acked = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&acked);
        handler
            .transfer_ack_event
            .subscribe(move |meta: TransferMetadata| sink.borrow_mut().push(meta.id));

        let now = Instant::now();
        let transfer = handler.new_transfer(PEER, TransferId(7), Bytes::from(vec![0xaa; 20]));
        handler.transmit_at(transfer, now).unwrap();
        log.borrow_mut().clear();

        let ack = FragmentHeader {
            kind: FragmentKind::Ack,
            index: 3,
            total: 3,
            id: TransferId(7),
            prev_id: TransferId(0),
        };
        handler.receive_callback_at(data_fragment_to(PEER, ack, b""), now);
        assert_eq!(vec![TransferId(7)], *acked.borrow());

        // no probe after the record is gone
        handler.main_task_at(now + Duration::from_millis(500));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn probes_first_fragment_until_budget_is_spent() {
        let mut handler = handler_with_slots(64);
        let log = sent(&handler);
        let mut now = Instant::now();

        let transfer = handler.new_transfer(PEER, TransferId(7), Bytes::from(vec![0xaa; 8]));
        handler.transmit_at(transfer, now).unwrap();
        log.borrow_mut().clear();

        // 1 fragment * multiplier 2 = 2 probes, then the handler goes quiet
        for _ in 0..4 {
            now += Duration::from_millis(150);
            handler.main_task_at(now);
        }
        let log = log.borrow();
        assert_eq!(2, log.len());
        assert!(log.iter().all(|f| header_of(f).index == 1));
    }

    #[test]
    fn drops_outgoing_after_drop_time() {
        let mut handler = handler_with_slots(0);
        let log = sent(&handler);
        let acked = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&acked);
        handler.transfer_ack_event.subscribe(move |_| *sink.borrow_mut() += 1);

        let now = Instant::now();
        let transfer = handler.new_transfer(PEER, TransferId(7), Bytes::from(vec![0xaa; 8]));
        handler.transmit_at(transfer, now).unwrap();

        handler.main_task_at(now + Duration::from_secs(2));
        handler.interface_status_callback(Status {
            available_transmit_slots: 4,
        });
        handler.main_task_at(now + Duration::from_secs(3));
        assert!(log.borrow().is_empty());
        assert_eq!(0, *acked.borrow());
    }

    #[test]
    fn drops_stalled_incoming_after_drop_time() {
        let mut handler = handler_with_slots(8);
        let log = sent(&handler);
        let now = Instant::now();

        let header = FragmentHeader {
            kind: FragmentKind::Data,
            index: 1,
            total: 2,
            id: TransferId(5),
            prev_id: TransferId(0),
        };
        handler.receive_callback_at(data_fragment_to(PEER, header, b"aa"), now);
        log.borrow_mut().clear();

        handler.main_task_at(now + Duration::from_secs(2));
        // a fresh first fragment now starts a new transfer rather than
        // completing the dropped one
        handler.receive_callback_at(data_fragment_to(PEER, header, b"aa"), now);
        handler.main_task_at(now + Duration::from_secs(2) + Duration::from_millis(1));
        assert!(log.borrow().iter().all(|f| header_of(f).kind != FragmentKind::Ack));
    }

    #[test]
    fn tombstone_is_evicted_after_its_lifetime() {
        let mut handler = handler_with_slots(8);
        let _log = sent(&handler);
        let received = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&received);
        handler.transfer_receive_event.subscribe(move |_| *sink.borrow_mut() += 1);

        let now = Instant::now();
        let header = FragmentHeader {
            kind: FragmentKind::Data,
            index: 1,
            total: 1,
            id: TransferId(4),
            prev_id: TransferId(0),
        };
        handler.receive_callback_at(data_fragment_to(PEER, header, b"x"), now);
        handler.main_task_at(now);
        assert_eq!(1, *received.borrow());

        // past drop_time * tombstone_multiplier the record is gone, so the
        // same id delivers again
        let much_later = now + Duration::from_secs(6);
        handler.main_task_at(much_later);
        handler.receive_callback_at(data_fragment_to(PEER, header, b"x"), much_later);
        handler.main_task_at(much_later);
        assert_eq!(2, *received.borrow());
    }

    #[test]
    fn distinct_peers_with_the_same_id_stay_separate() {
        let mut handler = handler_with_slots(8);
        let _log = sent(&handler);
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        handler
            .transfer_receive_event
            .subscribe(move |t: Transfer| sink.borrow_mut().push((t.source(), t.payload())));

        let now = Instant::now();
        let header = FragmentHeader {
            kind: FragmentKind::Data,
            index: 1,
            total: 1,
            id: TransferId(4),
            prev_id: TransferId(0),
        };
        handler.receive_callback_at(data_fragment_to(Address(8), header, b"from 8"), now);
        handler.receive_callback_at(data_fragment_to(Address(9), header, b"from 9"), now);
        handler.main_task_at(now);

        let received = received.borrow();
        assert_eq!(2, received.len());
        assert!(received.contains(&(Address(8), Bytes::from_static(b"from 8"))));
        assert!(received.contains(&(Address(9), Bytes::from_static(b"from 9"))));
    }

    #[test]
    fn invalid_and_undersized_fragments_are_dropped() {
        let mut handler = handler_with_slots(8);
        let log = sent(&handler);
        let now = Instant::now();

        handler.receive_callback_at(Fragment::new(PEER, Address(1), Bytes::from_static(b"ab")), now);

        let invalid = FragmentHeader {
            kind: FragmentKind::Data,
            index: 0,
            total: 2,
            id: TransferId(1),
            prev_id: TransferId(0),
        };
        handler.receive_callback_at(data_fragment_to(PEER, invalid, b"zz"), now);

        handler.main_task_at(now + Duration::from_millis(200));
        assert!(log.borrow().is_empty());
    }
}

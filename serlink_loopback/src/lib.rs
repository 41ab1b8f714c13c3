#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

use tracing::{trace, warn};

use serlink::{Address, Fragment, Interface, InterfaceId, Status, Subject};

/// One direction of the link: fragments written by one side, pending pickup
/// by the other.
type Wire = Rc<RefCell<VecDeque<Fragment>>>;

type DropFilter = Box<dyn FnMut(&Fragment) -> bool>;

/// Configuration of one loopback endpoint.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Identifier of this interface within its device.
    pub identifier: InterfaceId,
    /// The endpoint's address on the two-node bus.
    pub address: Address,
    /// Largest payload one fragment may carry.
    pub max_data_size: usize,
    /// How many fragments the transmit queue holds; doubles as the
    /// interface's transmit-slot count.
    pub queue_capacity: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            identifier: InterfaceId(0),
            address: Address::NULL,
            max_data_size: 64,
            queue_capacity: 4,
        }
    }
}

/// One endpoint of an in-memory link.
///
/// Create endpoints in connected pairs with [`LoopbackInterface::pair`].
/// Nothing moves on its own: [`LoopbackInterface::poll`] picks up whatever
/// the peer has written, runs it through the endpoint's drop filter and fans
/// it out on [`receive_event`](Interface::receive_event). Every poll also
/// publishes the current transmit-slot count on
/// [`status_event`](Interface::status_event), so that upper layers which
/// account slots locally between polls are resynchronised.
///
/// Status is never reported synchronously from
/// [`write_noexcept`](Interface::write_noexcept); a write happens inside a
/// subscriber of the upper layer's transmit path, and reporting right there
/// would re-enter the upper layer while it is still emitting.
pub struct LoopbackInterface {
    identifier: InterfaceId,
    address: Address,
    max_data_size: usize,
    capacity: usize,
    tx: Wire,
    rx: Wire,
    receive_event: Subject<Fragment>,
    status_event: Subject<Status>,
    drop_filter: Option<DropFilter>,
}

impl LoopbackInterface {
    /// Creates two connected endpoints.
    pub fn pair(
        a: LoopbackConfig,
        b: LoopbackConfig,
    ) -> (Rc<RefCell<Self>>, Rc<RefCell<Self>>) {
        let a_to_b: Wire = Rc::new(RefCell::new(VecDeque::new()));
        let b_to_a: Wire = Rc::new(RefCell::new(VecDeque::new()));
        (
            Rc::new(RefCell::new(Self::new(
                a,
                Rc::clone(&a_to_b),
                Rc::clone(&b_to_a),
            ))),
            Rc::new(RefCell::new(Self::new(b, b_to_a, a_to_b))),
        )
    }

    fn new(config: LoopbackConfig, tx: Wire, rx: Wire) -> Self {
        Self {
            identifier: config.identifier,
            address: config.address,
            max_data_size: config.max_data_size,
            capacity: config.queue_capacity,
            tx,
            rx,
            receive_event: Subject::new(),
            status_event: Subject::new(),
            drop_filter: None,
        }
    }

    /// Installs a loss hook: fragments the filter returns `true` for are
    /// dropped before this endpoint sees them.
    pub fn set_drop_filter(&mut self, filter: impl FnMut(&Fragment) -> bool + 'static) {
        self.drop_filter = Some(Box::new(filter));
    }

    /// Removes the loss hook.
    pub fn clear_drop_filter(&mut self) {
        self.drop_filter = None;
    }

    /// Picks up everything the peer has written and fans it out.
    ///
    /// Publishes the transmit-slot count first, so that subscribers reacting
    /// to the received fragments see fresh capacity. Takes the endpoint by
    /// handle because subscribers may call straight back into it.
    pub fn poll(interface: &Rc<RefCell<Self>>) {
        let (batch, receive_event, status_event, status) = {
            let mut iface = interface.borrow_mut();

            let status = Status {
                available_transmit_slots: iface.capacity - iface.tx.borrow().len(),
            };

            let pending: Vec<Fragment> = iface.rx.borrow_mut().drain(..).collect();
            let identifier = iface.identifier;
            let mut batch = Vec::with_capacity(pending.len());
            for fragment in pending {
                if iface
                    .drop_filter
                    .as_mut()
                    .is_some_and(|filter| filter(&fragment))
                {
                    trace!("drop filter ate a fragment");
                    continue;
                }
                batch.push(fragment.with_interface(identifier));
            }
            (
                batch,
                iface.receive_event.clone(),
                iface.status_event.clone(),
                status,
            )
        };

        status_event.emit(status);
        for fragment in batch {
            receive_event.emit(fragment);
        }
    }
}

impl Interface for LoopbackInterface {
    fn identifier(&self) -> InterfaceId {
        self.identifier
    }

    fn address(&self) -> Address {
        self.address
    }

    fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    fn write_noexcept(&mut self, mut fragment: Fragment) {
        if fragment.payload.len() > self.max_data_size {
            warn!(
                len = fragment.payload.len(),
                max = self.max_data_size,
                "dropping oversized fragment"
            );
            return;
        }
        let mut tx = self.tx.borrow_mut();
        if tx.len() >= self.capacity {
            warn!("transmit queue full, dropping fragment");
            return;
        }
        if fragment.source.is_null() {
            fragment.source = self.address;
        }
        tx.push_back(fragment);
    }

    fn receive_event(&self) -> Subject<Fragment> {
        self.receive_event.clone()
    }

    fn status_event(&self) -> Subject<Status> {
        self.status_event.clone()
    }
}

impl fmt::Debug for LoopbackInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackInterface")
            .field("identifier", &self.identifier)
            .field("address", &self.address)
            .field("queued", &self.tx.borrow().len())
            .field("pending", &self.rx.borrow().len())
            .finish_non_exhaustive()
    }
}

//! See [`Subject`].

use std::{cell::RefCell, fmt, mem, rc::Rc};

type Callback<T> = Box<dyn FnMut(T)>;

/// Synchronous typed event publisher.
///
/// A [`Subject`] holds a list of subscriber callbacks and fans a value out to
/// all of them, in subscription order, when [`Subject::emit`] is called.
/// Subscribers run to completion inside the emitter's call; nothing is queued
/// or deferred.
///
/// The subject itself is a cheaply-cloneable handle - clones share the same
/// subscriber list. This is what lets a subscriber call back into the
/// component that owns the subject: emission only ever borrows the shared
/// list, never the owner. Components are wired together by handing out
/// subject clones, not by storing raw back-pointers to each other.
///
/// # Re-entrancy
///
/// During a fan-out the subscriber list is temporarily detached, so emitting
/// the *same* subject from inside one of its own subscribers reaches nobody.
/// Subscribing or unsubscribing during a fan-out takes effect once the
/// current fan-out finishes.
pub struct Subject<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

struct Inner<T> {
    next_id: u64,
    subscribers: Vec<(u64, Callback<T>)>,
    /// Ids unsubscribed while their callback was detached for a fan-out.
    dead: Vec<u64>,
}

/// Handle returned by [`Subject::subscribe`], used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

impl<T> Subject<T> {
    /// Creates a new subject with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                next_id: 0,
                subscribers: Vec::new(),
                dead: Vec::new(),
            })),
        }
    }

    /// Adds a subscriber, returning a handle that can be passed to
    /// [`Subject::unsubscribe`].
    pub fn subscribe(&self, callback: impl FnMut(T) + 'static) -> Subscription {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, Box::new(callback)));
        Subscription(id)
    }

    /// Removes a previously added subscriber.
    ///
    /// Unsubscribing a handle twice is a no-op.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut inner = self.inner.borrow_mut();
        if let Some(index) = inner
            .subscribers
            .iter()
            .position(|(id, _)| *id == subscription.0)
        {
            inner.subscribers.remove(index);
        } else {
            // the callback may be detached for an ongoing fan-out
            inner.dead.push(subscription.0);
        }
    }

    /// Number of current subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }
}

impl<T: Clone> Subject<T> {
    /// Fans `value` out to every subscriber, in subscription order.
    ///
    /// Each subscriber receives its own clone of `value`.
    pub fn emit(&self, value: T) {
        let mut current = mem::take(&mut self.inner.borrow_mut().subscribers);
        for (_, callback) in &mut current {
            callback(value.clone());
        }
        let mut inner = self.inner.borrow_mut();
        let added = mem::take(&mut inner.subscribers);
        current.extend(added);
        if !inner.dead.is_empty() {
            current.retain(|(id, _)| !inner.dead.contains(id));
            inner.dead.clear();
        }
        inner.subscribers = current;
    }
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

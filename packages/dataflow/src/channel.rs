//! FIFO channels that pair each write with the oldest waiting read.
//!
//! A channel keeps two queues of slots: `buffered` holds writes nobody has claimed yet
//! and `pending` holds reads nobody has satisfied yet. At most one of them is non-empty
//! at a time, which is what makes reads observe writes in write order.

use std::any::type_name;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::slot::{Callback, Slot};
use crate::{Cell, Failure, Outcome, ReadChannel, Scheduler, WriteChannel};

type Listener<T> = Arc<dyn Fn(Outcome<T>) + Send + Sync>;

struct Lanes<T> {
    buffered: VecDeque<Arc<Slot<T>>>,
    pending: VecDeque<Arc<Slot<T>>>,
    listeners: Vec<(Scheduler, Listener<T>)>,
    selectors: Vec<Waker>,
}

/// The matching core shared by [`Channel`] and [`SyncChannel`].
struct Matcher<T> {
    lanes: Mutex<Lanes<T>>,
    // Every slot of a rendezvous channel waits for exactly one reader.
    rendezvous: bool,
}

fn hook_listener<T>(slot: &Slot<T>, scheduler: &Scheduler, listener: &Listener<T>)
where
    T: Clone + Send + 'static,
{
    let listener = Arc::clone(listener);
    slot.add_callback(scheduler, Box::new(move |outcome| listener(outcome)), false);
}

impl<T> Matcher<T>
where
    T: Clone + Send + 'static,
{
    fn new(rendezvous: bool) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                buffered: VecDeque::new(),
                pending: VecDeque::new(),
                listeners: Vec::new(),
                selectors: Vec::new(),
            }),
            rendezvous,
        }
    }

    fn new_slot(&self) -> Arc<Slot<T>> {
        if self.rendezvous {
            Arc::new(Slot::with_parties(1))
        } else {
            Arc::new(Slot::new())
        }
    }

    /// Picks the slot the next write goes to: the oldest pending read, or a new
    /// buffered slot if no read is waiting.
    fn claim_write(&self) -> Arc<Slot<T>> {
        let mut lanes = self.lanes.lock();

        let slot = if let Some(slot) = lanes.pending.pop_front() {
            trace!("write matched a pending read");
            slot
        } else {
            let slot = self.new_slot();
            lanes.buffered.push_back(Arc::clone(&slot));
            slot
        };

        for (scheduler, listener) in &lanes.listeners {
            hook_listener(&slot, scheduler, listener);
        }

        slot
    }

    /// Picks the slot the next read comes from: the oldest buffered write, or a new
    /// pending slot if nothing has been written.
    fn claim_read(&self) -> Arc<Slot<T>> {
        let mut lanes = self.lanes.lock();

        if let Some(slot) = lanes.buffered.pop_front() {
            return slot;
        }

        let slot = self.new_slot();
        lanes.pending.push_back(Arc::clone(&slot));
        trace!(pending = lanes.pending.len(), "read parked in pending");
        slot
    }

    fn fill(&self, slot: &Slot<T>, outcome: Outcome<T>) {
        if slot.publish(outcome).is_err() {
            unreachable!("a claimed channel slot is only ever bound by the write that claimed it");
        }

        self.wake_selectors();
    }

    fn send(&self, outcome: Outcome<T>) {
        let slot = self.claim_write();
        self.fill(&slot, outcome);
        slot.await_release();
    }

    fn wake_selectors(&self) {
        let selectors = mem::take(&mut self.lanes.lock().selectors);

        for waker in selectors {
            waker.wake();
        }
    }

    fn receive_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let slot = self.claim_read();

        if let Some(outcome) = slot.get_timeout(timeout) {
            return Some(outcome);
        }

        let mut lanes = self.lanes.lock();

        if let Some(position) = lanes.pending.iter().position(|p| Arc::ptr_eq(p, &slot)) {
            lanes.pending.remove(position);
            trace!("timed-out read withdrawn from pending");
            return None;
        }

        drop(lanes);

        // A write claimed the slot before the read was withdrawn, so its value is
        // already on the way and belongs to this read.
        trace!("timed-out read waits for the write that claimed it");
        Some(slot.get())
    }

    /// Removes and returns the oldest buffered slot if it is bound. Otherwise registers
    /// `waker`, if given, to be woken by the next write.
    fn take_front(&self, waker: Option<&Waker>) -> Option<Outcome<T>> {
        let mut lanes = self.lanes.lock();

        if lanes.buffered.front().is_some_and(|slot| slot.is_bound()) {
            let slot = lanes.buffered.pop_front()?;
            drop(lanes);
            return slot.take_ready();
        }

        if let Some(waker) = waker {
            if !lanes.selectors.iter().any(|w| w.will_wake(waker)) {
                lanes.selectors.push(waker.clone());
            }
        }

        None
    }

    fn whenever_bound(&self, scheduler: &Scheduler, listener: Listener<T>) {
        let mut lanes = self.lanes.lock();

        for slot in &lanes.buffered {
            hook_listener(slot, scheduler, &listener);
        }

        lanes.listeners.push((scheduler.clone(), listener));
    }
}

impl<T> Matcher<T> {
    fn cancel_select(&self, waker: &Waker) {
        self.lanes.lock().selectors.retain(|w| !w.will_wake(waker));
    }

    fn len(&self) -> usize {
        self.lanes.lock().buffered.len()
    }

    fn pending_reads(&self) -> usize {
        self.lanes.lock().pending.len()
    }

    fn is_bound(&self) -> bool {
        self.lanes
            .lock()
            .buffered
            .front()
            .is_some_and(|slot| slot.is_bound())
    }
}

/// An unbounded FIFO channel.
///
/// Writes never block. A read takes the oldest unclaimed write or, if there is none,
/// waits for the next one. Reads observe writes in the order the writes were made.
///
/// Clones share the same queues.
///
/// # Example
///
/// ```rust
/// use dataflow::Channel;
///
/// let channel = Channel::new();
/// channel.send(1);
/// channel.send(2);
///
/// assert_eq!(channel.receive().unwrap(), 1);
/// assert_eq!(channel.receive().unwrap(), 2);
/// ```
pub struct Channel<T> {
    matcher: Arc<Matcher<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            matcher: Arc::clone(&self.matcher),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("buffered", &self.matcher.len())
            .field("pending_reads", &self.matcher.pending_reads())
            .finish()
    }
}

impl<T> Default for Channel<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Channel<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            matcher: Arc::new(Matcher::new(false)),
        }
    }

    /// Writes `value`, handing it to the oldest waiting read if there is one.
    pub fn send(&self, value: T) {
        self.matcher.send(Ok(value));
    }

    /// Writes a failure in place of a value.
    pub fn send_failure(&self, failure: Failure) {
        self.matcher.send(Err(failure));
    }

    /// Reserves the next position in the channel for the outcome of `source`.
    ///
    /// The position is taken now, so writes made after this call are read after the
    /// forwarded outcome, even though `source` may be bound much later.
    pub fn send_from(&self, scheduler: &Scheduler, source: &Cell<T>) {
        let slot = self.matcher.claim_write();
        let matcher = Arc::clone(&self.matcher);

        source.get_async(scheduler, move |outcome| matcher.fill(&slot, outcome));
    }

    /// Blocks until a value is available and takes it.
    ///
    /// # Errors
    ///
    /// Returns the failure written in place of a value, if any.
    pub fn receive(&self) -> Outcome<T> {
        self.matcher.claim_read().get()
    }

    /// Like [`receive()`][Self::receive], giving up after `timeout`.
    ///
    /// A read that times out leaves the channel as if it had never been made. If a
    /// write, including one reserved by [`send_from()`][Self::send_from], claimed the
    /// read before it was withdrawn, the read waits for that write's value instead.
    #[must_use]
    pub fn receive_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        self.matcher.receive_timeout(timeout)
    }

    /// Takes the next value and runs `callback` with it on `scheduler`.
    ///
    /// The read is queued immediately, so reads keep their order whether they block
    /// or not.
    pub fn receive_async<F>(&self, scheduler: &Scheduler, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let callback: Callback<T> = Box::new(callback);
        self.matcher.claim_read().add_callback(scheduler, callback, true);
    }

    /// Takes the oldest value if it is already available, without blocking.
    #[must_use]
    pub fn try_receive(&self) -> Option<Outcome<T>> {
        self.matcher.take_front(None)
    }

    /// Number of written values not yet taken by a read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.matcher.len()
    }

    /// Whether there are no written values waiting to be read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `listener` on `scheduler` for every value currently buffered and every
    /// value written from now on.
    ///
    /// Listeners observe values without taking them; reads still receive every value.
    pub fn whenever_bound<F>(&self, scheduler: &Scheduler, listener: F)
    where
        F: Fn(Outcome<T>) + Send + Sync + 'static,
    {
        self.matcher.whenever_bound(scheduler, Arc::new(listener));
    }
}

/// A FIFO channel without buffering: each write blocks until a read takes it.
///
/// # Example
///
/// ```rust
/// use std::thread;
///
/// use dataflow::SyncChannel;
///
/// let channel = SyncChannel::new();
/// let writer = channel.clone();
///
/// let handle = thread::spawn(move || writer.send("hello"));
///
/// assert_eq!(channel.receive().unwrap(), "hello");
/// handle.join().unwrap();
/// ```
pub struct SyncChannel<T> {
    matcher: Arc<Matcher<T>>,
}

impl<T> Clone for SyncChannel<T> {
    fn clone(&self) -> Self {
        Self {
            matcher: Arc::clone(&self.matcher),
        }
    }
}

impl<T> fmt::Debug for SyncChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("blocked_writers", &self.matcher.len())
            .field("pending_reads", &self.matcher.pending_reads())
            .finish()
    }
}

impl<T> Default for SyncChannel<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncChannel<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            matcher: Arc::new(Matcher::new(true)),
        }
    }

    /// Writes `value` and blocks until a read has taken it.
    pub fn send(&self, value: T) {
        self.matcher.send(Ok(value));
    }

    /// Writes a failure and blocks until a read has taken it.
    pub fn send_failure(&self, failure: Failure) {
        self.matcher.send(Err(failure));
    }

    /// Blocks until a writer offers a value and takes it.
    ///
    /// # Errors
    ///
    /// Returns the failure written in place of a value, if any.
    pub fn receive(&self) -> Outcome<T> {
        self.matcher.claim_read().get()
    }

    /// Like [`receive()`][Self::receive], giving up after `timeout`.
    #[must_use]
    pub fn receive_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        self.matcher.receive_timeout(timeout)
    }

    /// Takes the next value and runs `callback` with it on `scheduler`. The writer is
    /// released when the callback is dispatched.
    pub fn receive_async<F>(&self, scheduler: &Scheduler, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let callback: Callback<T> = Box::new(callback);
        self.matcher.claim_read().add_callback(scheduler, callback, true);
    }

    /// Takes a value from a blocked writer if there is one, releasing that writer.
    #[must_use]
    pub fn try_receive(&self) -> Option<Outcome<T>> {
        self.matcher.take_front(None)
    }

    /// Number of writers blocked until their value is read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.matcher.len()
    }

    /// Whether no writer is blocked on this channel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `listener` on `scheduler` for every value written from now on.
    ///
    /// Listeners do not count as readers, so writers still block until a read.
    pub fn whenever_bound<F>(&self, scheduler: &Scheduler, listener: F)
    where
        F: Fn(Outcome<T>) + Send + Sync + 'static,
    {
        self.matcher.whenever_bound(scheduler, Arc::new(listener));
    }
}

macro_rules! impl_channel_contracts {
    ($channel:ident) => {
        impl<T> ReadChannel<T> for $channel<T>
        where
            T: Clone + Send + 'static,
        {
            fn get_async(
                &self,
                scheduler: &Scheduler,
                callback: Box<dyn FnOnce(Outcome<T>) + Send>,
            ) {
                self.receive_async(scheduler, callback);
            }

            fn whenever_bound(&self, scheduler: &Scheduler, listener: Listener<T>) {
                self.matcher.whenever_bound(scheduler, listener);
            }

            fn poll(&self) -> Option<Outcome<T>> {
                self.try_receive()
            }

            fn is_bound(&self) -> bool {
                self.matcher.is_bound()
            }

            fn len(&self) -> usize {
                self.matcher.len()
            }

            fn poll_select(&self, waker: &Waker) -> Option<Outcome<T>> {
                self.matcher.take_front(Some(waker))
            }

            fn cancel_select(&self, waker: &Waker) {
                self.matcher.cancel_select(waker);
            }
        }

        impl<T> WriteChannel<T> for $channel<T>
        where
            T: Clone + Send + 'static,
        {
            fn send(&self, value: T) {
                $channel::send(self, value);
            }

            fn send_failure(&self, failure: Failure) {
                $channel::send_failure(self, failure);
            }
        }
    };
}

impl_channel_contracts!(Channel);
impl_channel_contracts!(SyncChannel);

//! Streams that deliver every published value to every subscriber.
//!
//! A stream is a singly linked list of write-once nodes. Publishers append at the
//! tail; every subscription is a private cursor that walks the list from the point
//! where it subscribed. Nodes nobody can reach any more are freed as cursors advance.

use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Waker;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::slot::{Callback, Slot};
use crate::{CellFuture, Error, Failure, Outcome, ReadChannel, Result, Scheduler, WriteChannel};

type Link<T> = Arc<OnceLock<Arc<Node<T>>>>;

struct Node<T> {
    slot: Arc<Slot<T>>,
    next: Link<T>,
}

impl<T> Node<T> {
    fn new(rendezvous: bool, parties: usize) -> Self {
        let slot = if rendezvous {
            Slot::with_parties(parties)
        } else {
            Slot::new()
        };

        Self {
            slot: Arc::new(slot),
            next: Arc::new(OnceLock::new()),
        }
    }
}

impl<T> Drop for Node<T> {
    // Unlinks the rest of the chain one node at a time, so that dropping a long
    // unread stream does not recurse once per node.
    fn drop(&mut self) {
        let mut next = Arc::get_mut(&mut self.next).and_then(OnceLock::take);

        while let Some(node) = next {
            next = Arc::into_inner(node)
                .and_then(|mut node| Arc::get_mut(&mut node.next).and_then(OnceLock::take));
        }
    }
}

struct StreamState<T> {
    tail: Arc<Node<T>>,
    subscribers: usize,
}

struct StreamShared<T> {
    state: Mutex<StreamState<T>>,
    // Every node of a rendezvous stream waits for all subscribers.
    rendezvous: bool,
}

impl<T> StreamShared<T> {
    fn new(rendezvous: bool) -> Self {
        Self {
            state: Mutex::new(StreamState {
                tail: Arc::new(Node::new(rendezvous, 0)),
                subscribers: 0,
            }),
            rendezvous,
        }
    }

    /// Returns the node after `node`, creating it if this is the first time anyone
    /// looks past `node`. Must be called with the stream state locked.
    fn successor(&self, node: &Node<T>, subscribers: usize) -> Arc<Node<T>> {
        Arc::clone(
            node.next
                .get_or_init(|| Arc::new(Node::new(self.rendezvous, subscribers))),
        )
    }

    fn follow(&self, node: &Node<T>) -> Arc<Node<T>> {
        let state = self.state.lock();
        self.successor(node, state.subscribers)
    }

    fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        let mut state = self.state.lock();
        let head = Arc::clone(&state.tail);

        // Nodes that readers have already created ahead of the publishers were sized
        // for the old subscriber count.
        let mut node = Some(Arc::clone(&head));
        while let Some(current) = node {
            current.slot.increment_parties();
            node = current.next.get().map(Arc::clone);
        }

        state.subscribers = state.subscribers.saturating_add(1);
        debug!(subscribers = state.subscribers, "subscription opened");
        drop(state);

        Subscription {
            stream: Arc::clone(self),
            head: Mutex::new(head),
            listeners: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn subscribers(&self) -> usize {
        self.state.lock().subscribers
    }
}

impl<T> StreamShared<T>
where
    T: Clone + Send + 'static,
{
    fn publish(&self, outcome: Outcome<T>) {
        let node = {
            let mut state = self.state.lock();
            let node = Arc::clone(&state.tail);
            state.tail = self.successor(&node, state.subscribers);
            node
        };

        if node.slot.publish(outcome).is_err() {
            unreachable!("each stream node is published exactly once, by the write that took it");
        }

        node.slot.await_release();
    }
}

fn listen<T>(
    slot: &Slot<T>,
    next: Link<T>,
    scheduler: &Scheduler,
    listener: Arc<dyn Fn(Outcome<T>) + Send + Sync>,
) where
    T: Clone + Send + 'static,
{
    let chained = scheduler.clone();
    let callback: Callback<T> = Box::new(move |outcome| {
        listener(outcome);

        // A node is only published after its successor exists.
        if let Some(node) = next.get() {
            listen(&node.slot, Arc::clone(&node.next), &chained, listener);
        }
    });

    slot.add_callback(scheduler, callback, false);
}

/// A publisher that hands every value to every current subscriber without waiting.
///
/// Values published before a subscription was opened are not seen by it. Clones
/// publish to the same stream.
///
/// # Example
///
/// ```rust
/// use dataflow::Broadcast;
///
/// let broadcast = Broadcast::new();
/// let first = broadcast.subscribe();
/// broadcast.publish(1);
/// let second = broadcast.subscribe();
/// broadcast.publish(2);
///
/// assert_eq!(first.get().unwrap(), 1);
/// assert_eq!(first.get().unwrap(), 2);
/// assert_eq!(second.get().unwrap(), 2);
/// ```
pub struct Broadcast<T> {
    stream: Arc<StreamShared<T>>,
}

/// A publisher whose every publish blocks until all current subscribers have read the
/// value.
///
/// # Example
///
/// ```rust
/// use std::thread;
///
/// use dataflow::SyncBroadcast;
///
/// let broadcast = SyncBroadcast::new();
/// let subscription = broadcast.subscribe();
///
/// let publisher = {
///     let broadcast = broadcast.clone();
///     thread::spawn(move || broadcast.publish("tick"))
/// };
///
/// assert_eq!(subscription.get().unwrap(), "tick");
/// publisher.join().unwrap();
/// ```
pub struct SyncBroadcast<T> {
    stream: Arc<StreamShared<T>>,
}

macro_rules! impl_publisher {
    ($publisher:ident, $rendezvous:literal) => {
        impl<T> Clone for $publisher<T> {
            fn clone(&self) -> Self {
                Self {
                    stream: Arc::clone(&self.stream),
                }
            }
        }

        impl<T> fmt::Debug for $publisher<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(type_name::<Self>())
                    .field("subscribers", &self.stream.subscribers())
                    .finish_non_exhaustive()
            }
        }

        impl<T> Default for $publisher<T>
        where
            T: Clone + Send + 'static,
        {
            fn default() -> Self {
                Self::new()
            }
        }

        impl<T> $publisher<T>
        where
            T: Clone + Send + 'static,
        {
            /// Creates a stream with no subscribers.
            #[must_use]
            pub fn new() -> Self {
                Self {
                    stream: Arc::new(StreamShared::new($rendezvous)),
                }
            }

            /// Opens a subscription that reads every value published from now on.
            #[must_use]
            pub fn subscribe(&self) -> Subscription<T> {
                self.stream.subscribe()
            }

            /// Number of open subscriptions.
            #[must_use]
            pub fn subscribers(&self) -> usize {
                self.stream.subscribers()
            }
        }

        impl<T> WriteChannel<T> for $publisher<T>
        where
            T: Clone + Send + 'static,
        {
            fn send(&self, value: T) {
                self.publish(value);
            }

            fn send_failure(&self, failure: Failure) {
                self.publish_failure(failure);
            }
        }
    };
}

impl_publisher!(Broadcast, false);
impl_publisher!(SyncBroadcast, true);

impl<T> Broadcast<T>
where
    T: Clone + Send + 'static,
{
    /// Appends `value` to the stream.
    pub fn publish(&self, value: T) {
        self.stream.publish(Ok(value));
    }

    /// Appends a failure to the stream in place of a value.
    pub fn publish_failure(&self, failure: Failure) {
        self.stream.publish(Err(failure));
    }
}

impl<T> SyncBroadcast<T>
where
    T: Clone + Send + 'static,
{
    /// Appends `value` to the stream and blocks until every subscription that was
    /// open at the time has read it.
    pub fn publish(&self, value: T) {
        self.stream.publish(Ok(value));
    }

    /// Appends a failure to the stream and blocks until every subscription has read it.
    pub fn publish_failure(&self, failure: Failure) {
        self.stream.publish(Err(failure));
    }
}

/// A private read cursor over a broadcast stream.
///
/// Each read takes the next value published after the subscription was opened. Other
/// subscriptions are not affected.
///
/// Reading a closed subscription panics. Dropping an open subscription closes it, so
/// that it no longer counts as a subscriber and [`SyncBroadcast`] publishers stop
/// waiting for it. A subscription with listeners stays open, since its listeners keep
/// reading the stream.
pub struct Subscription<T> {
    stream: Arc<StreamShared<T>>,
    head: Mutex<Arc<Node<T>>>,
    listeners: AtomicUsize,
    closed: AtomicBool,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("closed", &self.is_closed())
            .field("listeners", &self.listeners.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> Subscription<T> {
    /// Whether [`unsubscribe()`][Self::unsubscribe] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the subscription. Publishers no longer wait for it and further reads
    /// panic.
    ///
    /// # Errors
    ///
    /// [`Error::ListenersRegistered`] if [`whenever_bound()`][Self::whenever_bound]
    /// listeners are attached, since they would keep reading a closed cursor.
    /// [`Error::SubscriptionClosed`] if the subscription is already closed.
    pub fn unsubscribe(&self) -> Result<()> {
        let count = self.listeners.load(Ordering::Acquire);
        if count > 0 {
            return Err(Error::ListenersRegistered { count });
        }

        let head = Arc::clone(&self.head.lock());
        let mut state = self.stream.state.lock();

        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::SubscriptionClosed);
        }

        let mut node = Some(head);
        while let Some(current) = node {
            current.slot.decrement_parties();
            node = current.next.get().map(Arc::clone);
        }

        state.subscribers = state.subscribers.saturating_sub(1);
        debug!(subscribers = state.subscribers, "subscription closed");

        Ok(())
    }

    fn assert_open(&self) {
        assert!(
            !self.is_closed(),
            "{} read after unsubscribe",
            type_name::<Self>()
        );
    }

    /// Moves the cursor one node forward and returns the node it was on.
    fn advance(&self) -> (Arc<Node<T>>, Arc<Node<T>>) {
        self.assert_open();

        let mut head = self.head.lock();
        let current = Arc::clone(&head);
        let next = self.stream.follow(&current);
        *head = Arc::clone(&next);

        (current, next)
    }

    /// Runs `step` on the head node and moves past it if `step` produced a value.
    fn take_head(&self, step: impl FnOnce(&Slot<T>) -> Option<Outcome<T>>) -> Option<Outcome<T>> {
        self.assert_open();

        let mut head = self.head.lock();
        let outcome = step(&head.slot)?;
        let next = self.stream.follow(&head);
        *head = next;

        Some(outcome)
    }

    /// Whether the next value has been published.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.head.lock().slot.is_bound()
    }

    /// Number of published values this subscription has not read yet.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut count = 0_usize;
        let mut node = Arc::clone(&self.head.lock());

        while node.slot.is_bound() {
            count = count.saturating_add(1);

            let Some(next) = node.next.get().map(Arc::clone) else {
                break;
            };
            node = next;
        }

        count
    }

    /// Whether every published value has been read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Subscription<T>
where
    T: Clone + Send + 'static,
{
    /// Blocks until the next value is published and takes it.
    ///
    /// # Errors
    ///
    /// Returns the failure published in place of a value, if any.
    ///
    /// # Panics
    ///
    /// Panics if the subscription has been closed.
    pub fn get(&self) -> Outcome<T> {
        let (current, _) = self.advance();
        current.slot.get()
    }

    /// Like [`get()`][Self::get], giving up after `timeout`.
    ///
    /// A read that times out leaves the cursor where it was, unless another read on
    /// the same subscription moved it in the meantime.
    ///
    /// # Panics
    ///
    /// Panics if the subscription has been closed.
    #[must_use]
    pub fn get_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let (current, next) = self.advance();

        if let Some(outcome) = current.slot.get_timeout(timeout) {
            return Some(outcome);
        }

        let mut head = self.head.lock();
        if Arc::ptr_eq(&head, &next) {
            *head = current;
        }

        None
    }

    /// Takes the next value without blocking, if it has been published.
    ///
    /// # Panics
    ///
    /// Panics if the subscription has been closed.
    #[must_use]
    pub fn poll(&self) -> Option<Outcome<T>> {
        self.take_head(Slot::take_ready)
    }

    /// Takes the next value and runs `callback` with it on `scheduler`.
    ///
    /// # Panics
    ///
    /// Panics if the subscription has been closed.
    pub fn get_async<F>(&self, scheduler: &Scheduler, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let (current, _) = self.advance();
        current.slot.add_callback(scheduler, Box::new(callback), true);
    }

    /// Returns a future that takes the next value.
    ///
    /// # Panics
    ///
    /// Panics if the subscription has been closed.
    pub fn wait(&self) -> CellFuture<T> {
        let (current, _) = self.advance();
        CellFuture::new(Arc::clone(&current.slot))
    }

    /// Runs `listener` on `scheduler` for every value published from the current
    /// cursor position onwards.
    ///
    /// Listeners observe values without moving the cursor and do not count as reads,
    /// so a [`SyncBroadcast`] publisher does not wait for them. A subscription with
    /// listeners can no longer be unsubscribed.
    ///
    /// # Panics
    ///
    /// Panics if the subscription has been closed.
    pub fn whenever_bound<F>(&self, scheduler: &Scheduler, listener: F)
    where
        F: Fn(Outcome<T>) + Send + Sync + 'static,
    {
        ReadChannel::whenever_bound(self, scheduler, Arc::new(listener));
    }
}

impl<T> ReadChannel<T> for Subscription<T>
where
    T: Clone + Send + 'static,
{
    fn get_async(&self, scheduler: &Scheduler, callback: Box<dyn FnOnce(Outcome<T>) + Send>) {
        Self::get_async(self, scheduler, callback);
    }

    fn whenever_bound(
        &self,
        scheduler: &Scheduler,
        listener: Arc<dyn Fn(Outcome<T>) + Send + Sync>,
    ) {
        self.assert_open();
        self.listeners.fetch_add(1, Ordering::AcqRel);

        let head = Arc::clone(&self.head.lock());
        listen(&head.slot, Arc::clone(&head.next), scheduler, listener);
    }

    fn poll(&self) -> Option<Outcome<T>> {
        Self::poll(self)
    }

    fn is_bound(&self) -> bool {
        Self::is_bound(self)
    }

    fn len(&self) -> usize {
        Self::len(self)
    }

    fn poll_select(&self, waker: &Waker) -> Option<Outcome<T>> {
        self.take_head(|slot| slot.poll_or_register(waker))
    }

    fn cancel_select(&self, waker: &Waker) {
        self.head.lock().slot.cancel_waker(waker);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if !self.is_closed() && self.listeners.load(Ordering::Acquire) == 0 {
            if let Err(error) = self.unsubscribe() {
                debug!(%error, "subscription not closed on drop");
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;
    use crate::test_utils::{ManualExecutor, flag_waker};

    assert_impl_all!(Broadcast<u32>: Send, Sync, Clone);
    assert_impl_all!(SyncBroadcast<u32>: Send, Sync, Clone);
    assert_impl_all!(Subscription<u32>: Send, Sync);

    #[test]
    fn subscribers_see_values_from_their_subscription_point() {
        let broadcast = Broadcast::new();
        broadcast.publish(0);

        let early = broadcast.subscribe();
        broadcast.publish(1);
        let late = broadcast.subscribe();
        broadcast.publish(2);

        assert_eq!(early.len(), 2);
        assert_eq!(early.get().unwrap(), 1);
        assert_eq!(early.get().unwrap(), 2);
        assert_eq!(late.get().unwrap(), 2);
        assert!(late.is_empty());
    }

    #[test]
    fn publish_without_subscribers_does_not_block() {
        let broadcast = SyncBroadcast::new();
        broadcast.publish("nobody listens");

        assert_eq!(broadcast.subscribers(), 0);
    }

    #[test]
    fn poll_takes_only_published_values() {
        let broadcast = Broadcast::new();
        let subscription = broadcast.subscribe();

        assert!(subscription.poll().is_none());
        broadcast.publish(3);
        assert_eq!(subscription.poll().unwrap().unwrap(), 3);
        assert!(subscription.poll().is_none());
    }

    #[test]
    fn timed_out_read_keeps_cursor() {
        let broadcast = Broadcast::new();
        let subscription = broadcast.subscribe();

        assert!(subscription.get_timeout(Duration::from_millis(10)).is_none());
        broadcast.publish(4);

        assert_eq!(subscription.get().unwrap(), 4);
    }

    #[test]
    fn sync_publish_waits_for_every_subscriber() {
        with_watchdog(|| {
            let broadcast = SyncBroadcast::new();
            let first = broadcast.subscribe();
            let second = broadcast.subscribe();
            let published = Arc::new(AtomicBool::new(false));

            let publisher = {
                let broadcast = broadcast.clone();
                let published = Arc::clone(&published);
                thread::spawn(move || {
                    broadcast.publish(8);
                    published.store(true, Ordering::Release);
                })
            };

            let reader = thread::spawn(move || first.get().unwrap());

            thread::sleep(Duration::from_millis(20));
            assert!(!published.load(Ordering::Acquire));

            assert_eq!(second.get().unwrap(), 8);
            assert_eq!(reader.join().unwrap(), 8);
            publisher.join().unwrap();
            assert!(published.load(Ordering::Acquire));
        });
    }

    #[test]
    fn unsubscribe_releases_blocked_publisher() {
        with_watchdog(|| {
            let broadcast = SyncBroadcast::new();
            let reader = broadcast.subscribe();
            let absent = broadcast.subscribe();

            let publisher = {
                let broadcast = broadcast.clone();
                thread::spawn(move || broadcast.publish(1))
            };

            let reader = thread::spawn(move || reader.get().unwrap());

            absent.unsubscribe().unwrap();
            assert_eq!(reader.join().unwrap(), 1);
            publisher.join().unwrap();

            // The reader's subscription was dropped with its thread.
            assert_eq!(broadcast.subscribers(), 0);
            assert!(matches!(absent.unsubscribe(), Err(Error::SubscriptionClosed)));
        });
    }

    #[test]
    fn dropping_sync_subscription_unsubscribes() {
        let broadcast = SyncBroadcast::<u32>::new();
        let subscription = broadcast.subscribe();
        assert_eq!(broadcast.subscribers(), 1);

        drop(subscription);
        assert_eq!(broadcast.subscribers(), 0);

        broadcast.publish(1);
    }

    #[test]
    fn dropping_async_subscription_stops_counting_it() {
        let broadcast = Broadcast::<u32>::new();
        let kept = broadcast.subscribe();
        let dropped = broadcast.subscribe();
        broadcast.publish(1);
        assert_eq!(broadcast.subscribers(), 2);

        drop(dropped);
        assert_eq!(broadcast.subscribers(), 1);
        assert_eq!(kept.get().unwrap(), 1);
    }

    #[test]
    fn subscription_with_listeners_stays_counted_after_drop() {
        let executor = ManualExecutor::new();
        let broadcast = Broadcast::<u32>::new();
        let subscription = broadcast.subscribe();
        subscription.whenever_bound(&executor.scheduler(), |_| {});

        drop(subscription);
        assert_eq!(broadcast.subscribers(), 1);
    }

    #[test]
    #[should_panic(expected = "read after unsubscribe")]
    fn reading_closed_subscription_panics() {
        let broadcast = Broadcast::<u32>::new();
        let subscription = broadcast.subscribe();
        subscription.unsubscribe().unwrap();

        drop(subscription.poll());
    }

    #[test]
    fn unsubscribe_with_listeners_is_rejected() {
        let executor = ManualExecutor::new();
        let scheduler = executor.scheduler();
        let broadcast = SyncBroadcast::<u32>::new();
        let subscription = broadcast.subscribe();

        subscription.whenever_bound(&scheduler, |_| {});

        assert!(matches!(
            subscription.unsubscribe(),
            Err(Error::ListenersRegistered { count: 1 })
        ));
        assert!(!subscription.is_closed());
    }

    #[test]
    fn listener_sees_every_value_without_consuming() {
        let executor = ManualExecutor::new();
        let scheduler = executor.scheduler();
        let broadcast = Broadcast::new();
        let subscription = broadcast.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let target = Arc::clone(&seen);
        subscription.whenever_bound(&scheduler, move |outcome: Outcome<u32>| {
            target.lock().push(outcome.unwrap());
        });

        for value in 1..=3 {
            broadcast.publish(value);
            executor.run_all();
        }

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(subscription.get().unwrap(), 1);
    }

    #[test]
    fn get_async_reads_in_order() {
        let executor = ManualExecutor::new();
        let scheduler = executor.scheduler();
        let broadcast = Broadcast::new();
        let subscription = broadcast.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let target = Arc::clone(&seen);
            subscription.get_async(&scheduler, move |outcome: Outcome<&str>| {
                target.lock().push(outcome.unwrap());
            });
        }

        broadcast.publish("a");
        broadcast.publish("b");
        executor.run_all();

        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[test]
    fn select_waker_is_woken_by_publish() {
        let broadcast = Broadcast::new();
        let subscription = broadcast.subscribe();
        let (waker, woken) = flag_waker();

        assert!(ReadChannel::poll_select(&subscription, &waker).is_none());
        broadcast.publish(2);

        assert!(woken.load(Ordering::Acquire));
        assert_eq!(
            ReadChannel::poll_select(&subscription, &waker)
                .unwrap()
                .unwrap(),
            2
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Too many operations for Miri.
    fn long_unread_stream_drops_without_overflow() {
        let broadcast = Broadcast::new();
        let subscription = broadcast.subscribe();

        for value in 0..200_000_u32 {
            broadcast.publish(value);
        }

        drop(broadcast);
        drop(subscription);
    }
}

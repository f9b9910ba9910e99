//! The read and write surfaces shared by every channel kind.

use std::sync::Arc;
use std::task::Waker;

use crate::{Failure, Outcome, Scheduler};

/// A source of values that can be read asynchronously, polled and selected over.
///
/// Implemented by [`Cell`][crate::Cell], [`SyncCell`][crate::SyncCell],
/// [`LazyCell`][crate::LazyCell], [`Channel`][crate::Channel],
/// [`SyncChannel`][crate::SyncChannel] and [`Subscription`][crate::Subscription].
/// Reading a cell never consumes it; reading a channel or subscription takes the
/// next value.
pub trait ReadChannel<T>: Send + Sync {
    /// Delivers the next value to `callback` on `scheduler`, without blocking.
    fn get_async(&self, scheduler: &Scheduler, callback: Box<dyn FnOnce(Outcome<T>) + Send>);

    /// Delivers every value written from now on to `listener` on `scheduler`.
    fn whenever_bound(&self, scheduler: &Scheduler, listener: Arc<dyn Fn(Outcome<T>) + Send + Sync>);

    /// Reads the next value if one is ready, without blocking.
    fn poll(&self) -> Option<Outcome<T>>;

    /// Whether a value is ready to be read.
    fn is_bound(&self) -> bool;

    /// Number of values ready to be read.
    fn len(&self) -> usize;

    /// Whether no value is ready to be read.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the next value if one is ready, otherwise arranges for `waker` to be woken
    /// when one might be.
    ///
    /// Used by [`Select`][crate::Select]. Each call consumes at most one value.
    fn poll_select(&self, waker: &Waker) -> Option<Outcome<T>>;

    /// Forgets a `waker` registered by [`poll_select()`][Self::poll_select].
    fn cancel_select(&self, waker: &Waker);
}

/// A sink that values and failures can be written to.
///
/// Implemented by [`Cell`][crate::Cell], [`SyncCell`][crate::SyncCell],
/// [`Channel`][crate::Channel], [`SyncChannel`][crate::SyncChannel],
/// [`Broadcast`][crate::Broadcast] and [`SyncBroadcast`][crate::SyncBroadcast].
pub trait WriteChannel<T>: Send + Sync {
    /// Writes a value.
    fn send(&self, value: T);

    /// Writes a failure in place of a value.
    fn send_failure(&self, failure: Failure);
}

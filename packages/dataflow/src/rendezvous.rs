//! Single-assignment cells whose writer and readers meet at a barrier.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

use tracing::debug;

use crate::slot::Slot;
use crate::{
    Cell, CellFuture, Error, Failure, Outcome, ReadChannel, Result, Scheduler, WriteChannel,
    run_guarded,
};

/// A single-assignment cell whose writer waits for a number of readers.
///
/// Binding blocks the writer until `parties` readers have read the value. Each
/// blocking reader also waits until the last required reader has arrived, so the
/// writer and all required readers proceed together. Readers beyond the required
/// count return at once.
///
/// Callbacks registered through [`get_async()`][Self::get_async] count as a reader
/// arriving when they are dispatched; they never hold an executor thread at the
/// barrier.
///
/// # Example
///
/// ```rust
/// use std::thread;
///
/// use dataflow::SyncCell;
///
/// let cell = SyncCell::new(1);
/// let reader = cell.clone();
///
/// let handle = thread::spawn(move || reader.get().unwrap());
///
/// // Returns only once the reader above has taken the value.
/// cell.bind("handshake");
/// assert_eq!(handle.join().unwrap(), "handshake");
/// ```
pub struct SyncCell<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for SyncCell<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for SyncCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("state", &self.slot.describe())
            .field("parties", &self.slot.parties())
            .field("awaiting_parties", &self.slot.awaiting_parties())
            .finish()
    }
}

impl<T> SyncCell<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an unbound cell that releases its writer after `parties` readers.
    #[must_use]
    pub fn new(parties: usize) -> Self {
        Self {
            slot: Arc::new(Slot::with_parties(parties)),
        }
    }

    /// Binds the cell to `value` and blocks until the required readers have read it.
    ///
    /// A bind that loses the race against an earlier bind returns at once.
    pub fn bind(&self, value: T) {
        self.bind_outcome(Ok(value));
    }

    /// Binds the cell to `failure` and blocks until the required readers have read it.
    pub fn bind_error(&self, failure: Failure) {
        self.bind_outcome(Err(failure));
    }

    fn bind_outcome(&self, outcome: Outcome<T>) {
        if self.slot.publish(outcome).is_err() {
            debug!("sync cell already bound, later bind discarded");
            return;
        }

        self.slot.await_release();
    }

    /// Binds the cell to `value`, failing at once if it was bound before.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyBound`] if any earlier bind succeeded.
    pub fn bind_unique(&self, value: T) -> Result<()> {
        self.slot
            .publish(Ok(value))
            .map_err(|_| Error::AlreadyBound)?;
        self.slot.await_release();
        Ok(())
    }

    /// Blocks until bound, then until the required readers have arrived.
    ///
    /// # Errors
    ///
    /// Returns the [`Failure`] the cell is bound to, if any.
    pub fn get(&self) -> Outcome<T> {
        self.slot.get()
    }

    /// Like [`get()`][Self::get], giving up after `timeout`.
    ///
    /// The wait for the bind is checked first; a reader that times out there has not
    /// arrived. A reader that times out at the barrier withdraws its arrival, so the
    /// writer keeps waiting for another reader.
    #[must_use]
    pub fn get_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        self.slot.get_timeout(timeout)
    }

    /// Returns the outcome if bound, without blocking and without arriving.
    #[must_use]
    pub fn poll(&self) -> Option<Outcome<T>> {
        self.slot.peek()
    }

    /// Whether the cell has been bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.slot.is_bound()
    }

    /// Whether the cell has been bound to a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.slot.is_error()
    }

    /// Returns a future that arrives once the cell is bound and completes when the
    /// barrier is released.
    #[must_use]
    pub fn wait(&self) -> CellFuture<T> {
        CellFuture::new(Arc::clone(&self.slot))
    }

    /// Runs `callback` on `scheduler` once bound. The dispatch counts as an arrival.
    pub fn get_async<F>(&self, scheduler: &Scheduler, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.slot.add_callback(scheduler, Box::new(callback), true);
    }

    /// Returns a cell bound to `f(value)` once this cell is bound and `f` has run on
    /// `scheduler`. The chained read counts as an arrival.
    pub fn then<U, F>(&self, scheduler: &Scheduler, f: F) -> Cell<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let result = Cell::new();
        let target = result.clone();

        self.get_async(scheduler, move |outcome| {
            target.bind_outcome(outcome.and_then(|value| run_guarded(|| f(value))));
        });

        result
    }

    /// Requires one more reader.
    ///
    /// Returns `false` if the barrier has already been released, in which case the
    /// extra reader is not waited for.
    pub fn increment_parties(&self) -> bool {
        self.slot.increment_parties()
    }

    /// Requires one fewer reader, never going below zero.
    ///
    /// Releases the barrier if the readers that already arrived are now enough.
    pub fn decrement_parties(&self) {
        self.slot.decrement_parties();
    }

    /// Number of readers the barrier waits for.
    #[must_use]
    pub fn parties(&self) -> usize {
        self.slot.parties()
    }

    /// Number of readers still missing before the barrier is released.
    #[must_use]
    pub fn awaiting_parties(&self) -> usize {
        self.slot.awaiting_parties()
    }
}

impl<T> ReadChannel<T> for SyncCell<T>
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
        // Listeners observe the value without taking part in the rendezvous.
        self.slot
            .add_callback(scheduler, Box::new(move |outcome| listener(outcome)), false);
    }

    fn poll(&self) -> Option<Outcome<T>> {
        self.slot.take_ready()
    }

    fn is_bound(&self) -> bool {
        Self::is_bound(self)
    }

    fn len(&self) -> usize {
        usize::from(Self::is_bound(self))
    }

    fn poll_select(&self, waker: &Waker) -> Option<Outcome<T>> {
        self.slot.poll_or_register(waker)
    }

    fn cancel_select(&self, waker: &Waker) {
        self.slot.cancel_waker(waker);
    }
}

impl<T> WriteChannel<T> for SyncCell<T>
where
    T: Clone + Send + 'static,
{
    fn send(&self, value: T) {
        self.bind(value);
    }

    fn send_failure(&self, failure: Failure) {
        self.bind_error(failure);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    use futures::executor::block_on;
    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;
    use crate::test_utils::ManualExecutor;

    assert_impl_all!(SyncCell<u32>: Send, Sync, Clone);

    #[test]
    fn writer_waits_for_all_readers() {
        with_watchdog(|| {
            let cell = SyncCell::new(2);
            let writer_done = Arc::new(AtomicBool::new(false));

            let writer = {
                let cell = cell.clone();
                let writer_done = Arc::clone(&writer_done);
                thread::spawn(move || {
                    cell.bind(7);
                    writer_done.store(true, Ordering::Release);
                })
            };

            let first = {
                let cell = cell.clone();
                thread::spawn(move || cell.get().unwrap())
            };

            while cell.awaiting_parties() != 1 {
                thread::yield_now();
            }

            // One reader is still missing, so neither the writer nor the first reader
            // may have returned.
            thread::sleep(Duration::from_millis(20));
            assert!(!writer_done.load(Ordering::Acquire));
            assert!(!first.is_finished());

            assert_eq!(cell.get().unwrap(), 7);

            writer.join().unwrap();
            assert!(writer_done.load(Ordering::Acquire));
            assert_eq!(first.join().unwrap(), 7);
        });
    }

    #[test]
    fn no_reader_returns_before_all_arrive() {
        with_watchdog(|| {
            const READERS: usize = 3;

            let cell = SyncCell::new(READERS);
            let returned = Arc::new(AtomicUsize::new(0));

            let readers: Vec<_> = (0..READERS)
                .map(|_| {
                    let cell = cell.clone();
                    let returned = Arc::clone(&returned);
                    thread::spawn(move || {
                        let value = cell.get().unwrap();
                        returned.fetch_add(1, Ordering::AcqRel);
                        value
                    })
                })
                .collect();

            let writer = {
                let cell = cell.clone();
                thread::spawn(move || cell.bind("go"))
            };

            for reader in readers {
                assert_eq!(reader.join().unwrap(), "go");
            }

            writer.join().unwrap();
            assert_eq!(returned.load(Ordering::Acquire), READERS);
            assert_eq!(cell.awaiting_parties(), 0);
        });
    }

    #[test]
    fn async_callback_counts_as_arrival() {
        with_watchdog(|| {
            let executor = ManualExecutor::new();
            let scheduler = executor.scheduler();
            let cell = SyncCell::new(1);
            let seen = Arc::new(AtomicUsize::new(0));

            let target = Arc::clone(&seen);
            cell.get_async(&scheduler, move |outcome| {
                target.store(outcome.unwrap(), Ordering::Relaxed);
            });

            // The callback arrives when it is dispatched, so the writer is not held.
            cell.bind(4);
            executor.run_all();

            assert_eq!(seen.load(Ordering::Relaxed), 4);
        });
    }

    #[test]
    fn decrement_releases_blocked_writer() {
        with_watchdog(|| {
            let cell = SyncCell::new(1);

            let writer = {
                let cell = cell.clone();
                thread::spawn(move || cell.bind(1))
            };

            while !cell.is_bound() {
                thread::yield_now();
            }

            cell.decrement_parties();
            writer.join().unwrap();
            assert_eq!(cell.parties(), 0);
        });
    }

    #[test]
    fn increment_adds_required_reader() {
        with_watchdog(|| {
            let cell = SyncCell::new(0);
            assert!(cell.increment_parties());

            let reader = {
                let cell = cell.clone();
                thread::spawn(move || cell.get().unwrap())
            };

            cell.bind(2);
            assert_eq!(reader.join().unwrap(), 2);
            assert!(!cell.increment_parties());
        });
    }

    #[test]
    fn timed_out_bind_wait_records_no_arrival() {
        let cell = SyncCell::<u8>::new(1);

        assert!(cell.get_timeout(Duration::from_millis(10)).is_none());
        assert_eq!(cell.awaiting_parties(), 1);
    }

    #[test]
    fn timed_out_rendezvous_withdraws_arrival() {
        with_watchdog(|| {
            let cell = SyncCell::new(2);

            let writer = {
                let cell = cell.clone();
                thread::spawn(move || cell.bind(3))
            };

            while !cell.is_bound() {
                thread::yield_now();
            }

            assert!(cell.get_timeout(Duration::from_millis(20)).is_none());
            assert_eq!(cell.awaiting_parties(), 2);

            cell.decrement_parties();
            cell.decrement_parties();
            writer.join().unwrap();
        });
    }

    #[test]
    fn future_arrives_and_completes_on_release() {
        with_watchdog(|| {
            let cell = SyncCell::new(1);

            let writer = {
                let cell = cell.clone();
                thread::spawn(move || cell.bind(11))
            };

            assert_eq!(block_on(cell.wait()).unwrap(), 11);
            writer.join().unwrap();
        });
    }

    #[test]
    fn second_bind_unique_fails_without_blocking() {
        with_watchdog(|| {
            let cell = SyncCell::new(0);

            cell.bind_unique(1).unwrap();
            assert!(matches!(cell.bind_unique(2), Err(Error::AlreadyBound)));
        });
    }
}

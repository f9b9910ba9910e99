//! Single-assignment cells and the callback chains built on them.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::slot::Slot;
use crate::{Error, Failure, Outcome, ReadChannel, Result, Scheduler, WriteChannel, run_guarded};

/// A write-once, read-many slot.
///
/// A cell starts unbound and is bound exactly once, either to a value or to a
/// [`Failure`]. Readers can block until it is bound, poll it, await it, or register
/// callbacks that run on a [`Scheduler`] once it is bound. Callbacks always run
/// asynchronously, even when the cell is already bound at registration.
///
/// Clones share the same slot.
///
/// # Example
///
/// ```rust
/// use dataflow::{Cell, Pool};
///
/// let pool = Pool::new();
/// let scheduler = pool.scheduler();
///
/// let input = Cell::new();
/// let doubled = input.then(&scheduler, |x: i32| x * 2);
///
/// input.bind(21);
/// assert_eq!(doubled.get().unwrap(), 42);
/// ```
pub struct Cell<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("state", &self.slot.describe())
            .finish_non_exhaustive()
    }
}

impl<T> Default for Cell<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Cell<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an unbound cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot::new()),
        }
    }

    /// Creates a cell that is already bound to `value`.
    #[must_use]
    pub fn bound(value: T) -> Self {
        let cell = Self::new();
        cell.bind(value);
        cell
    }

    /// Creates a cell that is already bound to `failure`.
    #[must_use]
    pub fn failed(failure: Failure) -> Self {
        let cell = Self::new();
        cell.bind_error(failure);
        cell
    }

    /// Binds the cell to `value`.
    ///
    /// If the cell is already bound, this call loses the race and `value` is discarded.
    /// Use [`bind_unique()`][Self::bind_unique] or [`bind_checked()`][Self::bind_checked]
    /// to be told about the conflict.
    pub fn bind(&self, value: T) {
        self.bind_outcome(Ok(value));
    }

    /// Binds the cell to `failure`, losing silently if it is already bound.
    pub fn bind_error(&self, failure: Failure) {
        self.bind_outcome(Err(failure));
    }

    /// Binds the cell to either a value or a failure, losing silently if it is
    /// already bound.
    pub fn bind_outcome(&self, outcome: Outcome<T>) {
        if self.slot.publish(outcome).is_err() {
            debug!("cell already bound, later bind discarded");
        }
    }

    /// Binds the cell to `value`, failing if it was bound before.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyBound`] if any earlier bind succeeded.
    pub fn bind_unique(&self, value: T) -> Result<()> {
        self.slot.publish(Ok(value)).map_err(|_| Error::AlreadyBound)
    }

    /// Binds the cell to `failure`, failing if it was bound before.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyBound`] if any earlier bind succeeded.
    pub fn bind_error_unique(&self, failure: Failure) -> Result<()> {
        self.slot.publish(Err(failure)).map_err(|_| Error::AlreadyBound)
    }

    /// Blocks until the cell is bound and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns the [`Failure`] the cell is bound to, if any.
    pub fn get(&self) -> Outcome<T> {
        self.slot.get()
    }

    /// Blocks for at most `timeout` waiting for the cell to be bound.
    ///
    /// Returns `None` if the deadline passed while the cell was still unbound.
    #[must_use]
    pub fn get_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        self.slot.get_timeout(timeout)
    }

    /// Blocks for at most `timeout` and treats both a timeout and a bound failure
    /// as errors.
    ///
    /// # Errors
    ///
    /// [`Error::TimedOut`] if the cell was not bound in time and [`Error::Failed`] if
    /// it was bound to a failure.
    pub fn get_within(&self, timeout: Duration) -> Result<T> {
        match self.get_timeout(timeout) {
            Some(outcome) => outcome.map_err(Error::Failed),
            None => Err(Error::TimedOut { timeout }),
        }
    }

    /// Blocks until the cell is bound, without reading it.
    pub fn join(&self) {
        self.slot.join();
    }

    /// Blocks for at most `timeout` waiting for the cell to be bound. Returns whether it
    /// is bound.
    #[must_use]
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.slot.join_timeout(timeout)
    }

    /// Returns the outcome if the cell is bound, without blocking.
    #[must_use]
    pub fn poll(&self) -> Option<Outcome<T>> {
        self.slot.peek()
    }

    /// Whether the cell has been bound, to a value or a failure.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.slot.is_bound()
    }

    /// Whether the cell has been bound to a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.slot.is_error()
    }

    /// The failure the cell is bound to, if any.
    #[must_use]
    pub fn error(&self) -> Option<Failure> {
        self.poll().and_then(std::result::Result::err)
    }

    /// Returns a future that completes with the outcome once the cell is bound.
    #[must_use]
    pub fn wait(&self) -> CellFuture<T> {
        CellFuture::new(Arc::clone(&self.slot))
    }

    /// Runs `callback` on `scheduler` with the outcome once the cell is bound.
    ///
    /// Never blocks and never runs `callback` on the calling thread.
    pub fn get_async<F>(&self, scheduler: &Scheduler, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.slot.add_callback(scheduler, Box::new(callback), true);
    }

    /// Same as [`get_async()`][Self::get_async].
    pub fn when_bound<F>(&self, scheduler: &Scheduler, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.get_async(scheduler, callback);
    }

    /// Returns a cell bound to `f(value)` once this cell is bound and `f` has run on
    /// `scheduler`.
    ///
    /// A failure bound to this cell is passed on to the returned cell without calling
    /// `f`. A panic in `f` binds the returned cell to a failure.
    pub fn then<U, F>(&self, scheduler: &Scheduler, f: F) -> Cell<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_try(scheduler, move |value| Ok(f(value)))
    }

    /// Like [`then()`][Self::then], but a failure is handed to `on_error` and its
    /// result is bound instead.
    pub fn then_or_else<U, F, H>(&self, scheduler: &Scheduler, f: F, on_error: H) -> Cell<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
        H: FnOnce(Failure) -> U + Send + 'static,
    {
        let result = Cell::new();
        let target = result.clone();

        self.get_async(scheduler, move |outcome| {
            target.bind_outcome(match outcome {
                Ok(value) => run_guarded(|| f(value)),
                Err(failure) => run_guarded(|| on_error(failure)),
            });
        });

        result
    }

    /// Like [`then()`][Self::then], for bodies that can fail.
    pub fn then_try<U, F>(&self, scheduler: &Scheduler, f: F) -> Cell<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Outcome<U> + Send + 'static,
    {
        let result = Cell::new();
        let target = result.clone();

        self.get_async(scheduler, move |outcome| {
            target.bind_outcome(outcome.and_then(|value| run_guarded(|| f(value)).and_then(|o| o)));
        });

        result
    }

    /// Runs every body on the bound value in parallel and binds the returned cell to
    /// their results, in the order the bodies were given.
    ///
    /// The first failure, from this cell or from any body, becomes the result.
    pub fn then_fork_and_join<U, F>(&self, scheduler: &Scheduler, bodies: Vec<F>) -> Cell<Vec<U>>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let forks: Vec<Cell<U>> = bodies
            .into_iter()
            .map(|body| self.then(scheduler, body))
            .collect();

        when_all_bound(scheduler, &forks, |values| values)
    }
}

impl<T> Cell<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Binds the cell to `value`, accepting a repeated bind of an equal value.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyBound`] if the cell is bound to a different value or to a
    /// failure.
    pub fn bind_checked(&self, value: T) -> Result<()> {
        match self.slot.publish(Ok(value)) {
            Ok(()) => Ok(()),
            Err(rejected) => match (self.slot.peek(), rejected) {
                (Some(Ok(existing)), Ok(value)) if existing == value => Ok(()),
                _ => Err(Error::AlreadyBound),
            },
        }
    }
}

impl<T> ReadChannel<T> for Cell<T>
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
        Self::get_async(self, scheduler, move |outcome| listener(outcome));
    }

    fn poll(&self) -> Option<Outcome<T>> {
        Self::poll(self)
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

impl<T> WriteChannel<T> for Cell<T>
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

/// Completes with the outcome of a cell once it is bound.
///
/// Created by [`Cell::wait()`] and its counterparts on the other cell types. For a
/// rendezvous cell the future counts as one arriving reader and completes once the
/// rendezvous is released; dropping it before then withdraws the arrival.
pub struct CellFuture<T> {
    slot: Arc<Slot<T>>,
    arrived: bool,
    finished: bool,
}

impl<T> CellFuture<T> {
    pub(crate) fn new(slot: Arc<Slot<T>>) -> Self {
        Self {
            slot,
            arrived: false,
            finished: false,
        }
    }
}

impl<T> fmt::Debug for CellFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("arrived", &self.arrived)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T> Future for CellFuture<T>
where
    T: Clone + Send + 'static,
{
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.slot.poll_future(cx.waker(), &mut this.arrived) {
            Some(outcome) => {
                this.finished = true;
                Poll::Ready(outcome)
            }
            None => Poll::Pending,
        }
    }
}

impl<T> Drop for CellFuture<T> {
    fn drop(&mut self) {
        if self.arrived && !self.finished {
            self.slot.withdraw_arrival();
        }
    }
}

struct JoinState<T, F> {
    values: Vec<Option<T>>,
    remaining: usize,
    body: Option<F>,
}

struct Join<T, U, F> {
    state: Mutex<JoinState<T, F>>,
    target: Cell<U>,
}

impl<T, U, F> Join<T, U, F>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnOnce(Vec<T>) -> U,
{
    fn complete(&self, index: usize, outcome: Outcome<T>) {
        let ready = {
            let mut state = self.state.lock();

            match outcome {
                Err(failure) => {
                    // Only the first failure is reported; the body never runs after one.
                    if state.body.take().is_some() {
                        drop(state);
                        self.target.bind_error(failure);
                    }
                    return;
                }
                Ok(value) => {
                    if let Some(slot) = state.values.get_mut(index) {
                        *slot = Some(value);
                    }

                    state.remaining = state.remaining.saturating_sub(1);

                    if state.remaining == 0 {
                        let values = mem::take(&mut state.values);
                        state.body.take().map(|body| (body, values))
                    } else {
                        None
                    }
                }
            }
        };

        if let Some((body, values)) = ready {
            let values: Vec<T> = values.into_iter().flatten().collect();
            self.target.bind_outcome(run_guarded(|| body(values)));
        }
    }
}

/// Calls `f` with the values of all `cells`, in order, once every one of them is bound.
///
/// `f` runs on `scheduler`. If any cell is bound to a failure, the first such failure
/// is bound to the result and `f` never runs.
pub fn when_all_bound<T, U, F>(scheduler: &Scheduler, cells: &[Cell<T>], f: F) -> Cell<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnOnce(Vec<T>) -> U + Send + 'static,
{
    let result = Cell::new();

    if cells.is_empty() {
        let target = result.clone();
        scheduler.submit(move || target.bind_outcome(run_guarded(|| f(Vec::new()))));
        return result;
    }

    let join = Arc::new(Join {
        state: Mutex::new(JoinState {
            values: vec![None; cells.len()],
            remaining: cells.len(),
            body: Some(f),
        }),
        target: result.clone(),
    });

    for (index, cell) in cells.iter().enumerate() {
        let join = Arc::clone(&join);
        cell.get_async(scheduler, move |outcome| join.complete(index, outcome));
    }

    result
}

/// Like [`when_all_bound()`], but the first failure is handed to `on_error` and its
/// result is bound instead.
pub fn when_all_bound_or_else<T, U, F, H>(
    scheduler: &Scheduler,
    cells: &[Cell<T>],
    f: F,
    on_error: H,
) -> Cell<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnOnce(Vec<T>) -> U + Send + 'static,
    H: FnOnce(Failure) -> U + Send + 'static,
{
    when_all_bound(scheduler, cells, |values| values).then_or_else(scheduler, f, on_error)
}

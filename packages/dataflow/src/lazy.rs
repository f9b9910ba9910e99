//! Cells that compute their value on first use.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::{Cell, CellFuture, Failure, Outcome, ReadChannel, Scheduler, run_guarded};

type Initializer<T> = Box<dyn FnOnce() -> Outcome<T> + Send>;

struct LazyInner<T> {
    cell: Cell<T>,
    init: Mutex<Option<Initializer<T>>>,
    started: AtomicBool,
    scheduler: Scheduler,
}

/// A cell whose value is computed by an initializer the first time anyone touches it.
///
/// Every read, bind, chaining call and state query starts the initializer if it has
/// not been started yet. The initializer runs exactly once, on the scheduler given at
/// construction, and its result is bound like any other cell value. A panic in the
/// initializer binds a [`Failure`].
///
/// Clones share the same cell and the same initializer.
///
/// # Example
///
/// ```rust
/// use dataflow::{LazyCell, Pool};
///
/// let pool = Pool::new();
/// let config = LazyCell::new(&pool.scheduler(), || "loaded".to_owned());
///
/// assert!(!config.is_started());
/// assert_eq!(config.get().unwrap(), "loaded");
/// ```
pub struct LazyCell<T> {
    inner: Arc<LazyInner<T>>,
}

impl<T> Clone for LazyCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for LazyCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("started", &self.is_started())
            .field("cell", &self.inner.cell)
            .finish_non_exhaustive()
    }
}

impl<T> LazyCell<T> {
    /// Whether the initializer has been started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }
}

impl<T> LazyCell<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a lazy cell that binds the value returned by `init`.
    #[must_use]
    pub fn new<F>(scheduler: &Scheduler, init: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::new_fallible(scheduler, move || Ok(init()))
    }

    /// Creates a lazy cell that binds the outcome returned by `init`, which may be a
    /// failure.
    #[must_use]
    pub fn new_fallible<F>(scheduler: &Scheduler, init: F) -> Self
    where
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        Self {
            inner: Arc::new(LazyInner {
                cell: Cell::new(),
                init: Mutex::new(Some(Box::new(init))),
                started: AtomicBool::new(false),
                scheduler: scheduler.clone(),
            }),
        }
    }

    /// Starts the initializer unless it has already been started.
    pub fn touch(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let Some(init) = self.inner.init.lock().take() else {
            return;
        };

        trace!("lazy cell initializer scheduled");

        let cell = self.inner.cell.clone();
        self.inner
            .scheduler
            .submit(move || cell.bind_outcome(run_guarded(init).and_then(|outcome| outcome)));
    }

    /// The underlying cell. Reading it directly does not start the initializer.
    #[must_use]
    pub fn cell(&self) -> &Cell<T> {
        &self.inner.cell
    }

    /// Starts the initializer if needed and blocks until the value is bound.
    ///
    /// # Errors
    ///
    /// Returns the failure of the initializer, if any.
    pub fn get(&self) -> Outcome<T> {
        self.touch();
        self.inner.cell.get()
    }

    /// Like [`get()`][Self::get], giving up after `timeout`.
    #[must_use]
    pub fn get_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        self.touch();
        self.inner.cell.get_timeout(timeout)
    }

    /// Starts the initializer if needed and returns the outcome if it is already bound.
    #[must_use]
    pub fn poll(&self) -> Option<Outcome<T>> {
        self.touch();
        self.inner.cell.poll()
    }

    /// Starts the initializer if needed and reports whether it has finished.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.touch();
        self.inner.cell.is_bound()
    }

    /// Starts the initializer if needed and reports whether it failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.touch();
        self.inner.cell.is_error()
    }

    /// Binds a value ahead of the initializer. The initializer is still started and
    /// its result is discarded if this bind wins.
    pub fn bind(&self, value: T) {
        self.touch();
        self.inner.cell.bind(value);
    }

    /// Binds a failure ahead of the initializer.
    pub fn bind_error(&self, failure: Failure) {
        self.touch();
        self.inner.cell.bind_error(failure);
    }

    /// Starts the initializer if needed and returns a future for its outcome.
    #[must_use]
    pub fn wait(&self) -> CellFuture<T> {
        self.touch();
        self.inner.cell.wait()
    }

    /// Starts the initializer if needed and runs `callback` on `scheduler` with the
    /// outcome.
    pub fn get_async<F>(&self, scheduler: &Scheduler, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.touch();
        self.inner.cell.get_async(scheduler, callback);
    }

    /// Starts the initializer if needed and chains `f` on its value, like
    /// [`Cell::then()`].
    pub fn then<U, F>(&self, scheduler: &Scheduler, f: F) -> Cell<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.touch();
        self.inner.cell.then(scheduler, f)
    }
}

impl<T> ReadChannel<T> for LazyCell<T>
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
        self.touch();
        ReadChannel::whenever_bound(&self.inner.cell, scheduler, listener);
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
        self.touch();
        self.inner.cell.poll_select(waker)
    }

    fn cancel_select(&self, waker: &Waker) {
        self.inner.cell.cancel_select(waker);
    }
}

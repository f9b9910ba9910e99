//! Reading the first available value out of several sources.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::executor::block_on;
use rand::seq::SliceRandom;
use tracing::trace;

use crate::timer::run_after;
use crate::{Cell, Error, Outcome, ReadChannel, Result, Scheduler};

type Sources<T> = Arc<[Arc<dyn ReadChannel<T>>]>;

/// The value taken by a select and the position of the source it came from.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct SelectResult<T> {
    /// Index of the source in the list given to [`Select::new()`].
    pub index: usize,

    /// What was read from that source.
    pub value: Outcome<T>,
}

/// Reads one value from whichever of several sources has one first.
///
/// Each select consumes exactly one value from exactly one source. When several
/// sources are ready, [`select()`][Self::select] picks one of them uniformly at random
/// and [`priority_select()`][Self::priority_select] picks the one with the lowest index.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use dataflow::{Channel, ReadChannel, Select};
///
/// let fast = Channel::new();
/// let slow = Channel::new();
/// fast.send("fast");
///
/// let sources: Vec<Arc<dyn ReadChannel<&str>>> =
///     vec![Arc::new(slow.clone()), Arc::new(fast.clone())];
/// let select = Select::new(sources);
///
/// let result = select.select();
/// assert_eq!(result.index, 1);
/// assert_eq!(result.value.unwrap(), "fast");
/// ```
pub struct Select<T> {
    sources: Sources<T>,
}

impl<T> fmt::Debug for Select<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl<T> Select<T>
where
    T: Send + 'static,
{
    /// Creates a selector over `sources`.
    ///
    /// # Panics
    ///
    /// Panics if `sources` is empty.
    #[must_use]
    pub fn new(sources: Vec<Arc<dyn ReadChannel<T>>>) -> Self {
        assert!(!sources.is_empty(), "a select needs at least one source");

        Self {
            sources: sources.into(),
        }
    }

    /// Number of sources.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Blocks until a value is available on any source and takes it, choosing at
    /// random among sources that are ready together.
    #[must_use]
    pub fn select(&self) -> SelectResult<T> {
        block_on(self.select_future())
    }

    /// Blocks until a value is available on any source and takes it, preferring the
    /// source with the lowest index.
    #[must_use]
    pub fn priority_select(&self) -> SelectResult<T> {
        block_on(self.priority_select_future())
    }

    /// Like [`select()`][Self::select], only considering sources whose mask entry is
    /// `true`.
    ///
    /// # Errors
    ///
    /// [`Error::MaskLength`] if the mask does not have one entry per source and
    /// [`Error::NoEnabledSources`] if it disables every source.
    pub fn select_masked(&self, mask: &[bool]) -> Result<SelectResult<T>> {
        Ok(block_on(self.future_for(Some(mask), false)?))
    }

    /// Like [`priority_select()`][Self::priority_select], only considering sources
    /// whose mask entry is `true`.
    ///
    /// # Errors
    ///
    /// [`Error::MaskLength`] if the mask does not have one entry per source and
    /// [`Error::NoEnabledSources`] if it disables every source.
    pub fn priority_select_masked(&self, mask: &[bool]) -> Result<SelectResult<T>> {
        Ok(block_on(self.future_for(Some(mask), true)?))
    }

    /// Returns a future that resolves like [`select()`][Self::select].
    #[must_use]
    pub fn select_future(&self) -> SelectFuture<T> {
        self.unmasked_future(false)
    }

    /// Returns a future that resolves like [`priority_select()`][Self::priority_select].
    #[must_use]
    pub fn priority_select_future(&self) -> SelectFuture<T> {
        self.unmasked_future(true)
    }

    /// Selects without blocking and runs `callback` with the result on `scheduler`.
    pub fn select_with<F>(&self, scheduler: &Scheduler, callback: F)
    where
        F: FnOnce(SelectResult<T>) + Send + 'static,
    {
        let future = self.select_future();
        scheduler.spawn_future(async move { callback(future.await) });
    }

    /// Prioritized selects without blocking and runs `callback` with the result on
    /// `scheduler`.
    pub fn priority_select_with<F>(&self, scheduler: &Scheduler, callback: F)
    where
        F: FnOnce(SelectResult<T>) + Send + 'static,
    {
        let future = self.priority_select_future();
        scheduler.spawn_future(async move { callback(future.await) });
    }

    fn unmasked_future(&self, priority: bool) -> SelectFuture<T> {
        SelectFuture::new(
            Arc::clone(&self.sources),
            (0..self.sources.len()).collect(),
            priority,
        )
    }

    fn future_for(&self, mask: Option<&[bool]>, priority: bool) -> Result<SelectFuture<T>> {
        let Some(mask) = mask else {
            return Ok(self.unmasked_future(priority));
        };

        if mask.len() != self.sources.len() {
            return Err(Error::MaskLength {
                expected: self.sources.len(),
                actual: mask.len(),
            });
        }

        let enabled: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(index, enabled)| enabled.then_some(index))
            .collect();

        if enabled.is_empty() {
            return Err(Error::NoEnabledSources);
        }

        Ok(SelectFuture::new(Arc::clone(&self.sources), enabled, priority))
    }
}

impl<T> Select<T>
where
    T: Clone + Send + 'static,
{
    /// Selects without blocking and binds the result to the returned cell.
    #[must_use]
    pub fn select_to_cell(&self, scheduler: &Scheduler) -> Cell<SelectResult<T>> {
        let result = Cell::new();
        let target = result.clone();

        self.select_with(scheduler, move |selected| target.bind(selected));

        result
    }

    /// Prioritized selects without blocking and binds the result to the returned cell.
    #[must_use]
    pub fn priority_select_to_cell(&self, scheduler: &Scheduler) -> Cell<SelectResult<T>> {
        let result = Cell::new();
        let target = result.clone();

        self.priority_select_with(scheduler, move |selected| target.bind(selected));

        result
    }
}

/// A select in progress. Resolves to the first value taken from any enabled source.
///
/// Dropping the future before it resolves withdraws it from all sources without
/// consuming anything.
#[must_use = "futures do nothing unless polled"]
pub struct SelectFuture<T> {
    sources: Sources<T>,
    enabled: Vec<usize>,
    priority: bool,
    registered: Option<Waker>,
    finished: bool,
}

impl<T> fmt::Debug for SelectFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T> SelectFuture<T> {
    fn new(sources: Sources<T>, enabled: Vec<usize>, priority: bool) -> Self {
        Self {
            sources,
            enabled,
            priority,
            registered: None,
            finished: false,
        }
    }

    fn cancel_registrations(&mut self) {
        let Some(waker) = self.registered.take() else {
            return;
        };

        for index in &self.enabled {
            if let Some(source) = self.sources.get(*index) {
                source.cancel_select(&waker);
            }
        }
    }
}

impl<T> Future for SelectFuture<T> {
    type Output = SelectResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let waker = cx.waker();

        if this
            .registered
            .as_ref()
            .is_some_and(|previous| !previous.will_wake(waker))
        {
            this.cancel_registrations();
        }

        // Registering the waker before a later source turns out to be ready is fine:
        // every registration is withdrawn once a value has been taken.
        this.registered = Some(waker.clone());

        let mut order = this.enabled.clone();
        if !this.priority {
            order.shuffle(&mut rand::rng());
        }

        for index in order {
            let Some(source) = this.sources.get(index) else {
                continue;
            };

            if let Some(value) = source.poll_select(waker) {
                trace!(index, "select took a value");
                this.cancel_registrations();
                this.finished = true;
                return Poll::Ready(SelectResult { index, value });
            }
        }

        Poll::Pending
    }
}

impl<T> Drop for SelectFuture<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel_registrations();
        }
    }
}

/// Returns a cell that is bound to `sentinel` once `duration` has passed.
///
/// Add it as one of the sources of a [`Select`] to bound how long the select waits.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use dataflow::{Channel, ReadChannel, Select, create_timeout};
///
/// let quiet = Channel::<&str>::new();
///
/// let sources: Vec<Arc<dyn ReadChannel<&str>>> = vec![
///     Arc::new(quiet.clone()),
///     Arc::new(create_timeout(Duration::from_millis(10), "timeout")),
/// ];
///
/// let result = Select::new(sources).select();
/// assert_eq!(result.index, 1);
/// assert_eq!(result.value.unwrap(), "timeout");
/// ```
#[must_use]
pub fn create_timeout<T>(duration: Duration, sentinel: T) -> Cell<T>
where
    T: Clone + Send + 'static,
{
    let cell = Cell::new();
    let target = cell.clone();

    run_after(duration, move || target.bind(sentinel));

    cell
}

//! The seam between the dataflow primitives and whatever runs their callbacks.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::Context;

use futures::future::BoxFuture;
use futures::task::{self as futures_task, ArcWake};
use parking_lot::Mutex;
use tracing::trace;

use crate::{Cell, run_guarded};

/// A unit of work handed to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks submitted by the dataflow primitives.
///
/// This is the only thing the primitives need from the outside world. Thread counts,
/// fairness and affinity are entirely up to the implementation. A task must never be
/// executed inline on the submitting thread, because the primitives rely on callbacks
/// running after the registering call has returned.
///
/// Any `Fn(Task)` closure is an executor, which makes it easy to plug in an existing
/// runtime:
///
/// ```rust
/// use dataflow::{Scheduler, Task};
///
/// let scheduler = Scheduler::new(|task: Task| {
///     std::thread::spawn(task);
/// });
///
/// let answer = scheduler.spawn(|| 6 * 7);
/// assert_eq!(answer.get().unwrap(), 42);
/// ```
pub trait Executor: Send + Sync + 'static {
    /// Queues `task` for execution.
    fn submit(&self, task: Task);
}

impl<F> Executor for F
where
    F: Fn(Task) + Send + Sync + 'static,
{
    fn submit(&self, task: Task) {
        self(task);
    }
}

/// A handle for dispatching callbacks onto an [`Executor`].
///
/// Every operation that runs user code asynchronously takes a scheduler explicitly.
/// Schedulers are cheaply cloneable; all clones share the same executor.
#[derive(Clone)]
pub struct Scheduler {
    executor: Arc<dyn Executor>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler that submits work to `executor`.
    pub fn new<E: Executor>(executor: E) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    /// Creates a scheduler from an already shared executor.
    #[must_use]
    pub fn from_shared(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Submits a fire-and-forget task.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        trace!("task submitted");
        self.executor.submit(Box::new(task));
    }

    /// Runs `f` on the executor and binds its return value to the returned cell.
    ///
    /// If `f` panics, the cell is bound to a [`Failure`][crate::Failure] describing
    /// the panic.
    pub fn spawn<U, F>(&self, f: F) -> Cell<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce() -> U + Send + 'static,
    {
        let result = Cell::new();
        let target = result.clone();

        self.submit(move || target.bind_outcome(run_guarded(f)));

        result
    }

    /// Drives `future` to completion by polling it on the executor.
    ///
    /// Each wake-up submits one more poll, so the future never occupies an executor
    /// thread while it is waiting.
    pub fn spawn_future<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(FutureTask {
            future: Mutex::new(Some(Box::pin(future))),
            scheduler: self.clone(),
        });

        ArcWake::wake(task);
    }
}

struct FutureTask {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    scheduler: Scheduler,
}

impl FutureTask {
    fn poll_once(self: &Arc<Self>) {
        let mut slot = self.future.lock();

        let Some(mut future) = slot.take() else {
            // Already completed; this was a stale wake-up.
            return;
        };

        let waker = futures_task::waker_ref(self);
        let mut cx = Context::from_waker(&waker);

        if future.as_mut().poll(&mut cx).is_pending() {
            *slot = Some(future);
        }
    }
}

impl ArcWake for FutureTask {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let task = Arc::clone(arc_self);
        arc_self.scheduler.submit(move || task.poll_once());
    }
}

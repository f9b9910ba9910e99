//! A fixed-size thread pool that implements [`Executor`].

use std::any::type_name;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle as ThreadJoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::{Executor, Scheduler, Task, panic_message};

const DEFAULT_THREAD_NAME_PREFIX: &str = "dataflow-worker";

struct Queue {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

pub(crate) struct PoolInner {
    queue: Mutex<Queue>,
    work_available: Condvar,
    worker_handles: Mutex<Vec<ThreadJoinHandle<()>>>,
}

impl fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle_count = self.worker_handles.lock().len();
        let queued = self.queue.lock().tasks.len();

        f.debug_struct(type_name::<Self>())
            .field("worker_count", &handle_count)
            .field("queued_tasks", &queued)
            .finish_non_exhaustive()
    }
}

impl Executor for PoolInner {
    fn submit(&self, task: Task) {
        let mut queue = self.queue.lock();

        if queue.shutdown {
            trace!("pool is shut down, task abandoned");
            return;
        }

        queue.tasks.push_back(task);
        drop(queue);

        self.work_available.notify_one();
    }
}

impl PoolInner {
    fn next_task(&self) -> Option<Task> {
        let mut queue = self.queue.lock();

        loop {
            if queue.shutdown {
                return None;
            }

            if let Some(task) = queue.tasks.pop_front() {
                return Some(task);
            }

            self.work_available.wait(&mut queue);
        }
    }

    fn shut_down(&self) {
        // Abandoned tasks may own cells that own schedulers that own this pool, so they
        // are dropped outside the lock.
        let abandoned = {
            let mut queue = self.queue.lock();
            queue.shutdown = true;
            mem::take(&mut queue.tasks)
        };

        self.work_available.notify_all();

        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "abandoning queued tasks at shutdown");
        }

        drop(abandoned);

        let handles = mem::take(&mut *self.worker_handles.lock());
        let current = thread::current().id();

        for handle in handles {
            if handle.thread().id() == current {
                // The pool is being dropped by one of its own tasks. That worker exits
                // on its own once the task returns.
                continue;
            }

            if let Err(payload) = handle.join() {
                // Workers run every task inside a panic trap, so this means the pool
                // infrastructure itself is broken.
                panic::resume_unwind(payload);
            }
        }
    }
}

fn worker_loop(inner: &PoolInner, worker_index: usize) {
    while let Some(task) = inner.next_task() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(
                worker_index,
                message = %panic_message(&*payload),
                "scheduled task panicked"
            );
        } else {
            trace!(worker_index, "executed task");
        }
    }
}

/// A pool of worker threads that runs dataflow callbacks.
///
/// Tasks are executed in submission order by whichever worker is free. A task that panics
/// is logged and does not take its worker down.
///
/// # Lifetime
///
/// When the pool is dropped:
/// 1. All worker threads are signaled to shut down.
/// 2. The drop blocks until all currently-executing tasks complete.
/// 3. Any queued tasks that have not started are abandoned, as is anything submitted later.
///
/// Schedulers obtained from the pool stay valid after the drop; their tasks are
/// simply discarded.
///
/// # Example
///
/// ```rust
/// use dataflow::Pool;
///
/// let pool = Pool::new();
/// let scheduler = pool.scheduler();
///
/// let answer = scheduler.spawn(|| 42);
/// assert_eq!(answer.get().unwrap(), 42);
/// ```
#[derive(Debug)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Creates a new pool with default settings.
    ///
    /// Use [`Pool::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the pool.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Returns a scheduler that submits tasks to this pool.
    ///
    /// The scheduler can be cloned and shared across threads.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::from_shared(Arc::<PoolInner>::clone(&self.inner))
    }

    /// Number of worker threads in the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.worker_handles.lock().len()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.shut_down();
    }
}

/// Builder for configuring a [`Pool`].
#[derive(Debug)]
pub struct PoolBuilder {
    worker_count: Option<NonZero<usize>>,
    thread_name_prefix: String,
}

impl PoolBuilder {
    fn new() -> Self {
        Self {
            worker_count: None,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_owned(),
        }
    }

    /// Sets the number of worker threads.
    ///
    /// Default is the available parallelism of the machine.
    #[must_use]
    pub fn worker_count(mut self, count: NonZero<usize>) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Sets the prefix of worker thread names. Workers are named `{prefix}-{index}`.
    ///
    /// Default is `dataflow-worker`.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Builds the pool and starts its worker threads.
    #[must_use]
    pub fn build(self) -> Pool {
        let worker_count = self
            .worker_count
            .unwrap_or_else(|| thread::available_parallelism().unwrap_or(NonZero::<usize>::MIN));

        let inner = Arc::new(PoolInner {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            work_available: Condvar::new(),
            worker_handles: Mutex::new(Vec::with_capacity(worker_count.get())),
        });

        let mut handles = Vec::with_capacity(worker_count.get());

        for worker_index in 0..worker_count.get() {
            let inner_clone = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("{}-{worker_index}", self.thread_name_prefix))
                .spawn(move || {
                    debug!(worker_index, "worker thread started");
                    worker_loop(&inner_clone, worker_index);
                    debug!(worker_index, "worker thread exiting");
                })
                .expect("failed to spawn worker thread: thread spawning failure is not supported");

            handles.push(handle);
        }

        inner.worker_handles.lock().extend(handles);

        Pool { inner }
    }
}

//! Helpers shared by the unit tests of this crate.

use std::collections::VecDeque;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;

use futures::task::{self as futures_task, ArcWake};
use parking_lot::Mutex;

use crate::{Pool, Scheduler, Task};

/// An executor that only runs tasks when the test asks it to.
#[derive(Clone, Default)]
pub(crate) struct ManualExecutor {
    queue: Arc<Mutex<VecDeque<Task>>>,
}

impl ManualExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn scheduler(&self) -> Scheduler {
        let queue = Arc::clone(&self.queue);
        Scheduler::new(move |task: Task| queue.lock().push_back(task))
    }

    /// Runs queued tasks, including ones they submit, until the queue is empty.
    /// Returns how many tasks ran.
    pub(crate) fn run_all(&self) -> usize {
        let mut count = 0_usize;

        loop {
            let next = self.queue.lock().pop_front();
            let Some(task) = next else {
                return count;
            };

            task();
            count = count.wrapping_add(1);
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

struct FlagWaker(Arc<AtomicBool>);

impl ArcWake for FlagWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::Release);
    }
}

/// A waker that raises a flag when woken.
pub(crate) fn flag_waker() -> (Waker, Arc<AtomicBool>) {
    let flag = Arc::new(AtomicBool::new(false));
    let waker = futures_task::waker(Arc::new(FlagWaker(Arc::clone(&flag))));
    (waker, flag)
}

pub(crate) fn test_pool() -> Pool {
    Pool::builder()
        .worker_count(NonZero::new(4).expect("4 is not zero"))
        .build()
}

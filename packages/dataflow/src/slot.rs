//! The write-once state machine shared by every cell flavor.
//!
//! A slot holds the bound outcome, the ordered list of parties waiting for it and,
//! for rendezvous cells, the barrier that holds the writer and its readers until
//! enough readers have arrived.

use std::mem;
use std::task::Waker;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::{Outcome, Scheduler};

pub(crate) type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

enum Waiter<T> {
    Callback {
        scheduler: Scheduler,
        callback: Callback<T>,
        // Whether delivering this callback counts as a reader arriving at the rendezvous.
        arrives: bool,
    },
    Waker(Waker),
}

struct Rendezvous {
    parties: usize,
    arrived: usize,
    released: bool,
    wakers: Vec<Waker>,
}

struct State<T> {
    outcome: Option<Outcome<T>>,
    waiters: Vec<Waiter<T>>,
    rendezvous: Option<Rendezvous>,
}

impl<T> State<T> {
    fn is_released(&self) -> bool {
        self.rendezvous.as_ref().is_none_or(|r| r.released)
    }

    /// Opens the barrier if the value is bound and enough readers have arrived.
    /// Returns the async waiters to wake if the barrier opened.
    #[must_use]
    fn try_release(&mut self) -> Option<Vec<Waker>> {
        let bound = self.outcome.is_some();
        let rendezvous = self.rendezvous.as_mut()?;

        if rendezvous.released || !bound || rendezvous.arrived < rendezvous.parties {
            return None;
        }

        rendezvous.released = true;
        Some(mem::take(&mut rendezvous.wakers))
    }

    #[must_use]
    fn arrive(&mut self) -> Option<Vec<Waker>> {
        if let Some(rendezvous) = self.rendezvous.as_mut() {
            rendezvous.arrived = rendezvous.arrived.saturating_add(1);
        }

        self.try_release()
    }

    fn withdraw(&mut self) {
        if let Some(rendezvous) = self.rendezvous.as_mut().filter(|r| !r.released) {
            rendezvous.arrived = rendezvous.arrived.saturating_sub(1);
        }
    }

    fn register_waker(&mut self, waker: &Waker) {
        let already = self.waiters.iter().any(|waiter| match waiter {
            Waiter::Waker(existing) => existing.will_wake(waker),
            Waiter::Callback { .. } => false,
        });

        if !already {
            self.waiters.push(Waiter::Waker(waker.clone()));
        }
    }
}

pub(crate) struct Slot<T> {
    state: Mutex<State<T>>,
    bound: Condvar,
    released: Condvar,
}

impl<T> Slot<T> {
    /// A plain single-assignment slot.
    pub(crate) fn new() -> Self {
        Self::with_rendezvous(None)
    }

    /// A slot whose writer and readers meet at a barrier of `parties` readers.
    pub(crate) fn with_parties(parties: usize) -> Self {
        Self::with_rendezvous(Some(Rendezvous {
            parties,
            arrived: 0,
            released: false,
            wakers: Vec::new(),
        }))
    }

    fn with_rendezvous(rendezvous: Option<Rendezvous>) -> Self {
        Self {
            state: Mutex::new(State {
                outcome: None,
                waiters: Vec::new(),
                rendezvous,
            }),
            bound: Condvar::new(),
            released: Condvar::new(),
        }
    }

    fn finish_release(&self, wakers: Option<Vec<Waker>>) {
        if let Some(wakers) = wakers {
            trace!("rendezvous released");
            self.released.notify_all();

            for waker in wakers {
                waker.wake();
            }
        }
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    pub(crate) fn is_error(&self) -> bool {
        matches!(self.state.lock().outcome, Some(Err(_)))
    }

    pub(crate) fn describe(&self) -> &'static str {
        match self.state.lock().outcome {
            None => "unbound",
            Some(Ok(_)) => "bound",
            Some(Err(_)) => "failed",
        }
    }

    /// Blocks until bound, without reading the outcome or arriving at the rendezvous.
    pub(crate) fn join(&self) {
        let mut state = self.state.lock();
        self.bound.wait_while(&mut state, |state| state.outcome.is_none());
    }

    /// Like [`Self::join`], giving up at the deadline. Returns whether the slot is bound.
    pub(crate) fn join_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.join();
            return true;
        };

        let mut state = self.state.lock();
        self.bound
            .wait_while_until(&mut state, |state| state.outcome.is_none(), deadline);
        state.outcome.is_some()
    }

    /// Blocks until the rendezvous has been released. Returns at once for plain slots.
    #[cfg_attr(test, mutants::skip)] // Mutations only turn the wait into a hang.
    pub(crate) fn await_release(&self) {
        let mut state = self.state.lock();
        self.released.wait_while(&mut state, |state| !state.is_released());
    }

    /// Withdraws an arrival that was recorded by an abandoned reader.
    pub(crate) fn withdraw_arrival(&self) {
        self.state.lock().withdraw();
    }

    /// Removes a waker registered by [`Self::poll_or_register`].
    pub(crate) fn cancel_waker(&self, waker: &Waker) {
        self.state.lock().waiters.retain(|waiter| match waiter {
            Waiter::Waker(existing) => !existing.will_wake(waker),
            Waiter::Callback { .. } => true,
        });
    }

    /// Raises the number of readers the rendezvous waits for.
    ///
    /// Returns `false` if the rendezvous has already been released, in which case the
    /// new party would never be counted.
    pub(crate) fn increment_parties(&self) -> bool {
        let mut state = self.state.lock();

        match state.rendezvous.as_mut() {
            Some(rendezvous) if !rendezvous.released => {
                rendezvous.parties = rendezvous.parties.saturating_add(1);
                true
            }
            _ => false,
        }
    }

    /// Lowers the number of readers the rendezvous waits for, never below zero.
    ///
    /// If the readers already present now suffice, the rendezvous is released.
    pub(crate) fn decrement_parties(&self) {
        let mut state = self.state.lock();

        if let Some(rendezvous) = state.rendezvous.as_mut() {
            rendezvous.parties = rendezvous.parties.saturating_sub(1);
        }

        let release = state.try_release();
        drop(state);

        self.finish_release(release);
    }

    pub(crate) fn parties(&self) -> usize {
        self.state.lock().rendezvous.as_ref().map_or(0, |r| r.parties)
    }

    /// Number of readers that still have to arrive before the rendezvous is released.
    pub(crate) fn awaiting_parties(&self) -> usize {
        self.state
            .lock()
            .rendezvous
            .as_ref()
            .filter(|r| !r.released)
            .map_or(0, |r| r.parties.saturating_sub(r.arrived))
    }
}

impl<T> Slot<T>
where
    T: Clone + Send + 'static,
{
    /// Binds the outcome and schedules everything that was waiting for it.
    ///
    /// Returns the rejected outcome if the slot was already bound. Does not wait for
    /// the rendezvous; writers that take part in it call [`Self::await_release`].
    pub(crate) fn publish(&self, outcome: Outcome<T>) -> Result<(), Outcome<T>> {
        let mut state = self.state.lock();

        if state.outcome.is_some() {
            return Err(outcome);
        }

        let waiters = mem::take(&mut state.waiters);

        if let Some(rendezvous) = state.rendezvous.as_mut() {
            let arriving = waiters
                .iter()
                .filter(|waiter| matches!(waiter, Waiter::Callback { arrives: true, .. }))
                .count();
            rendezvous.arrived = rendezvous.arrived.saturating_add(arriving);
        }

        state.outcome = Some(outcome.clone());
        let release = state.try_release();
        drop(state);

        self.bound.notify_all();
        self.finish_release(release);

        for waiter in waiters {
            match waiter {
                Waiter::Callback {
                    scheduler,
                    callback,
                    ..
                } => {
                    let outcome = outcome.clone();
                    scheduler.submit(move || callback(outcome));
                }
                Waiter::Waker(waker) => waker.wake(),
            }
        }

        Ok(())
    }

    /// Blocks until bound, then takes part in the rendezvous if there is one.
    pub(crate) fn get(&self) -> Outcome<T> {
        let mut state = self.state.lock();
        let outcome = self.wait_bound(&mut state);

        if state.rendezvous.is_some() {
            let release = state.arrive();
            MutexGuard::unlocked(&mut state, || self.finish_release(release));
            self.released
                .wait_while(&mut state, |state| !state.is_released());
        }

        outcome
    }

    /// Like [`Self::get`] but gives up at the deadline.
    ///
    /// The wait for the bind is checked first and records no arrival when it expires.
    /// A reader that times out at the rendezvous withdraws its arrival again.
    pub(crate) fn get_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.get());
        };

        let mut state = self.state.lock();

        let outcome = loop {
            if let Some(outcome) = &state.outcome {
                break outcome.clone();
            }

            if self.bound.wait_until(&mut state, deadline).timed_out() && state.outcome.is_none() {
                return None;
            }
        };

        if state.rendezvous.is_some() {
            let release = state.arrive();
            MutexGuard::unlocked(&mut state, || self.finish_release(release));

            while !state.is_released() {
                if self.released.wait_until(&mut state, deadline).timed_out()
                    && !state.is_released()
                {
                    state.withdraw();
                    trace!("rendezvous wait timed out, arrival withdrawn");
                    return None;
                }
            }
        }

        Some(outcome)
    }

    /// Returns the outcome if bound, without taking part in any rendezvous.
    pub(crate) fn peek(&self) -> Option<Outcome<T>> {
        self.state.lock().outcome.clone()
    }

    /// Returns the outcome if bound, arriving at the rendezvous without waiting for it.
    pub(crate) fn take_ready(&self) -> Option<Outcome<T>> {
        let mut state = self.state.lock();
        let outcome = state.outcome.clone()?;

        let release = state.arrive();
        MutexGuard::unlocked(&mut state, || self.finish_release(release));

        Some(outcome)
    }

    /// Like [`Self::take_ready`], but registers `waker` to be woken on bind if unbound.
    pub(crate) fn poll_or_register(&self, waker: &Waker) -> Option<Outcome<T>> {
        let mut state = self.state.lock();

        let Some(outcome) = state.outcome.clone() else {
            state.register_waker(waker);
            return None;
        };

        let release = state.arrive();
        MutexGuard::unlocked(&mut state, || self.finish_release(release));

        Some(outcome)
    }

    /// Polls on behalf of a future, which arrives at the rendezvous once and then waits
    /// for its release without blocking.
    pub(crate) fn poll_future(&self, waker: &Waker, arrived: &mut bool) -> Option<Outcome<T>> {
        let mut state = self.state.lock();

        let Some(outcome) = state.outcome.clone() else {
            state.register_waker(waker);
            return None;
        };

        if !*arrived && state.rendezvous.is_some() {
            *arrived = true;
            let release = state.arrive();
            MutexGuard::unlocked(&mut state, || self.finish_release(release));
        }

        if state.is_released() {
            return Some(outcome);
        }

        if let Some(rendezvous) = state.rendezvous.as_mut() {
            if !rendezvous.wakers.iter().any(|w| w.will_wake(waker)) {
                rendezvous.wakers.push(waker.clone());
            }
        }

        None
    }

    /// Schedules `callback` on `scheduler` once bound, immediately if already bound.
    ///
    /// The callback never runs inline on the calling thread.
    pub(crate) fn add_callback(&self, scheduler: &Scheduler, callback: Callback<T>, arrives: bool) {
        let mut state = self.state.lock();

        let Some(outcome) = state.outcome.clone() else {
            state.waiters.push(Waiter::Callback {
                scheduler: scheduler.clone(),
                callback,
                arrives,
            });
            return;
        };

        let release = if arrives { state.arrive() } else { None };
        drop(state);

        self.finish_release(release);
        scheduler.submit(move || callback(outcome));
    }

    fn wait_bound(&self, state: &mut MutexGuard<'_, State<T>>) -> Outcome<T> {
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }

            self.bound.wait(state);
        }
    }
}

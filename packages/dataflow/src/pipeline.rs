//! Composition helpers that connect channels into processing networks.
//!
//! Every stage keeps exactly one outstanding read on its input and registers the next
//! read only after the current value has been handled, so values leave a stage in the
//! order they entered it. Failures read from an input are passed on to every output
//! of the stage; a panic in a stage function is turned into a failure on its outputs.
//!
//! Stages run until the process ends. Channels have no close operation, so there is
//! no end-of-stream for a stage to react to.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    Cell, Channel, Failure, Outcome, ReadChannel, Scheduler, WriteChannel, run_guarded,
    when_all_bound,
};

/// Reads `source` forever, handing every outcome to `step` on `scheduler`.
fn pump<T, F>(scheduler: Scheduler, source: Arc<dyn ReadChannel<T>>, mut step: F)
where
    T: Send + 'static,
    F: FnMut(Outcome<T>) + Send + 'static,
{
    let next_scheduler = scheduler.clone();
    let next_source = Arc::clone(&source);

    source.get_async(
        &scheduler,
        Box::new(move |outcome| {
            step(outcome);
            pump(next_scheduler, next_source, step);
        }),
    );
}

fn deliver<T>(output: &impl WriteChannel<T>, outcome: Outcome<T>) {
    match outcome {
        Ok(value) => output.send(value),
        Err(failure) => output.send_failure(failure),
    }
}

fn deliver_all<T>(outputs: &[Channel<T>], outcome: &Outcome<T>)
where
    T: Clone + Send + 'static,
{
    for output in outputs {
        deliver(output, outcome.clone());
    }
}

impl<T> Channel<T>
where
    T: Clone + Send + 'static,
{
    fn as_source(&self) -> Arc<dyn ReadChannel<T>> {
        Arc::new(self.clone())
    }

    /// Returns a channel that receives `f(value)` for every value read from this one.
    ///
    /// # Example
    ///
    /// ```rust
    /// use dataflow::{Channel, Pool};
    ///
    /// let pool = Pool::new();
    /// let input = Channel::new();
    /// let lengths = input.map(&pool.scheduler(), |word: &str| word.len());
    ///
    /// input.send("four");
    /// assert_eq!(lengths.receive().unwrap(), 4);
    /// ```
    #[must_use]
    pub fn map<U, F>(&self, scheduler: &Scheduler, mut f: F) -> Channel<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let output = Channel::new();
        let target = output.clone();

        pump(scheduler.clone(), self.as_source(), move |outcome| {
            deliver(&target, outcome.and_then(|value| run_guarded(|| f(value))));
        });

        output
    }

    /// Returns a channel that receives the values read from this one for which
    /// `predicate` holds. Failures are always passed on.
    #[must_use]
    pub fn filter<F>(&self, scheduler: &Scheduler, mut predicate: F) -> Self
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        let output = Self::new();
        let target = output.clone();

        pump(scheduler.clone(), self.as_source(), move |outcome| {
            let keep = match &outcome {
                Ok(value) => run_guarded(|| predicate(value)),
                Err(failure) => Err(failure.clone()),
            };

            match keep {
                Ok(true) => deliver(&target, outcome),
                Ok(false) => trace!("filter dropped a value"),
                Err(failure) => target.send_failure(failure),
            }
        });

        output
    }

    /// Moves every value read from this channel into `target`.
    pub fn forward_to(&self, scheduler: &Scheduler, target: &Self) {
        let target = target.clone();

        pump(scheduler.clone(), self.as_source(), move |outcome| {
            deliver(&target, outcome);
        });
    }

    /// Copies every value read from this channel into each of `outputs`.
    pub fn split(&self, scheduler: &Scheduler, outputs: &[Self]) {
        let outputs: Arc<[Self]> = outputs.into();

        pump(scheduler.clone(), self.as_source(), move |outcome| {
            deliver_all(&outputs, &outcome);
        });
    }

    /// Returns a channel that receives every value read from this one, after a copy of
    /// the value has been written to `side`.
    #[must_use]
    pub fn tap(&self, scheduler: &Scheduler, side: &Self) -> Self {
        let output = Self::new();
        let outputs: Arc<[Self]> = Arc::new([side.clone(), output.clone()]);

        pump(scheduler.clone(), self.as_source(), move |outcome| {
            deliver_all(&outputs, &outcome);
        });

        output
    }

    /// Writes each value read from this channel to `left` if `chooser` returns `true`
    /// for it and to `right` otherwise. Failures go to both.
    pub fn binary_choice<F>(&self, scheduler: &Scheduler, left: &Self, right: &Self, mut chooser: F)
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        let outputs: Arc<[Self]> = Arc::new([left.clone(), right.clone()]);

        pump(scheduler.clone(), self.as_source(), move |outcome| {
            let choice = match &outcome {
                Ok(value) => run_guarded(|| chooser(value)).map(|to_left| usize::from(!to_left)),
                Err(failure) => Err(failure.clone()),
            };

            route(&outputs, outcome, choice);
        });
    }

    /// Writes each value read from this channel to the output whose index `chooser`
    /// returns for it.
    ///
    /// An index past the end of `outputs` is reported as a failure on every output,
    /// as are failures read from this channel.
    pub fn choice<F>(&self, scheduler: &Scheduler, outputs: &[Self], mut chooser: F)
    where
        F: FnMut(&T) -> usize + Send + 'static,
    {
        let outputs: Arc<[Self]> = outputs.into();

        pump(scheduler.clone(), self.as_source(), move |outcome| {
            let choice = match &outcome {
                Ok(value) => run_guarded(|| chooser(value)),
                Err(failure) => Err(failure.clone()),
            };

            route(&outputs, outcome, choice);
        });
    }

    /// Returns a channel that receives `f` applied to one value from each of `inputs`,
    /// in input order, for as long as every input keeps producing values.
    ///
    /// A failure from any input takes the place of the combined value for that round.
    ///
    /// # Panics
    ///
    /// Panics if `inputs` is empty, since there would be no round to wait for.
    ///
    /// # Example
    ///
    /// ```rust
    /// use dataflow::{Channel, Pool};
    ///
    /// let pool = Pool::new();
    /// let a = Channel::new();
    /// let b = Channel::new();
    /// let sums = Channel::merge(&pool.scheduler(), &[a.clone(), b.clone()], |values: Vec<u32>| {
    ///     values.iter().sum::<u32>()
    /// });
    ///
    /// a.send(1);
    /// b.send(2);
    /// assert_eq!(sums.receive().unwrap(), 3);
    /// ```
    #[must_use]
    pub fn merge<U, F>(scheduler: &Scheduler, inputs: &[Self], f: F) -> Channel<U>
    where
        U: Clone + Send + 'static,
        F: FnMut(Vec<T>) -> U + Send + 'static,
    {
        assert!(!inputs.is_empty(), "a merge needs at least one input");

        let output = Channel::new();

        merge_round(
            scheduler.clone(),
            inputs.into(),
            output.clone(),
            Arc::new(Mutex::new(f)),
        );

        output
    }
}

fn route<T>(outputs: &[Channel<T>], outcome: Outcome<T>, choice: Outcome<usize>)
where
    T: Clone + Send + 'static,
{
    match choice {
        Ok(index) => match outputs.get(index) {
            Some(output) => deliver(output, outcome),
            None => deliver_all(
                outputs,
                &Err(Failure::msg(format!(
                    "choice selected output {index} of {}",
                    outputs.len()
                ))),
            ),
        },
        Err(failure) => deliver_all(outputs, &Err(failure)),
    }
}

/// Reads one value from every input, combines them and starts the next round once the
/// combined value has been written.
fn merge_round<T, U, F>(
    scheduler: Scheduler,
    inputs: Arc<[Channel<T>]>,
    output: Channel<U>,
    f: Arc<Mutex<F>>,
) where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnMut(Vec<T>) -> U + Send + 'static,
{
    let cells: Vec<Cell<T>> = inputs
        .iter()
        .map(|input| {
            let cell = Cell::new();
            let target = cell.clone();
            input.receive_async(&scheduler, move |outcome| target.bind_outcome(outcome));
            cell
        })
        .collect();

    let combiner = Arc::clone(&f);
    let combined = when_all_bound(&scheduler, &cells, move |values| {
        let mut combine = combiner.lock();
        (*combine)(values)
    });

    let next_scheduler = scheduler.clone();
    combined.get_async(&scheduler, move |outcome| {
        deliver(&output, outcome);
        merge_round(next_scheduler, inputs, output, f);
    });
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::test_utils::ManualExecutor;

    fn drain<T>(channel: &Channel<T>) -> Vec<Outcome<T>>
    where
        T: Clone + Send + 'static,
    {
        let mut values = Vec::new();
        while let Some(outcome) = channel.try_receive() {
            values.push(outcome);
        }
        values
    }

    fn values<T>(channel: &Channel<T>) -> Vec<T>
    where
        T: Clone + Send + 'static,
    {
        drain(channel)
            .into_iter()
            .map(|outcome| outcome.unwrap())
            .collect()
    }

    #[test]
    fn map_preserves_order() {
        let executor = ManualExecutor::new();
        let input = Channel::new();
        let output = input.map(&executor.scheduler(), |x: u32| x * 10);

        for value in 1..=3 {
            input.send(value);
        }
        executor.run_all();

        assert_eq!(values(&output), vec![10, 20, 30]);
    }

    #[test]
    fn map_turns_panic_into_failure_and_keeps_going() {
        let executor = ManualExecutor::new();
        let input = Channel::new();
        let output = input.map(&executor.scheduler(), |x: u32| {
            assert_ne!(x, 2, "two is not allowed");
            x
        });

        for value in 1..=3 {
            input.send(value);
        }
        executor.run_all();

        let outcomes = drain(&output);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[1].as_ref().unwrap_err().is_panic());
        assert_eq!(*outcomes[2].as_ref().unwrap(), 3);
    }

    #[test]
    fn filter_drops_values_but_not_failures() {
        let executor = ManualExecutor::new();
        let input = Channel::new();
        let output = input.filter(&executor.scheduler(), |x: &u32| x % 2 == 0);

        input.send(1);
        input.send(2);
        input.send_failure(Failure::msg("bad"));
        input.send(4);
        executor.run_all();

        let outcomes = drain(&output);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(*outcomes[0].as_ref().unwrap(), 2);
        assert!(outcomes[1].is_err());
        assert_eq!(*outcomes[2].as_ref().unwrap(), 4);
    }

    #[test]
    fn split_and_tap_copy_values() {
        let executor = ManualExecutor::new();
        let scheduler = executor.scheduler();
        let input = Channel::new();
        let first = Channel::new();
        let second = Channel::new();
        input.split(&scheduler, &[first.clone(), second.clone()]);

        let side = Channel::new();
        let tapped = first.tap(&scheduler, &side);

        input.send("x");
        executor.run_all();

        assert_eq!(values(&second), vec!["x"]);
        assert_eq!(values(&side), vec!["x"]);
        assert_eq!(values(&tapped), vec!["x"]);
    }

    #[test]
    fn forward_to_moves_values() {
        let executor = ManualExecutor::new();
        let input = Channel::new();
        let target = Channel::new();
        input.forward_to(&executor.scheduler(), &target);

        input.send(1);
        input.send(2);
        executor.run_all();

        assert_eq!(values(&target), vec![1, 2]);
        assert!(input.is_empty());
    }

    #[test]
    fn binary_choice_routes_by_predicate() {
        let executor = ManualExecutor::new();
        let input = Channel::new();
        let small = Channel::new();
        let large = Channel::new();
        input.binary_choice(&executor.scheduler(), &small, &large, |x: &u32| *x < 10);

        for value in [5, 50, 7] {
            input.send(value);
        }
        executor.run_all();

        assert_eq!(values(&small), vec![5, 7]);
        assert_eq!(values(&large), vec![50]);
    }

    #[test]
    fn choice_out_of_range_fails_every_output() {
        let executor = ManualExecutor::new();
        let input = Channel::new();
        let outputs = [Channel::new(), Channel::new()];
        input.choice(&executor.scheduler(), &outputs, |x: &usize| *x);

        input.send(1);
        input.send(9);
        executor.run_all();

        let first = drain(&outputs[0]);
        let second = drain(&outputs[1]);
        assert_eq!(first.len(), 1);
        assert!(first[0].is_err());
        assert_eq!(second.len(), 2);
        assert_eq!(*second[0].as_ref().unwrap(), 1);
        assert!(second[1].is_err());
    }

    #[test]
    fn merge_combines_rounds_in_order() {
        let executor = ManualExecutor::new();
        let a = Channel::new();
        let b = Channel::new();
        let merged = Channel::merge(&executor.scheduler(), &[a.clone(), b.clone()], |values: Vec<u32>| {
            values.iter().sum::<u32>()
        });

        a.send(1);
        a.send(10);
        b.send(2);
        b.send(20);
        executor.run_all();

        assert_eq!(values(&merged), vec![3, 30]);
    }

    #[test]
    #[should_panic(expected = "a merge needs at least one input")]
    fn merge_of_no_inputs_is_rejected() {
        let executor = ManualExecutor::new();

        drop(Channel::<u32>::merge(&executor.scheduler(), &[], |values| values.len()));
    }
}

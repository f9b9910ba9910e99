//! End-to-end scenarios that combine several dataflow primitives on a real thread pool.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dataflow::{
    Broadcast, Cell, Channel, Error, Failure, LazyCell, Pool, ReadChannel, Select, SyncCell,
    create_timeout, when_all_bound,
};
use testing::{Collector, with_watchdog};

#[test]
#[cfg_attr(miri, ignore)] // Thread pools are too slow under Miri.
fn chained_cell_doubles_bound_value() {
    with_watchdog(|| {
        let pool = Pool::new();
        let scheduler = pool.scheduler();

        let input = Cell::new();
        let result = input.then(&scheduler, |x: i32| x * 2);

        input.bind(21);

        assert_eq!(result.get().unwrap(), 42);
    });
}

#[test]
fn channel_hands_value_to_concurrent_receiver() {
    with_watchdog(|| {
        let channel = Channel::<String>::new();

        let receiver = {
            let channel = channel.clone();
            thread::spawn(move || channel.receive().unwrap())
        };

        channel.send("hello".to_owned());

        assert_eq!(receiver.join().unwrap(), "hello");
    });
}

#[test]
fn priority_select_returns_first_ready_source() {
    with_watchdog(|| {
        let a = Channel::new();
        let b = Channel::new();
        let c = Channel::new();

        c.send('c');
        b.send('b');
        a.send('a');

        let sources: Vec<Arc<dyn ReadChannel<char>>> =
            vec![Arc::new(a.clone()), Arc::new(b.clone()), Arc::new(c.clone())];
        let result = Select::new(sources).priority_select();

        assert_eq!(result.index, 0);
        assert_eq!(result.value.unwrap(), 'a');
        assert_eq!(b.len() + c.len(), 2);
    });
}

#[test]
fn single_assignment_keeps_first_value() {
    let cell = Cell::new();

    cell.bind("first");
    cell.bind("second");
    assert!(matches!(cell.bind_unique("third"), Err(Error::AlreadyBound)));

    assert_eq!(cell.get().unwrap(), "first");
}

#[test]
#[cfg_attr(miri, ignore)] // Thread pools are too slow under Miri.
fn failure_flows_through_chain_until_handled() {
    with_watchdog(|| {
        let pool = Pool::new();
        let scheduler = pool.scheduler();

        let input = Cell::<u32>::new();
        let doubled = input.then(&scheduler, |x| x * 2);
        let recovered = doubled.then_or_else(&scheduler, |x| x, |_| 0);

        input.bind_error(Failure::msg("sensor offline"));

        assert_eq!(doubled.get().unwrap_err().to_string(), "sensor offline");
        assert_eq!(recovered.get().unwrap(), 0);
    });
}

#[test]
#[cfg_attr(miri, ignore)] // Thread pools are too slow under Miri.
fn tasks_combine_with_when_all_bound() {
    with_watchdog(|| {
        let pool = Pool::new();
        let scheduler = pool.scheduler();

        let parts: Vec<Cell<u64>> = (1..=4_u64)
            .map(|part| scheduler.spawn(move || part * 100))
            .collect();

        let total = when_all_bound(&scheduler, &parts, |values| values.iter().sum::<u64>());

        assert_eq!(total.get().unwrap(), 1000);
    });
}

#[test]
fn sync_cell_releases_writer_after_every_reader() {
    with_watchdog(|| {
        let cell = SyncCell::new(2);

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let cell = cell.clone();
                thread::spawn(move || cell.get().unwrap())
            })
            .collect();

        cell.bind(5);

        for reader in readers {
            assert_eq!(reader.join().unwrap(), 5);
        }
        assert_eq!(cell.awaiting_parties(), 0);
    });
}

#[test]
#[cfg_attr(miri, ignore)] // Thread pools are too slow under Miri.
fn broadcast_feeds_pipeline_per_subscriber() {
    with_watchdog(|| {
        let pool = Pool::new();
        let scheduler = pool.scheduler();
        let broadcast = Broadcast::new();

        let evens = Collector::new();
        let all = Collector::new();

        let even_subscription = broadcast.subscribe();
        let all_subscription = broadcast.subscribe();

        {
            let evens = evens.clone();
            even_subscription.whenever_bound(&scheduler, move |outcome: dataflow::Outcome<u32>| {
                let value = outcome.unwrap();
                if value % 2 == 0 {
                    evens.push(value);
                }
            });
        }

        for value in 1..=6 {
            broadcast.publish(value);
        }

        for _ in 0..6 {
            all.push(all_subscription.get().unwrap());
        }

        assert_eq!(all.snapshot(), vec![1, 2, 3, 4, 5, 6]);

        let mut evens = evens.wait_for_len(3);
        evens.sort_unstable();
        assert_eq!(evens, vec![2, 4, 6]);
    });
}

#[test]
#[cfg_attr(miri, ignore)] // Thread pools are too slow under Miri.
fn pipeline_maps_and_filters_in_order() {
    with_watchdog(|| {
        let pool = Pool::new();
        let scheduler = pool.scheduler();

        let input = Channel::new();
        let output = input
            .map(&scheduler, |x: u32| x * 3)
            .filter(&scheduler, |x| x % 2 == 1);

        for value in 0..10 {
            input.send(value);
        }

        let received: Vec<u32> = (0..5).map(|_| output.receive().unwrap()).collect();
        assert_eq!(received, vec![3, 9, 15, 21, 27]);
    });
}

#[test]
fn select_times_out_on_quiet_channels() {
    with_watchdog(|| {
        let quiet = Channel::<&str>::new();
        let sources: Vec<Arc<dyn ReadChannel<&str>>> = vec![
            Arc::new(quiet.clone()),
            Arc::new(create_timeout(Duration::from_millis(20), "timeout")),
        ];

        let result = Select::new(sources).select();

        assert_eq!(result.index, 1);
        assert_eq!(result.value.unwrap(), "timeout");

        // The abandoned registration does not swallow later writes.
        quiet.send("late");
        assert_eq!(quiet.receive().unwrap(), "late");
    });
}

#[test]
#[cfg_attr(miri, ignore)] // Thread pools are too slow under Miri.
fn lazy_cell_feeds_chain() {
    with_watchdog(|| {
        let pool = Pool::new();
        let scheduler = pool.scheduler();

        let settings = LazyCell::new(&scheduler, || vec!["a", "b", "c"]);
        let count = settings.then(&scheduler, |settings| settings.len());

        assert_eq!(count.get().unwrap(), 3);
    });
}

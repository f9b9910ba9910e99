//! Walks through cells, channels, rendezvous cells and select.
//!
//! Run with: `cargo run --example dataflow_basics`.
//! Set a lower level than `DEBUG` below to silence the library's lifecycle logging.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dataflow::{Cell, Channel, Pool, ReadChannel, Select, SyncCell, create_timeout};
use tracing_subscriber::filter::LevelFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .init();

    let pool = Pool::builder().thread_name_prefix("example").build();
    let scheduler = pool.scheduler();

    println!("=== Cells ===");
    let input = Cell::new();
    let doubled = input.then(&scheduler, |x: i32| x.saturating_mul(2));
    let described = doubled.then(&scheduler, |x| format!("the answer is {x}"));
    input.bind(21);
    println!("{}", described.get().expect("no failure was bound"));

    println!();
    println!("=== Channels ===");
    let channel = Channel::new();
    let producer = {
        let channel = channel.clone();
        thread::spawn(move || {
            for word in ["dataflow", "values", "arrive", "in", "order"] {
                channel.send(word);
            }
        })
    };
    for _ in 0..5 {
        println!("received {}", channel.receive().expect("no failure was sent"));
    }
    producer.join().expect("producer thread does not panic");

    println!();
    println!("=== Rendezvous ===");
    let meeting = SyncCell::new(2);
    let guests: Vec<_> = (1..=2)
        .map(|guest| {
            let meeting = meeting.clone();
            thread::spawn(move || {
                let place = meeting.get().expect("no failure was bound");
                println!("guest {guest} met at {place}");
            })
        })
        .collect();
    meeting.bind("the station");
    println!("host released after every guest arrived");
    for guest in guests {
        guest.join().expect("guest thread does not panic");
    }

    println!();
    println!("=== Select ===");
    let quiet = Channel::<&str>::new();
    let busy = Channel::new();
    busy.send("busy channel won");
    let sources: Vec<Arc<dyn ReadChannel<&str>>> = vec![
        Arc::new(quiet.clone()),
        Arc::new(busy.clone()),
        Arc::new(create_timeout(Duration::from_millis(50), "timed out")),
    ];
    let select = Select::new(sources);
    for _ in 0..2 {
        let result = select.priority_select();
        println!(
            "source {} -> {}",
            result.index,
            result.value.expect("no failure was sent")
        );
    }
}

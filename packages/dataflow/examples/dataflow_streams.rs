//! Feeds a broadcast stream into per-subscriber pipelines and a lazily loaded lookup table.
//!
//! Run with: `cargo run --example dataflow_streams`.

use std::thread;

use dataflow::{Broadcast, Channel, LazyCell, Pool};
use tracing_subscriber::filter::LevelFilter;

const READINGS: [u32; 6] = [12, 48, 7, 90, 33, 61];

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::INFO)
        .init();

    let pool = Pool::new();
    let scheduler = pool.scheduler();

    let labels = LazyCell::new(&scheduler, || {
        println!("loading labels (happens once)");
        ("normal", "ALERT")
    });

    let sensor = Broadcast::new();
    let for_alerts = sensor.subscribe();
    let for_log = sensor.subscribe();

    let raw = Channel::new();
    let high = Channel::new();
    let low = Channel::new();
    raw.binary_choice(&scheduler, &high, &low, |reading: &u32| *reading > 50);

    let forwarder = {
        thread::spawn(move || {
            for _ in READINGS {
                raw.send(for_alerts.get().expect("sensor never fails"));
            }
        })
    };

    for reading in READINGS {
        sensor.publish(reading);
    }

    for _ in READINGS {
        println!("log: reading {}", for_log.get().expect("sensor never fails"));
    }
    forwarder.join().expect("forwarder thread does not panic");

    let (normal, alert) = labels.get().expect("labels always load");
    let high_count = READINGS.iter().filter(|reading| **reading > 50).count();

    for _ in 0..high_count {
        println!("{alert}: {}", high.receive().expect("sensor never fails"));
    }
    for _ in high_count..READINGS.len() {
        println!("{normal}: {}", low.receive().expect("sensor never fails"));
    }
}

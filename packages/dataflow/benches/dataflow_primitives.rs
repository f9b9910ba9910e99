//! Benchmarking the basic operations of cells, channels, select and broadcast streams.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use dataflow::{Broadcast, Cell, Channel, Pool, ReadChannel, Select};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const BATCH: u64 = 1_000;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("dataflow_single_thread");

    group.bench_function("cell_bind_get", |b| {
        b.iter(|| {
            let cell = Cell::new();
            cell.bind(black_box(42_u64));
            black_box(cell.get().unwrap());
        });
    });

    group.bench_function("channel_send_receive_1k", |b| {
        let channel = Channel::new();

        b.iter(|| {
            for value in 0..BATCH {
                channel.send(value);
            }
            for _ in 0..BATCH {
                black_box(channel.receive().unwrap());
            }
        });
    });

    group.bench_function("priority_select_3_sources", |b| {
        let channels = [Channel::new(), Channel::new(), Channel::new()];
        let sources: Vec<Arc<dyn ReadChannel<u64>>> = channels
            .iter()
            .map(|channel| Arc::new(channel.clone()) as Arc<dyn ReadChannel<u64>>)
            .collect();
        let select = Select::new(sources);

        b.iter(|| {
            channels[2].send(black_box(7));
            black_box(select.priority_select());
        });
    });

    group.bench_function("broadcast_publish_1k_to_2", |b| {
        let broadcast = Broadcast::new();
        let first = broadcast.subscribe();
        let second = broadcast.subscribe();

        b.iter(|| {
            for value in 0..BATCH {
                broadcast.publish(value);
            }
            for _ in 0..BATCH {
                black_box(first.get().unwrap());
                black_box(second.get().unwrap());
            }
        });
    });

    group.finish();

    let mut group = c.benchmark_group("dataflow_pool");
    let pool = Pool::new();
    let scheduler = pool.scheduler();

    group.bench_function("then_chain_of_10", |b| {
        b.iter(|| {
            let input = Cell::new();
            let mut current = input.clone();
            for _ in 0..10 {
                current = current.then(&scheduler, |x: u64| x.wrapping_add(1));
            }

            input.bind(black_box(0));
            black_box(current.get().unwrap());
        });
    });

    group.bench_function("pipeline_map_1k", |b| {
        let input = Channel::new();
        let output = input.map(&scheduler, |x: u64| x.wrapping_mul(3));

        b.iter(|| {
            for value in 0..BATCH {
                input.send(value);
            }
            for _ in 0..BATCH {
                black_box(output.receive().unwrap());
            }
        });
    });

    group.finish();
}

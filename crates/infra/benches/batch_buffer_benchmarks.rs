use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::time::Duration;

use courier_core::{BufferedRecord, Event, NewEvent};
use courier_infra::batch::{BatchBuffer, BufferConfig, InMemorySink, RetryPolicy};
use serde_json::json;

fn records(n: usize) -> Vec<BufferedRecord> {
    (0..n)
        .map(|i| {
            let event = Event::create(NewEvent {
                event_type: "page.viewed".to_string(),
                payload: json!({"path": format!("/products/{i}"), "ms": 412}),
                metadata: None,
            })
            .expect("valid event");
            BufferedRecord::snapshot(&event)
        })
        .collect()
}

fn config(threshold: usize) -> BufferConfig {
    BufferConfig {
        threshold,
        poll: RetryPolicy::fixed(3, Duration::ZERO),
    }
}

/// Appends that stay below the threshold: the hot path of every ingest.
fn bench_append_below_threshold(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let rows = records(1_000);

    let mut group = c.benchmark_group("append_below_threshold");
    group.throughput(Throughput::Elements(rows.len() as u64));
    group.bench_function("1000_rows", |b| {
        b.iter(|| {
            let buffer = BatchBuffer::new(InMemorySink::new(), config(usize::MAX));
            rt.block_on(async {
                for row in &rows {
                    black_box(buffer.append(row.clone()).await);
                }
            });
        });
    });
    group.finish();
}

/// Appends including threshold flushes through the NDJSON artifact.
fn bench_append_with_flushes(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let rows = records(1_000);

    let mut group = c.benchmark_group("append_with_flushes");
    group.sample_size(20);
    group.throughput(Throughput::Elements(rows.len() as u64));

    for threshold in [10usize, 100, 500] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threshold),
            &threshold,
            |b, &threshold| {
                b.iter(|| {
                    let buffer = BatchBuffer::new(InMemorySink::new(), config(threshold));
                    rt.block_on(async {
                        for row in &rows {
                            black_box(buffer.append(row.clone()).await);
                        }
                    });
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_append_below_threshold,
    bench_append_with_flushes
);
criterion_main!(benches);

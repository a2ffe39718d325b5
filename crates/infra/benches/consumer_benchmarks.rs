use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use changefeed_core::{ChangeEvent, JobName, OperationType, StreamName};
use changefeed_events::{InMemoryChangeStream, InMemoryDeadLetterSink, JobError, ScriptedJob};
use changefeed_infra::checkpoint::{CheckpointStore, Checkpointer, InMemoryCheckpointStore};
use changefeed_infra::jobs::EventDispatcher;
use changefeed_infra::retry::RetryPolicy;
use changefeed_infra::workers::{shutdown_channel, StreamConsumer};
use serde_json::json;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn names() -> (StreamName, JobName) {
    (StreamName::new("blog_posts").unwrap(), JobName::new("auditlogs").unwrap())
}

fn seeded_stream(events: usize) -> InMemoryChangeStream {
    let stream = InMemoryChangeStream::new();
    for i in 0..events {
        stream.append(ChangeEvent::new(
            format!("{i}-0"),
            if i % 3 == 0 { OperationType::Insert } else { OperationType::Update },
            json!({"_id": format!("post-{}", i % 50), "title": "benchmark", "rev": i}),
            "blog.blog_posts",
            json!({"_id": format!("post-{}", i % 50)}),
        ));
    }
    stream
}

/// Full consumer pass: dispatch + checkpoint commit per event.
fn bench_consumer_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("consumer_throughput");

    for size in [100usize, 1_000, 5_000] {
        let stream = seeded_stream(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let (stream_name, job_name) = names();
                    let checkpoints = InMemoryCheckpointStore::arc();
                    checkpoints
                        .set(&stream_name, &job_name, &InMemoryChangeStream::position(0))
                        .await
                        .unwrap();
                    let checkpointer =
                        Checkpointer::new(checkpoints, stream_name.clone(), job_name.clone());
                    let dispatcher = EventDispatcher::new(
                        stream_name,
                        job_name,
                        Arc::new(ScriptedJob::new("auditlogs")),
                        InMemoryDeadLetterSink::arc(),
                    );
                    let mut consumer =
                        StreamConsumer::new(Arc::new(stream.clone()), checkpointer, dispatcher);
                    let (_trigger, mut signal) = shutdown_channel();
                    black_box(consumer.run(&mut signal).await)
                })
            });
        });
    }

    group.finish();
}

/// Dispatch of an event whose job fails permanently (dead-letter path).
fn bench_dead_letter_dispatch(c: &mut Criterion) {
    let rt = runtime();
    let (stream_name, job_name) = names();
    let sink = InMemoryDeadLetterSink::arc();
    let dispatcher = EventDispatcher::new(
        stream_name,
        job_name,
        Arc::new(ScriptedJob::always("auditlogs", Err(JobError::permanent("rejected")))),
        sink,
    );
    let event = ChangeEvent::new(
        "1-0",
        OperationType::Insert,
        json!({"_id": "post-1"}),
        "blog.blog_posts",
        json!({"_id": "post-1"}),
    );

    c.bench_function("dispatch_permanent_failure", |b| {
        b.iter(|| rt.block_on(async { black_box(dispatcher.dispatch(&event).await) }))
    });
}

fn bench_backoff_decision(c: &mut Criterion) {
    let policy = RetryPolicy::pipeline_restart();
    c.bench_function("retry_policy_decide", |b| {
        b.iter(|| {
            for attempt in 1..=16u32 {
                black_box(policy.decide(black_box(attempt)));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_consumer_throughput,
    bench_dead_letter_dispatch,
    bench_backoff_decision
);
criterion_main!(benches);

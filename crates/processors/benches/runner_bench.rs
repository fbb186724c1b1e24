use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use processors::handlers::INBOUND_MESSAGE;
use processors::services::{
    InMemoryMessageRepository, InMemoryPreferenceStore, KeywordClassifier,
};
use processors::{InboundMessageProcessor, JobOutcome, ProcessorRunner};
use reliability::EventBus;
use serde_json::json;
use store::{
    InMemoryDeadLetterStore, InMemoryIdempotencyStore, InMemoryJobStore, JobStore, NewJob,
};

fn runner(jobs: Arc<InMemoryJobStore>) -> ProcessorRunner {
    let mut runner = ProcessorRunner::new(
        Arc::new(InMemoryIdempotencyStore::new()),
        jobs,
        Arc::new(InMemoryDeadLetterStore::new()),
    );
    runner.register(Arc::new(InboundMessageProcessor::new(
        Arc::new(InMemoryMessageRepository::new()),
        Arc::new(KeywordClassifier::new()),
        Arc::new(InMemoryPreferenceStore::new()),
        EventBus::default(),
    )));
    runner
}

fn bench_run_inbound_message(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let jobs = Arc::new(InMemoryJobStore::new());
    let runner = runner(jobs.clone());
    let mut n = 0u64;

    c.bench_function("runner/inbound_message", |b| {
        b.iter(|| {
            n += 1;
            rt.block_on(async {
                let payload = json!({"message_id": format!("wamid.{n}"), "from": "1555", "text": "where is my order"});
                let job = jobs.enqueue(NewJob::new(INBOUND_MESSAGE, payload)).await.unwrap();
                let outcome = runner.run(job).await.unwrap();
                assert_eq!(outcome, JobOutcome::Completed);
            });
        });
    });
}

fn bench_run_duplicate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let jobs = Arc::new(InMemoryJobStore::new());
    let runner = runner(jobs.clone());
    let payload = json!({"message_id": "wamid.dup", "from": "1555", "text": "hi"});
    rt.block_on(async {
        let job = jobs.enqueue(NewJob::new(INBOUND_MESSAGE, payload.clone())).await.unwrap();
        runner.run(job).await.unwrap();
    });

    c.bench_function("runner/duplicate_short_circuit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let job = jobs
                    .enqueue(NewJob::new(INBOUND_MESSAGE, payload.clone()))
                    .await
                    .unwrap();
                let outcome = runner.run(job).await.unwrap();
                assert!(matches!(outcome, JobOutcome::Duplicate(_)));
            });
        });
    });
}

criterion_group!(benches, bench_run_inbound_message, bench_run_duplicate);
criterion_main!(benches);

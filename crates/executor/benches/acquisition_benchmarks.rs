use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use chrono::{Duration, Utc};
use jobflow_executor::{
    ClaimRequest, InMemoryJobStore, InvocationContext, JobExecutor, JobExecutorConfig, JobStore,
    LockOwner, NewJob, ProcessInstanceId,
};

fn seeded_store(jobs: usize, instances: usize) -> InMemoryJobStore {
    let store = InMemoryJobStore::new();
    let now = Utc::now();
    let pis: Vec<ProcessInstanceId> = (0..instances.max(1)).map(|_| ProcessInstanceId::new()).collect();
    let mut tx = store.begin().unwrap();
    for i in 0..jobs {
        let job = NewJob::new("bench", "")
            .with_priority((i % 5) as i64)
            .for_process_instance(pis[i % pis.len()])
            .into_job(now, 3);
        tx.insert_job(job).unwrap();
    }
    tx.commit().unwrap();
    store
}

fn claim_request(max_jobs: usize) -> ClaimRequest {
    ClaimRequest {
        max_jobs,
        now: Utc::now(),
        lock_owner: LockOwner::new("bench").unwrap(),
        lock_duration: Duration::minutes(5),
        clock_skew_tolerance: Duration::zero(),
    }
}

/// Claim throughput against a store of 1000 due jobs.
fn bench_claim_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_due_jobs");

    for batch in [1usize, 10, 50] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            b.iter_batched(
                || seeded_store(1000, 1000),
                |store| black_box(store.claim_due_jobs(&claim_request(batch)).unwrap()),
                BatchSize::LargeInput,
            );
        });
    }

    // Exclusive jobs crowded into few process instances: most candidates
    // are skipped.
    group.bench_function("exclusive_contention", |b| {
        b.iter_batched(
            || seeded_store(1000, 10),
            |store| black_box(store.claim_due_jobs(&claim_request(50)).unwrap()),
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

/// Full pipeline round trip for a no-op job: create, execute, delete.
fn bench_execute_job(c: &mut Criterion) {
    let executor = JobExecutor::new(InMemoryJobStore::arc(), JobExecutorConfig::default());
    executor.register_handler("noop", |_, _| Ok(()));
    let management = executor.management();

    let mut group = c.benchmark_group("execute_job");
    group.throughput(Throughput::Elements(1));
    group.bench_function("create_and_execute_noop", |b| {
        b.iter(|| {
            let id = management
                .create_job(NewJob::new("noop", ""), InvocationContext::system())
                .unwrap();
            black_box(management.execute_job(id, InvocationContext::system()).unwrap())
        });
    });
    group.finish();
}

criterion_group!(benches, bench_claim_batches, bench_execute_job);
criterion_main!(benches);

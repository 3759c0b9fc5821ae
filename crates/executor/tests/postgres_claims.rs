//! Claims against a live Postgres. Set `DATABASE_URL` to a scratch database
//! and run with `--features postgres`; without it the tests return early.
#![cfg(feature = "postgres")]

use std::sync::{Arc, Barrier};

use chrono::Utc;
use jobflow_executor::{
    ClaimRequest, JobStore, LockOwner, NewJob, PostgresJobStore, ProcessInstanceId,
};
use sqlx::postgres::PgPoolOptions;

const HANDLER_TYPE: &str = "exclusive-race";

fn connect() -> Option<(tokio::runtime::Runtime, Arc<PostgresJobStore>)> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let pool = runtime
        .block_on(PgPoolOptions::new().max_connections(4).connect(&url))
        .unwrap();
    let store = PostgresJobStore::new(pool, runtime.handle().clone());
    runtime.block_on(store.ensure_schema()).unwrap();
    runtime
        .block_on(
            sqlx::query("DELETE FROM jobflow_jobs WHERE handler_type = $1")
                .bind(HANDLER_TYPE)
                .execute(store.pool()),
        )
        .unwrap();
    Some((runtime, Arc::new(store)))
}

fn claim(store: &PostgresJobStore, owner: &str) -> usize {
    store
        .claim_due_jobs(&ClaimRequest {
            max_jobs: 10,
            now: Utc::now(),
            lock_owner: LockOwner::new(owner).unwrap(),
            lock_duration: chrono::Duration::minutes(5),
            clock_skew_tolerance: chrono::Duration::zero(),
        })
        .unwrap()
        .len()
}

#[test]
fn exclusive_siblings_are_never_claimed_by_two_nodes() {
    let Some((_runtime, store)) = connect() else {
        return;
    };

    for round in 0..50 {
        let pi = ProcessInstanceId::new();
        let now = Utc::now();
        let mut tx = store.begin().unwrap();
        let ids: Vec<_> = (0..2)
            .map(|_| {
                let job = NewJob::new(HANDLER_TYPE, "")
                    .for_process_instance(pi)
                    .exclusive(true)
                    .into_job(now, 3);
                let id = job.id;
                tx.insert_job(job).unwrap();
                id
            })
            .collect();
        tx.commit().unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let contenders: Vec<_> = ["node-a", "node-b"]
            .into_iter()
            .map(|owner| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    claim(&store, owner)
                })
            })
            .collect();
        for contender in contenders {
            contender.join().unwrap();
        }

        let locked = ids
            .iter()
            .filter(|id| {
                store
                    .find_job(**id)
                    .unwrap()
                    .is_some_and(|job| job.lock_owner.is_some())
            })
            .count();
        assert_eq!(locked, 1, "round {round}: {locked} exclusive siblings locked");
    }
}

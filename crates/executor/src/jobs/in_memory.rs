//! In-memory job store for tests, benches and single-process deployments.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};

use jobflow_core::{JobId, LockOwner};

use super::store::{ClaimRequest, JobFilter, JobStats, JobStore, JobStoreError, Transaction};
use super::types::{FailureDetail, FailureRecord, Incident, Job};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    incidents: Vec<Incident>,
    failures: HashMap<JobId, Vec<FailureRecord>>,
}

/// In-memory job store.
///
/// Clones share the same underlying state, so several executors (simulated
/// nodes) can compete over one store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, JobStoreError> {
        read_state(&self.state)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, JobStoreError> {
        write_state(&self.state)
    }
}

fn read_state(state: &RwLock<State>) -> Result<RwLockReadGuard<'_, State>, JobStoreError> {
    state
        .read()
        .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
}

fn write_state(state: &RwLock<State>) -> Result<RwLockWriteGuard<'_, State>, JobStoreError> {
    state
        .write()
        .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
}

/// Priority descending, due date ascending, then creation order.
fn acquisition_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.due_date.cmp(&b.due_date))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

impl JobStore for InMemoryJobStore {
    fn claim_due_jobs(&self, request: &ClaimRequest) -> Result<Vec<JobId>, JobStoreError> {
        if request.max_jobs == 0 {
            return Ok(Vec::new());
        }
        let now = request.now;
        let skew = request.clock_skew_tolerance;

        let mut state = self.write()?;

        // Process instances that already have an exclusive job in flight.
        let mut busy: HashSet<_> = state
            .jobs
            .values()
            .filter(|j| j.exclusive && j.holds_lock(now, skew))
            .filter_map(|j| j.process_instance_id)
            .collect();

        let mut candidates: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now, skew))
            .collect();
        candidates.sort_by(|a, b| acquisition_order(a, b));

        let mut claimed = Vec::with_capacity(request.max_jobs);
        for job in candidates {
            if claimed.len() >= request.max_jobs {
                break;
            }
            if job.exclusive {
                if let Some(pi) = job.process_instance_id {
                    if !busy.insert(pi) {
                        continue;
                    }
                }
            }
            claimed.push(job.id);
        }

        let expires = request.lock_expiration();
        for id in &claimed {
            if let Some(job) = state.jobs.get_mut(id) {
                job.lock_owner = Some(request.lock_owner.clone());
                job.lock_expiration_time = Some(expires);
                job.version += 1;
            }
        }

        Ok(claimed)
    }

    fn unlock_jobs(&self, ids: &[JobId], owner: &LockOwner) -> Result<(), JobStoreError> {
        let mut state = self.write()?;
        for id in ids {
            if let Some(job) = state.jobs.get_mut(id) {
                if job.is_locked_by(owner) {
                    job.clear_lock();
                    job.version += 1;
                }
            }
        }
        Ok(())
    }

    fn begin(&self) -> Result<Box<dyn Transaction>, JobStoreError> {
        Ok(Box::new(InMemoryTransaction::new(self.state.clone())))
    }

    fn find_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    fn list_jobs(
        &self,
        filter: &JobFilter,
        now: DateTime<Utc>,
        clock_skew_tolerance: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let state = self.read()?;
        let mut result: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j, now, clock_skew_tolerance))
            .cloned()
            .collect();

        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        result.truncate(limit);
        Ok(result)
    }

    fn list_incidents(&self, open_only: bool, limit: usize) -> Result<Vec<Incident>, JobStoreError> {
        let state = self.read()?;
        let mut result: Vec<Incident> = state
            .incidents
            .iter()
            .filter(|i| !open_only || i.is_open())
            .cloned()
            .collect();

        result.sort_by_key(|i| i.created_at);
        result.truncate(limit);
        Ok(result)
    }

    fn failure_log(&self, id: JobId) -> Result<Vec<FailureRecord>, JobStoreError> {
        Ok(self.read()?.failures.get(&id).cloned().unwrap_or_default())
    }

    fn stats(
        &self,
        now: DateTime<Utc>,
        clock_skew_tolerance: Duration,
    ) -> Result<JobStats, JobStoreError> {
        let state = self.read()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.count(job, now, clock_skew_tolerance);
        }
        stats.open_incidents = state.incidents.iter().filter(|i| i.is_open()).count();
        Ok(stats)
    }
}

/// Staged unit of work; applied atomically on commit.
struct InMemoryTransaction {
    state: Arc<RwLock<State>>,
    /// Version of each touched job when first read (`None`: did not exist).
    read_versions: HashMap<JobId, Option<u64>>,
    /// `None` marks a deletion.
    staged: HashMap<JobId, Option<Job>>,
    failures: Vec<FailureRecord>,
    incidents: Vec<Incident>,
    resolved: HashMap<JobId, DateTime<Utc>>,
}

impl InMemoryTransaction {
    fn new(state: Arc<RwLock<State>>) -> Self {
        Self {
            state,
            read_versions: HashMap::new(),
            staged: HashMap::new(),
            failures: Vec::new(),
            incidents: Vec::new(),
            resolved: HashMap::new(),
        }
    }

    /// The job as seen by this transaction (own writes first).
    fn current(&mut self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        if let Some(staged) = self.staged.get(&id) {
            return Ok(staged.clone());
        }
        let job = read_state(&self.state)?.jobs.get(&id).cloned();
        self.read_versions
            .entry(id)
            .or_insert(job.as_ref().map(|j| j.version));
        Ok(job)
    }
}

impl Transaction for InMemoryTransaction {
    fn load_job(&mut self, id: JobId) -> Result<Job, JobStoreError> {
        self.current(id)?.ok_or(JobStoreError::NotFound(id))
    }

    fn insert_job(&mut self, job: Job) -> Result<(), JobStoreError> {
        if self.current(job.id)?.is_some() {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        self.staged.insert(job.id, Some(job));
        Ok(())
    }

    fn update_job(&mut self, job: &Job) -> Result<(), JobStoreError> {
        let existing = self.load_job(job.id)?;
        if existing.version != job.version {
            return Err(JobStoreError::conflict(
                job.id,
                format!("stale version {} (current {})", job.version, existing.version),
            ));
        }
        self.staged.insert(job.id, Some(job.clone()));
        Ok(())
    }

    fn delete_job(&mut self, id: JobId) -> Result<(), JobStoreError> {
        self.load_job(id)?;
        self.staged.insert(id, None);
        Ok(())
    }

    fn record_failure(
        &mut self,
        id: JobId,
        failure: &FailureDetail,
        retries_left: u32,
        new_due_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FailureRecord, JobStoreError> {
        let mut job = self.load_job(id)?;
        job.retries = retries_left;
        job.due_date = new_due_date;
        job.failed_attempts += 1;
        job.exception_message = Some(failure.message.clone());
        job.exception_stacktrace = Some(failure.stacktrace.clone());
        job.clear_lock();

        let record = FailureRecord {
            job_id: id,
            attempt: job.failed_attempts,
            message: failure.message.clone(),
            stacktrace: failure.stacktrace.clone(),
            retries_left,
            next_due_date: new_due_date,
            recorded_at: now,
        };
        self.staged.insert(id, Some(job));
        self.failures.push(record.clone());
        Ok(record)
    }

    fn create_incident(
        &mut self,
        job_id: JobId,
        failure: &FailureDetail,
        now: DateTime<Utc>,
    ) -> Result<Incident, JobStoreError> {
        let job = self.load_job(job_id)?;

        if let Some(open) = self
            .incidents
            .iter()
            .find(|i| i.job_id == job_id && i.is_open())
        {
            return Ok(open.clone());
        }
        if !self.resolved.contains_key(&job_id) {
            let state = read_state(&self.state)?;
            if let Some(open) = state
                .incidents
                .iter()
                .find(|i| i.job_id == job_id && i.is_open())
            {
                return Ok(open.clone());
            }
        }

        let incident = Incident::failed_job(&job, failure, now);
        self.incidents.push(incident.clone());
        Ok(incident)
    }

    fn resolve_incidents(&mut self, job_id: JobId, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut resolved = 0;
        for incident in self
            .incidents
            .iter_mut()
            .filter(|i| i.job_id == job_id && i.is_open())
        {
            incident.resolved_at = Some(now);
            resolved += 1;
        }
        if !self.resolved.contains_key(&job_id) {
            let state = read_state(&self.state)?;
            resolved += state
                .incidents
                .iter()
                .filter(|i| i.job_id == job_id && i.is_open())
                .count();
            self.resolved.insert(job_id, now);
        }
        Ok(resolved)
    }

    fn commit(self: Box<Self>) -> Result<(), JobStoreError> {
        let this = *self;
        let mut state = write_state(&this.state)?;

        for id in this.staged.keys() {
            let seen = this.read_versions.get(id).copied().flatten();
            let current = state.jobs.get(id).map(|j| j.version);
            if seen != current {
                return Err(JobStoreError::conflict(
                    *id,
                    format!("version changed from {seen:?} to {current:?}"),
                ));
            }
        }

        for (id, staged) in this.staged {
            match staged {
                Some(mut job) => {
                    job.version = state.jobs.get(&id).map_or(1, |j| j.version + 1);
                    state.jobs.insert(id, job);
                }
                None => {
                    state.jobs.remove(&id);
                    state.failures.remove(&id);
                }
            }
        }

        for record in this.failures {
            if state.jobs.contains_key(&record.job_id) {
                state.failures.entry(record.job_id).or_default().push(record);
            }
        }

        for incident in state.incidents.iter_mut() {
            if let Some(at) = this.resolved.get(&incident.job_id) {
                if incident.is_open() {
                    incident.resolved_at = Some(*at);
                }
            }
        }
        state.incidents.extend(this.incidents);

        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), JobStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobState, NewJob, DEFAULT_RETRIES};
    use jobflow_core::ProcessInstanceId;

    fn owner(name: &str) -> LockOwner {
        LockOwner::new(name).unwrap()
    }

    fn claim(store: &InMemoryJobStore, max: usize, now: DateTime<Utc>, who: &str) -> Vec<JobId> {
        store
            .claim_due_jobs(&ClaimRequest {
                max_jobs: max,
                now,
                lock_owner: owner(who),
                lock_duration: Duration::minutes(5),
                clock_skew_tolerance: Duration::zero(),
            })
            .unwrap()
    }

    fn insert(store: &InMemoryJobStore, job: Job) -> JobId {
        let id = job.id;
        let mut tx = store.begin().unwrap();
        tx.insert_job(job).unwrap();
        tx.commit().unwrap();
        id
    }

    fn new_job() -> NewJob {
        NewJob::new("test", "{}")
    }

    #[test]
    fn claims_in_priority_then_due_order() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let late = insert(&store, new_job().due_at(now - Duration::seconds(1)).into_job(now, 3));
        let early = insert(&store, new_job().due_at(now - Duration::seconds(10)).into_job(now, 3));
        let urgent = insert(&store, new_job().with_priority(10).into_job(now, 3));

        assert_eq!(claim(&store, 10, now, "a"), vec![urgent, early, late]);
        assert!(claim(&store, 10, now, "b").is_empty());
    }

    #[test]
    fn skips_suspended_future_and_exhausted_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut suspended = new_job().into_job(now, 3);
        suspended.suspended = true;
        insert(&store, suspended);
        insert(&store, new_job().due_at(now + Duration::minutes(1)).into_job(now, 3));
        insert(&store, new_job().with_retries(0).into_job(now, 3));

        assert!(claim(&store, 10, now, "a").is_empty());
    }

    #[test]
    fn claim_respects_max_and_locks_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for _ in 0..5 {
            insert(&store, new_job().into_job(now, 3));
        }

        let claimed = claim(&store, 3, now, "a");
        assert_eq!(claimed.len(), 3);
        for id in &claimed {
            let job = store.find_job(*id).unwrap().unwrap();
            assert_eq!(job.lock_owner, Some(owner("a")));
            assert_eq!(job.lock_expiration_time, Some(now + Duration::minutes(5)));
            assert_eq!(job.state(now, Duration::zero()), JobState::Locked);
        }
        assert_eq!(claim(&store, 10, now, "b").len(), 2);
    }

    #[test]
    fn expired_locks_are_reclaimed() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = insert(&store, new_job().into_job(now, 3));

        assert_eq!(claim(&store, 1, now, "a"), vec![id]);
        assert!(claim(&store, 1, now + Duration::minutes(4), "b").is_empty());
        assert_eq!(claim(&store, 1, now + Duration::minutes(6), "b"), vec![id]);
        let job = store.find_job(id).unwrap().unwrap();
        assert_eq!(job.lock_owner, Some(owner("b")));
    }

    #[test]
    fn clock_skew_delays_reclaiming() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = insert(&store, new_job().into_job(now, 3));
        assert_eq!(claim(&store, 1, now, "a"), vec![id]);

        let request = |at| ClaimRequest {
            max_jobs: 1,
            now: at,
            lock_owner: owner("b"),
            lock_duration: Duration::minutes(5),
            clock_skew_tolerance: Duration::seconds(30),
        };
        let just_expired = now + Duration::minutes(5) + Duration::seconds(10);
        assert!(store.claim_due_jobs(&request(just_expired)).unwrap().is_empty());
        let well_expired = now + Duration::minutes(6);
        assert_eq!(store.claim_due_jobs(&request(well_expired)).unwrap(), vec![id]);
    }

    #[test]
    fn exclusive_jobs_of_one_instance_are_claimed_one_at_a_time() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let pi = ProcessInstanceId::new();

        let first = insert(&store, new_job().for_process_instance(pi).into_job(now, 3));
        let second = insert(
            &store,
            new_job()
                .for_process_instance(pi)
                .due_at(now - Duration::seconds(1))
                .into_job(now + Duration::milliseconds(1), 3),
        );
        let other = insert(
            &store,
            new_job()
                .for_process_instance(ProcessInstanceId::new())
                .into_job(now, 3),
        );
        let shared = insert(
            &store,
            new_job()
                .for_process_instance(pi)
                .exclusive(false)
                .into_job(now, 3),
        );

        let claimed = claim(&store, 10, now, "a");
        assert!(claimed.contains(&second));
        assert!(claimed.contains(&other));
        assert!(claimed.contains(&shared));
        assert!(!claimed.contains(&first));

        // Still blocked while `second` is locked.
        assert!(claim(&store, 10, now, "b").is_empty());

        let mut tx = store.begin().unwrap();
        tx.delete_job(second).unwrap();
        tx.commit().unwrap();
        assert_eq!(claim(&store, 10, now, "b"), vec![first]);
    }

    #[test]
    fn unlock_only_releases_own_locks() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = insert(&store, new_job().into_job(now, 3));
        claim(&store, 1, now, "a");

        store.unlock_jobs(&[id], &owner("b")).unwrap();
        assert!(store.find_job(id).unwrap().unwrap().lock_owner.is_some());

        store.unlock_jobs(&[id], &owner("a")).unwrap();
        assert_eq!(claim(&store, 1, now, "b"), vec![id]);
    }

    #[test]
    fn rollback_and_drop_discard_changes() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = insert(&store, new_job().into_job(now, 3));

        let mut tx = store.begin().unwrap();
        tx.delete_job(id).unwrap();
        tx.rollback().unwrap();
        assert!(store.find_job(id).unwrap().is_some());

        {
            let mut tx = store.begin().unwrap();
            tx.insert_job(new_job().into_job(now, 3)).unwrap();
        }
        assert_eq!(store.stats(now, Duration::zero()).unwrap().total, 1);
    }

    #[test]
    fn concurrent_modification_is_detected_on_commit() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = insert(&store, new_job().into_job(now, 3));

        let mut tx = store.begin().unwrap();
        let mut job = tx.load_job(id).unwrap();
        job.suspended = true;
        tx.update_job(&job).unwrap();

        // Someone claims it meanwhile.
        claim(&store, 1, now, "a");

        let err = tx.commit().unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict { job_id, .. } if job_id == id));
        assert!(!store.find_job(id).unwrap().unwrap().suspended);
    }

    #[test]
    fn stale_update_is_rejected() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = insert(&store, new_job().into_job(now, 3));
        let mut stale = store.find_job(id).unwrap().unwrap();
        stale.version -= 1;

        let mut tx = store.begin().unwrap();
        assert!(matches!(tx.update_job(&stale), Err(JobStoreError::Conflict { .. })));
    }

    #[test]
    fn record_failure_updates_job_and_log() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = insert(&store, new_job().into_job(now, DEFAULT_RETRIES));
        claim(&store, 1, now, "a");

        let failure = FailureDetail::new("boom", "boom\n  at handler");
        let due = now + Duration::minutes(1);
        let mut tx = store.begin().unwrap();
        let record = tx.record_failure(id, &failure, 2, due, now).unwrap();
        tx.commit().unwrap();

        assert_eq!(record.attempt, 1);
        let job = store.find_job(id).unwrap().unwrap();
        assert_eq!(job.retries, 2);
        assert_eq!(job.due_date, due);
        assert_eq!(job.failed_attempts, 1);
        assert_eq!(job.exception_message.as_deref(), Some("boom"));
        assert!(job.lock_owner.is_none());
        assert_eq!(store.failure_log(id).unwrap(), vec![record]);
    }

    #[test]
    fn incidents_are_deduplicated_and_resolvable() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = insert(&store, new_job().with_retries(0).into_job(now, 3));
        let failure = FailureDetail::new("boom", "");

        let mut tx = store.begin().unwrap();
        let first = tx.create_incident(id, &failure, now).unwrap();
        let again = tx.create_incident(id, &failure, now).unwrap();
        tx.commit().unwrap();
        assert_eq!(first.id, again.id);

        let mut tx = store.begin().unwrap();
        let third = tx.create_incident(id, &failure, now).unwrap();
        tx.commit().unwrap();
        assert_eq!(third.id, first.id);
        assert_eq!(store.list_incidents(true, 10).unwrap().len(), 1);

        let mut tx = store.begin().unwrap();
        assert_eq!(tx.resolve_incidents(id, now).unwrap(), 1);
        tx.commit().unwrap();
        assert!(store.list_incidents(true, 10).unwrap().is_empty());
        assert_eq!(store.list_incidents(false, 10).unwrap().len(), 1);
    }

    #[test]
    fn filters_and_stats() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let pi = ProcessInstanceId::new();
        insert(&store, new_job().for_process_instance(pi).into_job(now, 3));
        insert(&store, NewJob::new("mail", "").into_job(now, 3));
        insert(&store, NewJob::new("mail", "").with_retries(0).into_job(now, 3));

        let mail = store
            .list_jobs(&JobFilter::all().handler_type("mail"), now, Duration::zero(), 10)
            .unwrap();
        assert_eq!(mail.len(), 2);
        let by_instance = store
            .list_jobs(&JobFilter::all().process_instance(pi), now, Duration::zero(), 10)
            .unwrap();
        assert_eq!(by_instance.len(), 1);
        let exhausted = store
            .list_jobs(&JobFilter::all().in_state(JobState::Incident), now, Duration::zero(), 10)
            .unwrap();
        assert_eq!(exhausted.len(), 1);
        let no_retries = store
            .list_jobs(&JobFilter::all().no_retries_left(), now, Duration::zero(), 10)
            .unwrap();
        assert_eq!(no_retries.len(), 1);
        let executable = store
            .list_jobs(&JobFilter::all().executable(), now, Duration::zero(), 10)
            .unwrap();
        assert_eq!(executable.len(), 2);

        let stats = store.stats(now, Duration::zero()).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.executable, 2);
        assert_eq!(stats.incident, 1);
    }
}

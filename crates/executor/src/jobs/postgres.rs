//! Postgres-backed job store.
//!
//! ## Acquisition
//!
//! `claim_due_jobs` selects candidates with `FOR UPDATE SKIP LOCKED`, so two
//! nodes claiming at the same time never see each other's candidate rows, and
//! locks them in the same transaction.
//!
//! Exclusive candidates additionally take a transaction-scoped advisory lock
//! on their process instance and re-check for a locked sibling; a node that
//! cannot get the advisory lock skips the instance for this cycle.
//!
//! ## Optimistic versioning
//!
//! Every write is `... WHERE id = $1 AND version = $2` and bumps `version`.
//! Zero affected rows means someone else changed the job first and maps to
//! [`JobStoreError::Conflict`].
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` / `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |
//!
//! ## Threading
//!
//! The [`JobStore`] contract is synchronous; executor threads are plain OS
//! threads. Each call is driven with `Handle::block_on` on the runtime handle
//! given at construction, so the store must not be called from inside an async
//! task of that runtime.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};
use uuid::Uuid;

use jobflow_core::{IncidentId, JobId, LockOwner, ProcessInstanceId, RetrySchedule, saturating_add};

use super::store::{ClaimRequest, JobFilter, JobStats, JobStore, JobStoreError, Transaction};
use super::types::{FailureDetail, FailureRecord, Incident, Job};

/// DDL for the job tables. Applied by [`PostgresJobStore::ensure_schema`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobflow_jobs (
    id                    UUID PRIMARY KEY,
    handler_type          TEXT NOT NULL,
    handler_configuration TEXT NOT NULL,
    process_instance_id   UUID,
    exclusive             BOOLEAN NOT NULL,
    priority              BIGINT NOT NULL,
    due_date              TIMESTAMPTZ NOT NULL,
    retries               INTEGER NOT NULL CHECK (retries >= 0),
    retry_schedule        TEXT,
    failed_attempts       INTEGER NOT NULL DEFAULT 0,
    lock_owner            TEXT,
    lock_expiration_time  TIMESTAMPTZ,
    suspended             BOOLEAN NOT NULL DEFAULT FALSE,
    exception_message     TEXT,
    exception_stacktrace  TEXT,
    created_at            TIMESTAMPTZ NOT NULL,
    version               BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS jobflow_jobs_acquirable
    ON jobflow_jobs (priority DESC, due_date ASC)
    WHERE NOT suspended AND retries > 0;

CREATE INDEX IF NOT EXISTS jobflow_jobs_process_instance
    ON jobflow_jobs (process_instance_id)
    WHERE process_instance_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS jobflow_failures (
    job_id        UUID NOT NULL REFERENCES jobflow_jobs (id) ON DELETE CASCADE,
    attempt       INTEGER NOT NULL,
    message       TEXT NOT NULL,
    stacktrace    TEXT NOT NULL,
    retries_left  INTEGER NOT NULL,
    next_due_date TIMESTAMPTZ NOT NULL,
    recorded_at   TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (job_id, attempt)
);

CREATE TABLE IF NOT EXISTS jobflow_incidents (
    id                  UUID PRIMARY KEY,
    incident_type       TEXT NOT NULL,
    job_id              UUID NOT NULL,
    process_instance_id UUID,
    message             TEXT NOT NULL,
    stacktrace          TEXT NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    resolved_at         TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS jobflow_incidents_one_open_per_job
    ON jobflow_incidents (job_id)
    WHERE resolved_at IS NULL;
"#;

const JOB_COLUMNS: &str = "id, handler_type, handler_configuration, process_instance_id, \
     exclusive, priority, due_date, retries, retry_schedule, failed_attempts, lock_owner, \
     lock_expiration_time, suspended, exception_message, exception_stacktrace, created_at, version";

const INCIDENT_COLUMNS: &str =
    "id, incident_type, job_id, process_instance_id, message, stacktrace, created_at, resolved_at";

/// Postgres job store.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresJobStore {
    /// `runtime` drives the pool's IO; typically `Handle::current()` taken
    /// while building the store inside the host's runtime.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(max_jobs = request.max_jobs, lock_owner = %request.lock_owner), err)]
    async fn claim(&self, request: &ClaimRequest) -> Result<Vec<JobId>, JobStoreError> {
        if request.max_jobs == 0 {
            return Ok(Vec::new());
        }
        let expired_before = saturating_add(request.now, -request.clock_skew_tolerance);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Over-fetch: several candidates of one exclusive process instance
        // may come back, only the first of them is taken.
        let rows = sqlx::query(
            r#"
            SELECT j.id, j.process_instance_id, j.exclusive
            FROM jobflow_jobs j
            WHERE NOT j.suspended
                AND j.retries > 0
                AND j.due_date <= $1
                AND (j.lock_owner IS NULL
                     OR j.lock_expiration_time IS NULL
                     OR j.lock_expiration_time < $2)
                AND NOT (
                    j.exclusive
                    AND j.process_instance_id IS NOT NULL
                    AND EXISTS (
                        SELECT 1 FROM jobflow_jobs o
                        WHERE o.process_instance_id = j.process_instance_id
                            AND o.exclusive
                            AND o.id <> j.id
                            AND o.lock_owner IS NOT NULL
                            AND o.lock_expiration_time >= $2
                    )
                )
            ORDER BY j.priority DESC, j.due_date ASC, j.created_at ASC, j.id ASC
            LIMIT $3
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(request.now)
        .bind(expired_before)
        .bind((request.max_jobs.saturating_mul(4)) as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_due_jobs", e))?;

        let mut busy: HashSet<Uuid> = HashSet::new();
        let mut claimed: Vec<Uuid> = Vec::with_capacity(request.max_jobs);
        for row in rows {
            if claimed.len() >= request.max_jobs {
                break;
            }
            let id: Uuid = row.try_get("id").map_err(|e| map_sqlx_error("read_id", e))?;
            let exclusive: bool = row
                .try_get("exclusive")
                .map_err(|e| map_sqlx_error("read_exclusive", e))?;
            let process_instance: Option<Uuid> = row
                .try_get("process_instance_id")
                .map_err(|e| map_sqlx_error("read_process_instance_id", e))?;
            if let (true, Some(pi)) = (exclusive, process_instance) {
                if !busy.insert(pi) {
                    continue;
                }
                if !self
                    .lock_process_instance(&mut tx, pi, id, expired_before)
                    .await?
                {
                    continue;
                }
            }
            claimed.push(id);
        }

        if !claimed.is_empty() {
            sqlx::query(
                r#"
                UPDATE jobflow_jobs
                SET lock_owner = $1, lock_expiration_time = $2, version = version + 1
                WHERE id = ANY($3)
                "#,
            )
            .bind(request.lock_owner.as_str())
            .bind(request.lock_expiration())
            .bind(&claimed)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_jobs", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(claimed = claimed.len(), "claimed due jobs");
        Ok(claimed.into_iter().map(JobId::from_uuid).collect())
    }

    /// Serialize exclusive claims per process instance across nodes.
    ///
    /// The candidate scan skips rows another node has locked but not yet
    /// committed, so its sibling check can miss an exclusive job that is being
    /// claimed right now. The advisory lock is held until this transaction
    /// ends; once it is ours, a fresh statement sees every committed claim.
    async fn lock_process_instance(
        &self,
        tx: &mut sqlx::Transaction<'static, Postgres>,
        process_instance: Uuid,
        candidate: Uuid,
        expired_before: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let acquired: bool = sqlx::query_scalar(
            "SELECT pg_try_advisory_xact_lock(hashtext('jobflow_jobs'), hashtext($1::text))",
        )
        .bind(process_instance)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_process_instance", e))?;
        if !acquired {
            debug!(%process_instance, "process instance claimed elsewhere, skipping");
            return Ok(false);
        }

        let sibling_locked: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobflow_jobs o
                WHERE o.process_instance_id = $1
                    AND o.exclusive
                    AND o.id <> $2
                    AND o.lock_owner IS NOT NULL
                    AND o.lock_expiration_time >= $3
            )
            "#,
        )
        .bind(process_instance)
        .bind(candidate)
        .bind(expired_before)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("check_exclusive_siblings", e))?;
        Ok(!sibling_locked)
    }

    async fn unlock(&self, ids: &[JobId], owner: &LockOwner) -> Result<(), JobStoreError> {
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        sqlx::query(
            r#"
            UPDATE jobflow_jobs
            SET lock_owner = NULL, lock_expiration_time = NULL, version = version + 1
            WHERE id = ANY($1) AND lock_owner = $2
            "#,
        )
        .bind(&ids)
        .bind(owner.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("unlock_jobs", e))?;
        Ok(())
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobflow_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_job", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn fetch_jobs(
        &self,
        filter: &JobFilter,
        now: DateTime<Utc>,
        clock_skew_tolerance: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        // Derived state is filtered in Rust, everything else in SQL.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobflow_jobs
            WHERE ($1::uuid IS NULL OR process_instance_id = $1)
                AND ($2::text IS NULL OR handler_type = $2)
                AND ($3::boolean IS NULL OR suspended = $3)
                AND (NOT $4 OR exception_message IS NOT NULL)
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(filter.process_instance_id.map(|id| *id.as_uuid()))
        .bind(filter.handler_type.as_deref())
        .bind(filter.suspended)
        .bind(filter.with_exception)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let mut jobs = Vec::new();
        for row in rows {
            if jobs.len() >= limit {
                break;
            }
            let job = job_from_row(&row)?;
            if filter.matches(&job, now, clock_skew_tolerance) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn fetch_incidents(
        &self,
        open_only: bool,
        limit: usize,
    ) -> Result<Vec<Incident>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INCIDENT_COLUMNS} FROM jobflow_incidents
            WHERE (NOT $1 OR resolved_at IS NULL)
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(open_only)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_incidents", e))?;

        rows.iter()
            .map(|r| {
                IncidentRow::from_row(r)
                    .map(Incident::from)
                    .map_err(|e| map_sqlx_error("read_incident", e))
            })
            .collect()
    }

    async fn fetch_failures(&self, id: JobId) -> Result<Vec<FailureRecord>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, attempt, message, stacktrace, retries_left, next_due_date, recorded_at
            FROM jobflow_failures
            WHERE job_id = $1
            ORDER BY attempt ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("failure_log", e))?;

        rows.iter()
            .map(|r| {
                FailureRow::from_row(r)
                    .map(FailureRecord::from)
                    .map_err(|e| map_sqlx_error("read_failure", e))
            })
            .collect()
    }

    async fn compute_stats(
        &self,
        now: DateTime<Utc>,
        clock_skew_tolerance: Duration,
    ) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobflow_jobs"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            stats.count(&job_from_row(&row)?, now, clock_skew_tolerance);
        }

        let open: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobflow_incidents WHERE resolved_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_open_incidents", e))?;
        stats.open_incidents = open as usize;
        Ok(stats)
    }
}

impl JobStore for PostgresJobStore {
    fn claim_due_jobs(&self, request: &ClaimRequest) -> Result<Vec<JobId>, JobStoreError> {
        self.runtime.block_on(self.claim(request))
    }

    fn unlock_jobs(&self, ids: &[JobId], owner: &LockOwner) -> Result<(), JobStoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.runtime.block_on(self.unlock(ids, owner))
    }

    fn begin(&self) -> Result<Box<dyn Transaction>, JobStoreError> {
        let tx = self
            .runtime
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction {
            tx: Some(tx),
            runtime: self.runtime.clone(),
        }))
    }

    fn find_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.runtime.block_on(self.fetch_job(id))
    }

    fn list_jobs(
        &self,
        filter: &JobFilter,
        now: DateTime<Utc>,
        clock_skew_tolerance: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.runtime
            .block_on(self.fetch_jobs(filter, now, clock_skew_tolerance, limit))
    }

    fn list_incidents(&self, open_only: bool, limit: usize) -> Result<Vec<Incident>, JobStoreError> {
        self.runtime.block_on(self.fetch_incidents(open_only, limit))
    }

    fn failure_log(&self, id: JobId) -> Result<Vec<FailureRecord>, JobStoreError> {
        self.runtime.block_on(self.fetch_failures(id))
    }

    fn stats(
        &self,
        now: DateTime<Utc>,
        clock_skew_tolerance: Duration,
    ) -> Result<JobStats, JobStoreError> {
        self.runtime
            .block_on(self.compute_stats(now, clock_skew_tolerance))
    }
}

/// A database transaction. Writes are applied immediately and become visible
/// to others on commit.
struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    runtime: Handle,
}

impl PostgresTransaction {
    fn conn(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, JobStoreError> {
        self.tx.as_mut().ok_or(JobStoreError::TransactionClosed)
    }

    async fn load(&mut self, id: JobId) -> Result<Job, JobStoreError> {
        let tx = self.conn()?;
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobflow_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    async fn insert(&mut self, job: Job) -> Result<(), JobStoreError> {
        let tx = self.conn()?;
        sqlx::query(&format!(
            "INSERT INTO jobflow_jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, 1)"
        ))
        .bind(job.id.as_uuid())
        .bind(&job.handler_type)
        .bind(&job.handler_configuration)
        .bind(job.process_instance_id.map(|id| *id.as_uuid()))
        .bind(job.exclusive)
        .bind(job.priority)
        .bind(job.due_date)
        .bind(job.retries as i32)
        .bind(job.retry_schedule.as_ref().map(|s| s.to_string()))
        .bind(job.failed_attempts as i32)
        .bind(job.lock_owner.as_ref().map(|o| o.as_str().to_string()))
        .bind(job.lock_expiration_time)
        .bind(job.suspended)
        .bind(&job.exception_message)
        .bind(&job.exception_stacktrace)
        .bind(job.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;
        Ok(())
    }

    async fn update(&mut self, job: &Job) -> Result<(), JobStoreError> {
        let tx = self.conn()?;
        let result = sqlx::query(
            r#"
            UPDATE jobflow_jobs SET
                handler_type = $3,
                handler_configuration = $4,
                process_instance_id = $5,
                exclusive = $6,
                priority = $7,
                due_date = $8,
                retries = $9,
                retry_schedule = $10,
                failed_attempts = $11,
                lock_owner = $12,
                lock_expiration_time = $13,
                suspended = $14,
                exception_message = $15,
                exception_stacktrace = $16,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.version as i64)
        .bind(&job.handler_type)
        .bind(&job.handler_configuration)
        .bind(job.process_instance_id.map(|id| *id.as_uuid()))
        .bind(job.exclusive)
        .bind(job.priority)
        .bind(job.due_date)
        .bind(job.retries as i32)
        .bind(job.retry_schedule.as_ref().map(|s| s.to_string()))
        .bind(job.failed_attempts as i32)
        .bind(job.lock_owner.as_ref().map(|o| o.as_str().to_string()))
        .bind(job.lock_expiration_time)
        .bind(job.suspended)
        .bind(&job.exception_message)
        .bind(&job.exception_stacktrace)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::conflict(
                job.id,
                format!("version {} is no longer current", job.version),
            ));
        }
        Ok(())
    }

    async fn delete(&mut self, id: JobId) -> Result<(), JobStoreError> {
        let job = self.load(id).await?;
        let tx = self.conn()?;
        let result = sqlx::query("DELETE FROM jobflow_jobs WHERE id = $1 AND version = $2")
            .bind(id.as_uuid())
            .bind(job.version as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        if result.rows_affected() == 0 {
            return Err(JobStoreError::conflict(id, "deleted or modified concurrently"));
        }
        Ok(())
    }

    async fn fail(
        &mut self,
        id: JobId,
        failure: &FailureDetail,
        retries_left: u32,
        new_due_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FailureRecord, JobStoreError> {
        let mut job = self.load(id).await?;
        job.retries = retries_left;
        job.due_date = new_due_date;
        job.failed_attempts += 1;
        job.exception_message = Some(failure.message.clone());
        job.exception_stacktrace = Some(failure.stacktrace.clone());
        job.clear_lock();
        self.update(&job).await?;

        let record = FailureRecord {
            job_id: id,
            attempt: job.failed_attempts,
            message: failure.message.clone(),
            stacktrace: failure.stacktrace.clone(),
            retries_left,
            next_due_date: new_due_date,
            recorded_at: now,
        };

        let tx = self.conn()?;
        sqlx::query(
            r#"
            INSERT INTO jobflow_failures
                (job_id, attempt, message, stacktrace, retries_left, next_due_date, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id.as_uuid())
        .bind(record.attempt as i32)
        .bind(&record.message)
        .bind(&record.stacktrace)
        .bind(record.retries_left as i32)
        .bind(record.next_due_date)
        .bind(record.recorded_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        Ok(record)
    }

    async fn open_incident(
        &mut self,
        job_id: JobId,
        failure: &FailureDetail,
        now: DateTime<Utc>,
    ) -> Result<Incident, JobStoreError> {
        let job = self.load(job_id).await?;
        let tx = self.conn()?;

        let existing = sqlx::query(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM jobflow_incidents \
             WHERE job_id = $1 AND resolved_at IS NULL"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("find_open_incident", e))?;
        if let Some(row) = existing {
            return IncidentRow::from_row(&row)
                .map(Incident::from)
                .map_err(|e| map_sqlx_error("read_incident", e));
        }

        let incident = Incident::failed_job(&job, failure, now);
        sqlx::query(&format!(
            "INSERT INTO jobflow_incidents ({INCIDENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NULL)"
        ))
        .bind(incident.id.as_uuid())
        .bind(&incident.incident_type)
        .bind(job_id.as_uuid())
        .bind(incident.process_instance_id.map(|id| *id.as_uuid()))
        .bind(&incident.message)
        .bind(&incident.stacktrace)
        .bind(incident.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::conflict(job_id, "incident opened concurrently")
            } else {
                map_sqlx_error("create_incident", e)
            }
        })?;
        Ok(incident)
    }

    async fn resolve(&mut self, job_id: JobId, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let tx = self.conn()?;
        let result = sqlx::query(
            "UPDATE jobflow_incidents SET resolved_at = $2 WHERE job_id = $1 AND resolved_at IS NULL",
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("resolve_incidents", e))?;
        Ok(result.rows_affected() as usize)
    }
}

impl Transaction for PostgresTransaction {
    fn load_job(&mut self, id: JobId) -> Result<Job, JobStoreError> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.load(id))
    }

    fn insert_job(&mut self, job: Job) -> Result<(), JobStoreError> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.insert(job))
    }

    fn update_job(&mut self, job: &Job) -> Result<(), JobStoreError> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.update(job))
    }

    fn delete_job(&mut self, id: JobId) -> Result<(), JobStoreError> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.delete(id))
    }

    fn record_failure(
        &mut self,
        id: JobId,
        failure: &FailureDetail,
        retries_left: u32,
        new_due_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FailureRecord, JobStoreError> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.fail(id, failure, retries_left, new_due_date, now))
    }

    fn create_incident(
        &mut self,
        job_id: JobId,
        failure: &FailureDetail,
        now: DateTime<Utc>,
    ) -> Result<Incident, JobStoreError> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.open_incident(job_id, failure, now))
    }

    fn resolve_incidents(&mut self, job_id: JobId, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.resolve(job_id, now))
    }

    fn commit(mut self: Box<Self>) -> Result<(), JobStoreError> {
        let tx = self.tx.take().ok_or(JobStoreError::TransactionClosed)?;
        self.runtime
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    fn rollback(mut self: Box<Self>) -> Result<(), JobStoreError> {
        let tx = self.tx.take().ok_or(JobStoreError::TransactionClosed)?;
        self.runtime
            .block_on(tx.rollback())
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    handler_type: String,
    handler_configuration: String,
    process_instance_id: Option<Uuid>,
    exclusive: bool,
    priority: i64,
    due_date: DateTime<Utc>,
    retries: i32,
    retry_schedule: Option<String>,
    failed_attempts: i32,
    lock_owner: Option<String>,
    lock_expiration_time: Option<DateTime<Utc>>,
    suspended: bool,
    exception_message: Option<String>,
    exception_stacktrace: Option<String>,
    created_at: DateTime<Utc>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            handler_type: row.try_get("handler_type")?,
            handler_configuration: row.try_get("handler_configuration")?,
            process_instance_id: row.try_get("process_instance_id")?,
            exclusive: row.try_get("exclusive")?,
            priority: row.try_get("priority")?,
            due_date: row.try_get("due_date")?,
            retries: row.try_get("retries")?,
            retry_schedule: row.try_get("retry_schedule")?,
            failed_attempts: row.try_get("failed_attempts")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_expiration_time: row.try_get("lock_expiration_time")?,
            suspended: row.try_get("suspended")?,
            exception_message: row.try_get("exception_message")?,
            exception_stacktrace: row.try_get("exception_stacktrace")?,
            created_at: row.try_get("created_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = JobId::from_uuid(row.id);
        let retry_schedule = row
            .retry_schedule
            .map(|s| s.parse::<RetrySchedule>())
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("job {id}: {e}")))?;
        let lock_owner = row
            .lock_owner
            .map(LockOwner::new)
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("job {id}: {e}")))?;

        Ok(Job {
            id,
            handler_type: row.handler_type,
            handler_configuration: row.handler_configuration,
            process_instance_id: row.process_instance_id.map(ProcessInstanceId::from_uuid),
            exclusive: row.exclusive,
            priority: row.priority,
            due_date: row.due_date,
            retries: row.retries.max(0) as u32,
            retry_schedule,
            failed_attempts: row.failed_attempts.max(0) as u32,
            lock_owner,
            lock_expiration_time: row.lock_expiration_time,
            suspended: row.suspended,
            exception_message: row.exception_message,
            exception_stacktrace: row.exception_stacktrace,
            created_at: row.created_at,
            version: row.version.max(0) as u64,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error("read_job", e))?
        .try_into()
}

#[derive(Debug)]
struct IncidentRow {
    id: Uuid,
    incident_type: String,
    job_id: Uuid,
    process_instance_id: Option<Uuid>,
    message: String,
    stacktrace: String,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for IncidentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(IncidentRow {
            id: row.try_get("id")?,
            incident_type: row.try_get("incident_type")?,
            job_id: row.try_get("job_id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            message: row.try_get("message")?,
            stacktrace: row.try_get("stacktrace")?,
            created_at: row.try_get("created_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }
}

impl From<IncidentRow> for Incident {
    fn from(row: IncidentRow) -> Self {
        Incident {
            id: IncidentId::from_uuid(row.id),
            incident_type: row.incident_type,
            job_id: JobId::from_uuid(row.job_id),
            process_instance_id: row.process_instance_id.map(ProcessInstanceId::from_uuid),
            message: row.message,
            stacktrace: row.stacktrace,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        }
    }
}

#[derive(Debug)]
struct FailureRow {
    job_id: Uuid,
    attempt: i32,
    message: String,
    stacktrace: String,
    retries_left: i32,
    next_due_date: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for FailureRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(FailureRow {
            job_id: row.try_get("job_id")?,
            attempt: row.try_get("attempt")?,
            message: row.try_get("message")?,
            stacktrace: row.try_get("stacktrace")?,
            retries_left: row.try_get("retries_left")?,
            next_due_date: row.try_get("next_due_date")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl From<FailureRow> for FailureRecord {
    fn from(row: FailureRow) -> Self {
        FailureRecord {
            job_id: JobId::from_uuid(row.job_id),
            attempt: row.attempt.max(0) as u32,
            message: row.message,
            stacktrace: row.stacktrace,
            retries_left: row.retries_left.max(0) as u32,
            next_due_date: row.next_due_date,
            recorded_at: row.recorded_at,
        }
    }
}

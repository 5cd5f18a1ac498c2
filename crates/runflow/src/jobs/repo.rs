use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::EngineError;
use crate::jobs::model::{Job, JobStatus};
use crate::jobs::params::RunParams;

/// Durable, concurrency-safe state for all jobs. The claim operation is the
/// single point of coordination between concurrent workers; no in-process
/// locking exists anywhere else.
#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

/// Snapshot of job counts by status, served by `GET /metrics`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub canceled: i64,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    /// Insert a new job in `queued` status.
    ///
    /// The `uq_jobs_active` partial unique index is the authoritative
    /// idempotency backstop: a duplicate active (job_type, period, q)
    /// surfaces as `EngineError::Conflict` no matter how the insert raced
    /// against the caller's `exists_active` pre-check.
    pub async fn enqueue(
        &self,
        job_type: &str,
        params: &RunParams,
        params_json: Value,
    ) -> Result<Uuid, EngineError> {
        let rec = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO jobs (job_type, period, q, params, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(job_type)
        .bind(&params.period)
        .bind(&params.q)
        .bind(&params_json)
        .bind(JobStatus::Queued.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_enqueue_error(e, job_type, params))?;

        Ok(rec)
    }

    /// Point-in-time check for an active run with the same idempotency key.
    /// Advisory only — a race window remains between this check and a
    /// concurrent `enqueue`, closed by the unique index.
    pub async fn exists_active(
        &self,
        job_type: &str,
        period: &str,
        q: &str,
    ) -> Result<bool, EngineError> {
        let found = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM jobs
            WHERE job_type = $1
              AND period = $2
              AND q = $3
              AND status IN ('queued', 'running')
            "#,
        )
        .bind(job_type)
        .bind(period)
        .bind(q)
        .fetch_one(&self.pool)
        .await?;

        Ok(found > 0)
    }

    // ----------------------------
    // Claim
    // ----------------------------

    /// Atomically claim the oldest queued job.
    ///
    /// `FOR UPDATE SKIP LOCKED` makes concurrent claimers partition the
    /// queue: a row mid-claim in another transaction is invisible here, so
    /// two workers can never claim the same job and never wait on each
    /// other. An empty (or fully locked) queue returns `None` without side
    /// effects.
    pub async fn claim_one(&self) -> Result<Option<Job>, EngineError> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'queued'
            ORDER BY created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let claimed = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = now(),
                attempt = attempt + 1
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(claimed))
    }

    // ----------------------------
    // State transitions
    // ----------------------------
    // Every terminal transition is guarded by the current status so the
    // state machine stays monotone: a canceled job cannot be resurrected by
    // a late mark_* from its worker, and repeating the same terminal mark is
    // a harmless overwrite of finished_at.

    pub async fn mark_succeeded(&self, job_id: Uuid, log_path: &str) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                log_path = $2,
                error = NULL,
                finished_at = now()
            WHERE id = $1
              AND status IN ('running', 'succeeded')
            "#,
        )
        .bind(job_id)
        .bind(log_path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_failed(
        &self,
        job_id: Uuid,
        log_path: Option<&str>,
        error: &str,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                log_path = $2,
                error = $3,
                finished_at = now()
            WHERE id = $1
              AND status IN ('running', 'failed')
            "#,
        )
        .bind(job_id)
        .bind(log_path)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Transition to `canceled`, permitted only from `queued` or `running`.
    /// Returns whether a transition happened; a job already terminal (or
    /// missing) is a no-op, not an error.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, EngineError> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'canceled',
                finished_at = now()
            WHERE id = $1
              AND status IN ('queued', 'running')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn find(&self, job_id: Uuid) -> Result<Option<Job>, EngineError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn counts_by_status(&self) -> Result<StatusCounts, EngineError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status.as_str() {
                "queued" => counts.queued = n,
                "running" => counts.running = n,
                "succeeded" => counts.succeeded = n,
                "failed" => counts.failed = n,
                "canceled" => counts.canceled = n,
                _ => {}
            }
        }
        Ok(counts)
    }
}

/// Postgres unique-violation (SQLSTATE 23505) on the active-run index means
/// the caller lost an enqueue race; everything else is a storage error.
fn classify_enqueue_error(err: sqlx::Error, job_type: &str, params: &RunParams) -> EngineError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505")
            && db_err.constraint() == Some("uq_jobs_active")
        {
            return EngineError::Conflict {
                job_type: job_type.to_string(),
                period: params.period.clone(),
                q: params.q.clone(),
            };
        }
    }
    EngineError::Storage(err)
}

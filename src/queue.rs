//! Durable, priority-ordered job queue backed by the `jobs` table.
//!
//! Delivery is at-least-once: a claimed job holds a lease, and a job whose
//! lease runs out (worker crash) becomes claimable again while it still has
//! attempts left. If the lease of its last attempt runs out instead, the job
//! is dead-lettered. Failed jobs are retried with exponential backoff and
//! dead-lettered once their attempts are spent.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{types::Json, PgPool, Row};
use tracing::{debug, error, warn};

use crate::config::QueueConfig;
use crate::error::AppError;
use crate::types::NewJob;

pub const DEFAULT_PRIORITY: i32 = 2;

/// `last_error` of a job whose worker never reported back on its last attempt.
pub const LEASE_EXPIRED: &str = "lease expired";

/// A job claimed by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: i64,
    pub job_type: String,
    pub payload: Value,
    /// Includes the current delivery.
    pub attempts: i32,
    pub max_attempts: i32,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Retry { after: Duration },
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.backoff_base,
            max_delay: config.backoff_max,
        }
    }

    /// Delay before the next delivery after `attempt` failed: `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    pub fn disposition(&self, attempts: i32, max_attempts: i32) -> JobDisposition {
        if attempts >= max_attempts {
            JobDisposition::DeadLetter
        } else {
            JobDisposition::Retry {
                after: self.backoff(attempts),
            }
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a job and return its id.
    async fn push(&self, job: NewJob) -> Result<i64, AppError>;

    /// Claim the next eligible job, if any.
    async fn claim(&self) -> Result<Option<QueuedJob>, AppError>;

    async fn complete(&self, job_id: i64) -> Result<(), AppError>;

    /// Record a failed attempt; retries or dead-letters depending on attempts left.
    async fn fail(&self, job: &QueuedJob, reason: &str) -> Result<JobDisposition, AppError>;

    /// Dead-letter a job immediately, without further attempts.
    async fn bury(&self, job_id: i64, reason: &str) -> Result<(), AppError>;

    /// Enqueue without ever failing the caller. Returns `false` when the job
    /// could not be stored.
    async fn enqueue(&self, job: NewJob) -> bool {
        let job_type = job.data.job_type();
        match self.push(job).await {
            Ok(job_id) => {
                debug!(job_id, job_type = job_type.as_str(), "job enqueued");
                true
            }
            Err(err) => {
                error!(job_type = job_type.as_str(), error = %err, "error enqueueing job");
                false
            }
        }
    }
}

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    policy: RetryPolicy,
    lock_timeout: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, config: &QueueConfig) -> Self {
        Self {
            pool,
            policy: RetryPolicy::from_config(config),
            lock_timeout: config.lock_timeout,
        }
    }

    /// Dead-letter jobs whose lease ran out during their last allowed attempt.
    async fn reap_expired(&self) -> Result<u64, AppError> {
        let reaped = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'dead',
                locked_until = NULL,
                last_error = $1,
                updated_at = now()
            WHERE status = 'processing' AND locked_until < now() AND attempts >= max_attempts
            "#,
        )
        .bind(LEASE_EXPIRED)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if reaped > 0 {
            warn!(reaped, "dead-lettered jobs whose final lease expired");
        }
        Ok(reaped)
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn push(&self, job: NewJob) -> Result<i64, AppError> {
        let delay = job.delay.unwrap_or_default();
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO jobs (job_type, payload, priority, max_attempts, available_at)
            VALUES ($1, $2, $3, $4, now() + make_interval(secs => $5))
            RETURNING id
            "#,
        )
        .bind(job.data.job_type().as_str())
        .bind(Json(&job.data))
        .bind(job.priority.unwrap_or(DEFAULT_PRIORITY))
        .bind(self.policy.max_attempts)
        .bind(delay.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<QueuedJob>, AppError> {
        self.reap_expired().await?;
        let row = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'processing',
                attempts = attempts + 1,
                locked_until = now() + make_interval(secs => $1),
                updated_at = now()
            WHERE id = (
                SELECT id FROM jobs
                WHERE (status = 'pending' AND available_at <= now())
                   OR (status = 'processing' AND locked_until < now() AND attempts < max_attempts)
                ORDER BY priority ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, job_type, payload, attempts, max_attempts
            "#,
        )
        .bind(self.lock_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(QueuedJob {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get::<Json<Value>, _>("payload")?.0,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
        }))
    }

    async fn complete(&self, job_id: i64) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', locked_until = NULL, updated_at = now() \
             WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, reason: &str) -> Result<JobDisposition, AppError> {
        let disposition = self.policy.disposition(job.attempts, job.max_attempts);
        match disposition {
            JobDisposition::Retry { after } => {
                sqlx::query(
                    r#"
                    UPDATE jobs SET
                        status = 'pending',
                        available_at = now() + make_interval(secs => $2),
                        locked_until = NULL,
                        last_error = $3,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(job.id)
                .bind(after.as_secs_f64())
                .bind(reason)
                .execute(&self.pool)
                .await?;
            }
            JobDisposition::DeadLetter => self.bury(job.id, reason).await?,
        }
        Ok(disposition)
    }

    async fn bury(&self, job_id: i64, reason: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE jobs SET status = 'dead', locked_until = NULL, last_error = $2, \
             updated_at = now() WHERE id = $1",
        )
        .bind(job_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

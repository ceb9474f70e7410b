//! Queue consumer: claims jobs one at a time and dispatches them by type.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::qualification::QualificationHandler;
use crate::queue::{JobDisposition, JobQueue, QueuedJob};
use crate::types::{JobData, JobType};

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<QualificationHandler>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<QualificationHandler>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            handler,
            poll_interval,
        }
    }

    /// Poll until cancelled. A job in flight is finished before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let idle = match self.process_next().await {
                Ok(processed) => !processed,
                Err(err) => {
                    error!(error = %err, "worker failed to process queue");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        info!("worker stopped");
    }

    /// Claim and process one job. Returns `false` when the queue had nothing ready.
    pub async fn process_next(&self) -> Result<bool, AppError> {
        let Some(job) = self.queue.claim().await? else {
            return Ok(false);
        };
        debug!(job_id = job.id, job_type = %job.job_type, attempt = job.attempts, "job claimed");

        if job.job_type.parse::<JobType>().is_err() {
            error!(job_id = job.id, job_type = %job.job_type, "unknown job type, dropping");
            self.queue.complete(job.id).await?;
            return Ok(true);
        }

        let data = match serde_json::from_value::<JobData>(job.payload.clone()) {
            Ok(data) => data,
            Err(err) => {
                error!(job_id = job.id, error = %err, "undecodable job payload");
                self.queue.bury(job.id, &err.to_string()).await?;
                return Ok(true);
            }
        };

        match self.dispatch(&data).await {
            Ok(()) => {
                self.queue.complete(job.id).await?;
                info!(job_id = job.id, job_type = %job.job_type, "job completed");
            }
            Err(err) => self.retry_or_bury(&job, &err).await?,
        }
        Ok(true)
    }

    async fn dispatch(&self, data: &JobData) -> Result<(), AppError> {
        match data {
            JobData::ProcessMessage(job) => {
                let outcome = self.handler.handle(job).await?;
                debug!(session_id = %job.session_id, ?outcome, "message processed");
                Ok(())
            }
        }
    }

    async fn retry_or_bury(&self, job: &QueuedJob, err: &AppError) -> Result<(), AppError> {
        match self.queue.fail(job, &err.to_string()).await? {
            JobDisposition::Retry { after } => warn!(
                job_id = job.id,
                attempt = job.attempts,
                retry_in_ms = after.as_millis() as u64,
                error = %err,
                "job failed, will retry"
            ),
            JobDisposition::DeadLetter => error!(
                job_id = job.id,
                attempts = job.attempts,
                error = %err,
                "job failed permanently"
            ),
        }
        Ok(())
    }
}

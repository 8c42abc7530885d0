//! Import worker
//!
//! Claims runnable jobs atomically and drives each one to a terminal state.
//! Several workers may poll the same store; a job is only ever claimed by
//! one of them at a time.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::scheduler::ChunkScheduler;
use super::types::JobStatus;
use crate::error::ImportResult;

pub struct ImportWorker {
    worker_id: Uuid,
    scheduler: Arc<ChunkScheduler>,
}

impl ImportWorker {
    pub fn new(scheduler: Arc<ChunkScheduler>) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            scheduler,
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Claim one job and run it to completion; `None` when nothing was runnable
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn run_once(&self) -> ImportResult<Option<(Uuid, JobStatus)>> {
        let stale_after = self.scheduler.config().stale_after();
        let Some(job_id) = self.scheduler.jobs().claim_next(stale_after).await? else {
            return Ok(None);
        };

        info!(%job_id, "Claimed import job");
        let status = self.scheduler.run_to_completion(job_id).await?;
        info!(%job_id, status = status.as_str(), "Import job finished");

        Ok(Some((job_id, status)))
    }

    /// Poll until `shutdown` turns true. A job in flight is always finished
    /// before the worker stops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ImportResult<()> {
        let poll_interval = self.scheduler.config().poll_interval();
        info!(worker_id = %self.worker_id, "Import worker started");

        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    error!(worker_id = %self.worker_id, error = %err, "Import job errored");
                    true
                },
            };

            if idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    },
                    _ = tokio::time::sleep(poll_interval) => {},
                }
            }
        }

        info!(worker_id = %self.worker_id, "Import worker stopped");
        Ok(())
    }
}

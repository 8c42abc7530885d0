//! Chunk scheduler: the job state machine
//!
//! `pending -> processing (slice 1..n) -> refreshing_downstream -> completed`,
//! with `failed` reachable from any processing slice and `cancelled` set
//! externally and observed cooperatively.
//!
//! Every slice rehydrates the processing context from the job's checkpoint,
//! drives the stream from the saved byte offset, and then either checkpoints
//! (execution cutoff), finalizes (input consumed or quotas reached), or stops
//! (cancelled). Retrying a slice replays the same byte range from the last
//! checkpoint; the deduplicating writes make that replay idempotent.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use super::branches::BranchDirectory;
use super::driver::{SliceOutcome, SliceStop, StreamDriver};
use super::job_store::JobStore;
use super::materialize::Materializer;
use super::persister::BatchPersister;
use super::sink::{RecordSink, WriteScope};
use super::source::SourceReader;
use super::types::{progress_for, JobRecord, JobStatus};
use crate::config::ImportConfig;
use crate::error::{ImportError, ImportResult};
use crate::ledger::{BlockQuotas, ProcessingContext};

/// What the caller should do after a slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceResult {
    /// Input remains; run another slice
    Continue,
    /// A recoverable error interrupted the slice; run it again after `delay`
    Retry { delay: Duration, error: String },
    /// The job reached this status and needs no further slices
    Finished(JobStatus),
}

pub struct ChunkScheduler {
    jobs: Arc<dyn JobStore>,
    sink: Arc<dyn RecordSink>,
    branches: Arc<dyn BranchDirectory>,
    source: Arc<dyn SourceReader>,
    materializer: Arc<dyn Materializer>,
    config: ImportConfig,
}

impl ChunkScheduler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        sink: Arc<dyn RecordSink>,
        branches: Arc<dyn BranchDirectory>,
        source: Arc<dyn SourceReader>,
        materializer: Arc<dyn Materializer>,
        config: ImportConfig,
    ) -> Self {
        Self {
            jobs,
            sink,
            branches,
            source,
            materializer,
            config,
        }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Run slices until the job is finished, retrying transport failures
    /// from the last checkpoint up to the configured bound
    #[instrument(skip(self))]
    pub async fn run_to_completion(&self, job_id: Uuid) -> ImportResult<JobStatus> {
        let mut consecutive_retries = 0u32;

        loop {
            match self.run_slice(job_id).await? {
                SliceResult::Continue => consecutive_retries = 0,
                SliceResult::Finished(status) => return Ok(status),
                SliceResult::Retry { delay, error } => {
                    consecutive_retries += 1;
                    if consecutive_retries > self.config.max_transport_retries {
                        error!(
                            %job_id,
                            retries = self.config.max_transport_retries,
                            error = %error,
                            "Transport retries exhausted"
                        );
                        let mut job = self.jobs.load(job_id).await?;
                        job.mark_failed(format!(
                            "transport failed {} times in a row: {}",
                            consecutive_retries, error
                        ));
                        let saved = self.jobs.save(&job).await?;
                        return Ok(if saved {
                            JobStatus::Failed
                        } else {
                            JobStatus::Cancelled
                        });
                    }

                    warn!(
                        %job_id,
                        attempt = consecutive_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying slice from last checkpoint"
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    /// Run exactly one slice of the job
    pub async fn run_slice(&self, job_id: Uuid) -> ImportResult<SliceResult> {
        let mut job = self.jobs.load(job_id).await?;

        match job.status {
            status if status.is_terminal() => {
                info!(%job_id, status = status.as_str(), "Job already finished, nothing to do");
                return Ok(SliceResult::Finished(status));
            },
            JobStatus::RefreshingDownstream => {
                return self.finalize(job).await.map(SliceResult::Finished);
            },
            JobStatus::Pending => {
                job.status = JobStatus::Processing;
                if !self.jobs.save(&job).await? {
                    return Ok(SliceResult::Finished(JobStatus::Cancelled));
                }
                info!(%job_id, file = %job.file_name, "Import started");
            },
            _ => {},
        }

        let resumable = job.chunk_number > 0 || job.bytes_processed > 0;
        let span = info_span!("slice", job_id = %job.id, chunk = job.chunk_number);

        match self.process(&mut job).instrument(span).await {
            Ok(result) => Ok(result),
            Err(err) if err.is_recoverable() && resumable => {
                warn!(%job_id, error = %err, "Recoverable failure, slice will be retried");
                Ok(SliceResult::Retry {
                    delay: self.config.retry_delay(),
                    error: err.to_string(),
                })
            },
            Err(err) => {
                error!(%job_id, error = %err, "Import failed");
                job.mark_failed(err.to_string());
                let saved = self.jobs.save(&job).await?;
                Ok(SliceResult::Finished(if saved {
                    JobStatus::Failed
                } else {
                    JobStatus::Cancelled
                }))
            },
        }
    }

    async fn process(&self, job: &mut JobRecord) -> ImportResult<SliceResult> {
        let mut ctx = ProcessingContext::restore(job.counts.checkpoint.as_ref())?
            .with_default_branch(job.branch_id);
        ctx.load_branches(self.branches.load_all(job.company_id).await?);

        let mut quotas =
            BlockQuotas::for_scope(job.scope(), job.record_limit).with_used(&job.counts.emitted);

        let scope = WriteScope {
            company_id: job.company_id,
            job_id: job.id,
        };
        let mut persister = BatchPersister::new(self.sink.as_ref(), scope, self.config.batch_size);

        let offset = u64::try_from(job.bytes_processed)
            .map_err(|_| ImportError::Config(format!("negative offset {}", job.bytes_processed)))?;
        let mut outcome = SliceOutcome::starting_at(offset);

        let driven = self
            .drive(job, &mut ctx, &mut quotas, &mut persister, &mut outcome)
            .await;
        job.counts.add_inserted(persister.written());
        if let Err(err) = driven {
            // A retry reloads the job, so this only survives if the job fails
            record_partial(job, &outcome, &quotas);
            job.counts.checkpoint = None;
            return Err(err);
        }

        match outcome.stop {
            SliceStop::Cancelled => {
                info!(job_id = %job.id, "Import cancelled");
                Ok(SliceResult::Finished(JobStatus::Cancelled))
            },
            stop if stop.is_cutoff() => {
                record_slice(job, &outcome, &quotas);
                job.counts.checkpoint = Some(ctx.snapshot()?);

                if !self.jobs.save(job).await? {
                    return Ok(SliceResult::Finished(JobStatus::Cancelled));
                }

                info!(
                    job_id = %job.id,
                    next_chunk = job.chunk_number,
                    bytes_processed = job.bytes_processed,
                    progress = job.progress,
                    "Checkpoint saved"
                );
                Ok(SliceResult::Continue)
            },
            _ => {
                record_slice(job, &outcome, &quotas);
                job.counts.checkpoint = None;
                job.status = JobStatus::RefreshingDownstream;

                if !self.jobs.save(job).await? {
                    return Ok(SliceResult::Finished(JobStatus::Cancelled));
                }

                let status = self.finalize(job.clone()).await?;
                Ok(SliceResult::Finished(status))
            },
        }
    }

    /// Open the source, drive it, and flush according to the stop reason
    async fn drive(
        &self,
        job: &JobRecord,
        ctx: &mut ProcessingContext,
        quotas: &mut BlockQuotas,
        persister: &mut BatchPersister<'_>,
        outcome: &mut SliceOutcome,
    ) -> ImportResult<()> {
        let stream = self.source.open(&job.file_path, outcome.bytes_processed).await?;

        let driver = StreamDriver::new(
            job,
            self.jobs.as_ref(),
            self.branches.as_ref(),
            &self.config,
        );
        driver.run(stream, ctx, quotas, persister, outcome).await?;

        match outcome.stop {
            SliceStop::Cancelled => {},
            stop if stop.is_cutoff() => persister.flush_all().await?,
            _ => {
                // Input is over: unterminated aggregates are complete as they are
                for record in ctx.drain_pending() {
                    persister.push_ledger(record).await?;
                }
                persister.flush_all().await?;
            },
        }

        Ok(())
    }

    /// Trigger downstream materialization and complete the job
    async fn finalize(&self, mut job: JobRecord) -> ImportResult<JobStatus> {
        if let Err(err) = self.materializer.refresh(&job).await {
            warn!(job_id = %job.id, error = %err, "Downstream materialization failed");
            job.counts.downstream_error = Some(err.to_string());
        }

        job.status = JobStatus::Completed;
        job.advance_progress(100);

        if !self.jobs.save(&job).await? {
            return Ok(JobStatus::Cancelled);
        }

        info!(
            job_id = %job.id,
            chunks = job.chunk_number,
            lines = job.total_lines_processed,
            rows = job.counts.total_inserted(),
            "Import completed"
        );
        Ok(JobStatus::Completed)
    }
}

/// Fold a finished slice into the job's cumulative state
fn record_slice(job: &mut JobRecord, outcome: &SliceOutcome, quotas: &BlockQuotas) {
    record_partial(job, outcome, quotas);
    job.chunk_number += 1;
}

/// Counters and progress of the lines consumed so far
fn record_partial(job: &mut JobRecord, outcome: &SliceOutcome, quotas: &BlockQuotas) {
    job.bytes_processed = outcome.bytes_processed as i64;
    job.total_lines_processed += outcome.lines_read as i64;
    job.counts.add_lines(&outcome.lines_by_tag);
    job.counts.dropped += outcome.dropped;
    job.counts.emitted = quotas.used().clone();
    job.advance_progress(progress_for(job.bytes_processed, job.file_size));
}

//! Stream driver: one bounded pass over the source
//!
//! Reads the source line by line from the checkpoint offset, runs every line
//! through the classifier and decoders, applies branch directives, enforces
//! block quotas, and hands rows to the persister. The driver decides when a
//! slice stops; deciding what happens next is the scheduler's job.

use std::collections::BTreeMap;

use efd_common::text::decode_latin1;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::branches::BranchDirectory;
use super::job_store::JobStore;
use super::persister::BatchPersister;
use super::source::SourceStream;
use super::types::{progress_for, JobRecord, JobStatus};
use crate::config::ImportConfig;
use crate::error::ImportResult;
use crate::ledger::{
    classify, decode, line_tag, BlockQuotas, BranchDirective, CounterpartyRow, Decoded,
    ImportScope, ProcessingContext, RecordKind, Row,
};

/// Why a slice stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStop {
    /// The source is exhausted
    EndOfInput,
    TimeBudget,
    LineBudget,
    /// Every quota-bounded family is full and no aggregate is open
    QuotaReached,
    /// The job was cancelled externally
    Cancelled,
}

impl SliceStop {
    /// Execution cutoffs leave input behind for another slice
    pub fn is_cutoff(&self) -> bool {
        matches!(self, SliceStop::TimeBudget | SliceStop::LineBudget)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SliceStop::EndOfInput => "end_of_input",
            SliceStop::TimeBudget => "time_budget",
            SliceStop::LineBudget => "line_budget",
            SliceStop::QuotaReached => "quota_reached",
            SliceStop::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceOutcome {
    pub stop: SliceStop,
    /// Absolute offset just past the last fully consumed line
    pub bytes_processed: u64,
    pub lines_read: u64,
    pub lines_by_tag: BTreeMap<String, u64>,
    /// Classified lines that failed to decode
    pub dropped: u64,
    /// Records refused by their quota
    pub refused: u64,
}

impl SliceOutcome {
    /// Nothing read yet; the stream resumes at `offset`
    pub fn starting_at(offset: u64) -> Self {
        Self {
            stop: SliceStop::EndOfInput,
            bytes_processed: offset,
            lines_read: 0,
            lines_by_tag: BTreeMap::new(),
            dropped: 0,
            refused: 0,
        }
    }
}

pub struct StreamDriver<'a> {
    jobs: &'a dyn JobStore,
    branches: &'a dyn BranchDirectory,
    config: &'a ImportConfig,
    job_id: Uuid,
    company_id: Uuid,
    file_size: i64,
    scope: ImportScope,
}

impl<'a> StreamDriver<'a> {
    pub fn new(
        job: &JobRecord,
        jobs: &'a dyn JobStore,
        branches: &'a dyn BranchDirectory,
        config: &'a ImportConfig,
    ) -> Self {
        Self {
            jobs,
            branches,
            config,
            job_id: job.id,
            company_id: job.company_id,
            file_size: job.file_size,
            scope: job.scope(),
        }
    }

    /// Drive one slice, counting into `outcome` as lines are consumed.
    ///
    /// `stream` must start at `outcome.bytes_processed`. On error `outcome`
    /// still holds every line consumed before the failure. Pending aggregates
    /// stay open in `ctx` whatever the stop reason; the caller decides
    /// whether to flush them or checkpoint them.
    pub async fn run(
        &self,
        stream: SourceStream,
        ctx: &mut ProcessingContext,
        quotas: &mut BlockQuotas,
        persister: &mut BatchPersister<'_>,
        outcome: &mut SliceOutcome,
    ) -> ImportResult<()> {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(1024);
        let started = Instant::now();
        let time_budget = self.config.time_budget();

        if ctx.period.is_some() {
            push_sentinels(persister).await?;
        }

        let stop = loop {
            if self.config.slice_line_budget > 0 && outcome.lines_read >= self.config.slice_line_budget
            {
                break SliceStop::LineBudget;
            }
            if started.elapsed() >= time_budget {
                break SliceStop::TimeBudget;
            }
            if quotas.exhausted() && !ctx.has_pending() {
                break SliceStop::QuotaReached;
            }

            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).await?;
            if read == 0 {
                break SliceStop::EndOfInput;
            }
            outcome.bytes_processed += read as u64;
            outcome.lines_read += 1;

            let line = decode_latin1(&buf);
            self.process_line(&line, ctx, quotas, persister, outcome)
                .await?;

            if outcome.lines_read % self.config.cancel_check_interval == 0
                && self.jobs.current_status(self.job_id).await? == JobStatus::Cancelled
            {
                break SliceStop::Cancelled;
            }

            if outcome.lines_read % self.config.progress_interval == 0 {
                let progress = progress_for(outcome.bytes_processed as i64, self.file_size);
                self.jobs
                    .report_progress(self.job_id, outcome.bytes_processed as i64, progress)
                    .await?;
            }
        };
        outcome.stop = stop;

        info!(
            stop = stop.as_str(),
            lines = outcome.lines_read,
            bytes_processed = outcome.bytes_processed,
            dropped = outcome.dropped,
            refused = outcome.refused,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Slice stopped"
        );

        Ok(())
    }

    async fn process_line(
        &self,
        line: &str,
        ctx: &mut ProcessingContext,
        quotas: &mut BlockQuotas,
        persister: &mut BatchPersister<'_>,
        outcome: &mut SliceOutcome,
    ) -> ImportResult<()> {
        if let Some(tag) = line_tag(line) {
            *outcome.lines_by_tag.entry(tag.to_string()).or_insert(0) += 1;
        }

        let Some(classified) = classify(line, self.scope) else {
            return Ok(());
        };
        let kind = classified.kind;

        // Once every quota is full, the next non-auxiliary line closes the
        // remaining aggregates so the slice can stop
        if quotas.exhausted() && ctx.has_pending() && !kind.is_auxiliary() {
            for record in ctx.drain_pending() {
                persister.push_ledger(record).await?;
            }
        }

        let decoded = match decode(kind, &classified.fields, ctx) {
            Ok(decoded) => decoded,
            Err(err) => {
                outcome.dropped += 1;
                warn!(line = outcome.lines_read, error = %err, "Dropping line");
                return Ok(());
            },
        };

        match decoded {
            Decoded::Skip => {},
            Decoded::Updated => {
                if kind == RecordKind::Header {
                    push_sentinels(persister).await?;
                }
            },
            Decoded::Emit(Row::Counterparty(row)) => persister.push_counterparty(row).await?,
            Decoded::Emit(Row::Ledger(record)) => {
                if quotas.try_take(record.family) {
                    persister.push_ledger(record).await?;
                } else {
                    outcome.refused += 1;
                }
            },
            Decoded::Open(record) => {
                if let Some(previous) = ctx.take_pending(record.family) {
                    persister.push_ledger(previous).await?;
                }
                if quotas.try_take(record.family) {
                    ctx.open_pending(record);
                } else {
                    outcome.refused += 1;
                }
            },
            Decoded::Accumulate {
                family,
                pis,
                cofins,
            } => match ctx.pending_mut(family) {
                Some(slot) => {
                    slot.pis += pis;
                    slot.cofins += cofins;
                },
                None => {
                    debug!(line = outcome.lines_read, %kind, "Sub-total without an open document");
                },
            },
            Decoded::Branch(directive) => {
                let spec = directive.spec();
                let id = self.branches.ensure_branch(self.company_id, spec).await?;
                ctx.activate_branch(&spec.document, id);

                if let BranchDirective::Fallback(_) = directive {
                    info!(
                        document = %spec.document,
                        branch_id = %id,
                        "Branch created from an entity switch without registry record"
                    );
                }
            },
        }

        Ok(())
    }
}

async fn push_sentinels(persister: &mut BatchPersister<'_>) -> ImportResult<()> {
    for row in CounterpartyRow::sentinels() {
        persister.push_counterparty(row).await?;
    }
    Ok(())
}

//! In-memory implementations of the framework traits
//!
//! Used by the test suites and for dry runs. They honour the same contracts
//! as the Postgres adapters: guarded job saves, last-wins upserts keyed on
//! the natural key, and best-effort inserts for destinations configured
//! without a uniqueness constraint.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ImportError, ImportResult, WriteError};
use crate::framework::{
    BranchDirectory, JobRecord, JobStatus, JobStore, Materializer, RecordSink, RowBatch,
    SourceReader, SourceStream, WriteScope,
};
use crate::ledger::{BranchSpec, CounterpartyRow, Destination, Family, LedgerRecord};

// ============================================================================
// Job store
// ============================================================================

#[derive(Default)]
struct JobState {
    jobs: HashMap<Uuid, JobRecord>,
    status_checks: u64,
    /// Flip a job to `cancelled` once this many status checks happened
    cancel_after: Option<(Uuid, u64)>,
    progress_reports: Vec<(Uuid, i64, i32)>,
    saves: u64,
}

#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<JobState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: JobRecord) {
        self.state.lock().await.jobs.insert(job.id, job);
    }

    pub async fn get(&self, job_id: Uuid) -> Option<JobRecord> {
        self.state.lock().await.jobs.get(&job_id).cloned()
    }

    /// External status change, bypassing the cancellation guard
    pub async fn set_status(&self, job_id: Uuid, status: JobStatus) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&job_id) {
            job.status = status;
        }
    }

    /// Simulate an external cancellation arriving mid-slice
    pub async fn cancel_after_checks(&self, job_id: Uuid, checks: u64) {
        let mut state = self.state.lock().await;
        let deadline = state.status_checks + checks;
        state.cancel_after = Some((job_id, deadline));
    }

    pub async fn progress_reports(&self) -> Vec<(Uuid, i64, i32)> {
        self.state.lock().await.progress_reports.clone()
    }

    pub async fn saves(&self) -> u64 {
        self.state.lock().await.saves
    }

    /// Backdate `updated_at` so the job looks abandoned
    pub async fn touch_back(&self, job_id: Uuid, by: Duration) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&job_id) {
            if let Ok(by) = chrono::Duration::from_std(by) {
                job.updated_at -= by;
            }
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self, job_id: Uuid) -> ImportResult<JobRecord> {
        self.get(job_id).await.ok_or(ImportError::JobNotFound(job_id))
    }

    async fn current_status(&self, job_id: Uuid) -> ImportResult<JobStatus> {
        let mut state = self.state.lock().await;
        state.status_checks += 1;

        if let Some((target, deadline)) = state.cancel_after {
            if target == job_id && state.status_checks >= deadline {
                if let Some(job) = state.jobs.get_mut(&job_id) {
                    job.status = JobStatus::Cancelled;
                }
                state.cancel_after = None;
            }
        }

        state
            .jobs
            .get(&job_id)
            .map(|job| job.status)
            .ok_or(ImportError::JobNotFound(job_id))
    }

    async fn save(&self, job: &JobRecord) -> ImportResult<bool> {
        let mut state = self.state.lock().await;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or(ImportError::JobNotFound(job.id))?;

        if stored.status == JobStatus::Cancelled {
            return Ok(false);
        }

        let progress = stored.progress.max(job.progress);
        *stored = job.clone();
        stored.progress = progress;
        stored.updated_at = Utc::now();
        state.saves += 1;
        Ok(true)
    }

    async fn report_progress(
        &self,
        job_id: Uuid,
        bytes_processed: i64,
        progress: i32,
    ) -> ImportResult<()> {
        let mut state = self.state.lock().await;
        state.progress_reports.push((job_id, bytes_processed, progress));
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Processing {
                job.progress = job.progress.max(progress);
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn claim_next(&self, stale_after: Duration) -> ImportResult<Option<Uuid>> {
        let mut state = self.state.lock().await;
        let stale_before = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());

        let candidate = state
            .jobs
            .values()
            .filter(|job| match job.status {
                JobStatus::Pending => true,
                JobStatus::Processing | JobStatus::RefreshingDownstream => {
                    job.updated_at < stale_before
                },
                _ => false,
            })
            .min_by_key(|job| job.created_at)
            .map(|job| job.id);

        if let Some(job_id) = candidate {
            if let Some(job) = state.jobs.get_mut(&job_id) {
                if job.status == JobStatus::Pending {
                    job.status = JobStatus::Processing;
                }
                job.updated_at = Utc::now();
            }
        }

        Ok(candidate)
    }
}

// ============================================================================
// Record sink
// ============================================================================

#[derive(Default)]
struct SinkState {
    counterparties: Vec<CounterpartyRow>,
    ledger: BTreeMap<Family, Vec<LedgerRecord>>,
    unconstrained: HashSet<Destination>,
    failing: HashSet<Destination>,
    disconnects: HashMap<Destination, usize>,
    upserts: HashMap<Destination, usize>,
    log: Vec<Destination>,
}

impl SinkState {
    fn check(&mut self, destination: Destination) -> Result<(), WriteError> {
        if let Some(left) = self.disconnects.get_mut(&destination) {
            if *left > 0 {
                *left -= 1;
                return Err(WriteError::Transport(format!(
                    "connection lost while writing {}",
                    destination.table()
                )));
            }
        }
        if self.failing.contains(&destination) {
            return Err(WriteError::Failed(format!("{} is unavailable", destination.table())));
        }
        Ok(())
    }

    fn write(&mut self, batch: RowBatch<'_>, replace: bool) -> u64 {
        let mut written = 0;
        match batch {
            RowBatch::Counterparties(rows) => {
                for row in rows {
                    match self.counterparties.iter().position(|c| c.code == row.code) {
                        Some(index) if replace => {
                            self.counterparties[index] = row.clone();
                            written += 1;
                        },
                        Some(_) => {},
                        None => {
                            self.counterparties.push(row.clone());
                            written += 1;
                        },
                    }
                }
            },
            RowBatch::Ledger(family, rows) => {
                let stored = self.ledger.entry(family).or_default();
                for record in rows {
                    let key = record.dedup_key();
                    match stored.iter().position(|r| r.dedup_key() == key) {
                        Some(index) if replace => {
                            stored[index] = record.clone();
                            written += 1;
                        },
                        Some(_) => {},
                        None => {
                            stored.push(record.clone());
                            written += 1;
                        },
                    }
                }
            },
        }
        written
    }

    fn append(&mut self, batch: RowBatch<'_>) -> u64 {
        match batch {
            RowBatch::Counterparties(rows) => self.counterparties.extend_from_slice(rows),
            RowBatch::Ledger(family, rows) => {
                self.ledger.entry(family).or_default().extend_from_slice(rows)
            },
        }
        batch.len() as u64
    }
}

#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The destination behaves like a table without a unique index
    pub fn without_constraint(mut self, destination: Destination) -> Self {
        self.state.get_mut().unconstrained.insert(destination);
        self
    }

    /// Every write to the destination fails
    pub fn failing(mut self, destination: Destination) -> Self {
        self.state.get_mut().failing.insert(destination);
        self
    }

    /// The next `times` writes to the destination lose their connection
    pub fn disconnecting(mut self, destination: Destination, times: usize) -> Self {
        self.state.get_mut().disconnects.insert(destination, times);
        self
    }

    pub async fn ledger(&self, family: Family) -> Vec<LedgerRecord> {
        self.state
            .lock()
            .await
            .ledger
            .get(&family)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn counterparties(&self) -> Vec<CounterpartyRow> {
        self.state.lock().await.counterparties.clone()
    }

    /// Destinations of successful writes, in order
    pub async fn write_log(&self) -> Vec<Destination> {
        self.state.lock().await.log.clone()
    }

    pub async fn upsert_attempts(&self, destination: Destination) -> usize {
        self.state
            .lock()
            .await
            .upserts
            .get(&destination)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn upsert(&self, _scope: &WriteScope, batch: RowBatch<'_>) -> Result<u64, WriteError> {
        let destination = batch.destination();
        let mut state = self.state.lock().await;
        *state.upserts.entry(destination).or_insert(0) += 1;

        state.check(destination)?;
        if state.unconstrained.contains(&destination) {
            return Err(WriteError::MissingConstraint(destination.table().to_string()));
        }

        let written = state.write(batch, true);
        state.log.push(destination);
        Ok(written)
    }

    async fn insert(&self, _scope: &WriteScope, batch: RowBatch<'_>) -> Result<u64, WriteError> {
        let destination = batch.destination();
        let mut state = self.state.lock().await;
        state.check(destination)?;

        let written = if state.unconstrained.contains(&destination) {
            state.append(batch)
        } else {
            state.write(batch, false)
        };
        state.log.push(destination);
        Ok(written)
    }
}

// ============================================================================
// Branch directory
// ============================================================================

#[derive(Default)]
pub struct MemoryBranches {
    branches: Mutex<BTreeMap<(Uuid, String), (Uuid, BranchSpec)>>,
}

impl MemoryBranches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a branch registered before the import
    pub async fn register(&self, company_id: Uuid, document: &str) -> Uuid {
        let spec = BranchSpec {
            document: document.to_string(),
            external_code: None,
            name: None,
            state: None,
            city_code: None,
        };
        let id = Uuid::new_v4();
        self.branches
            .lock()
            .await
            .insert((company_id, document.to_string()), (id, spec));
        id
    }

    pub async fn all(&self, company_id: Uuid) -> Vec<(String, Uuid)> {
        self.branches
            .lock()
            .await
            .iter()
            .filter(|((company, _), _)| *company == company_id)
            .map(|((_, document), (id, _))| (document.clone(), *id))
            .collect()
    }

    pub async fn spec(&self, company_id: Uuid, document: &str) -> Option<BranchSpec> {
        self.branches
            .lock()
            .await
            .get(&(company_id, document.to_string()))
            .map(|(_, spec)| spec.clone())
    }
}

#[async_trait]
impl BranchDirectory for MemoryBranches {
    async fn load_all(&self, company_id: Uuid) -> ImportResult<Vec<(String, Uuid)>> {
        Ok(self.all(company_id).await)
    }

    async fn ensure_branch(&self, company_id: Uuid, spec: &BranchSpec) -> ImportResult<Uuid> {
        let mut branches = self.branches.lock().await;
        let entry = branches
            .entry((company_id, spec.document.clone()))
            .or_insert_with(|| (Uuid::new_v4(), spec.clone()));

        let stored = &mut entry.1;
        stored.external_code = spec.external_code.clone().or(stored.external_code.take());
        stored.name = spec.name.clone().or(stored.name.take());
        stored.state = spec.state.clone().or(stored.state.take());
        stored.city_code = spec.city_code.clone().or(stored.city_code.take());

        Ok(entry.0)
    }
}

// ============================================================================
// Source
// ============================================================================

/// Reader that fails with a connection reset once `fail_at` bytes were served
struct FlakyReader {
    data: Vec<u8>,
    pos: usize,
    fail_at: usize,
}

impl AsyncRead for FlakyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos >= this.fail_at && this.pos < this.data.len() {
            return Poll::Ready(Err(std::io::Error::new(
                ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }

        let end = this.data.len().min(this.fail_at);
        let count = buf.remaining().min(end.saturating_sub(this.pos));
        buf.put_slice(&this.data[this.pos..this.pos + count]);
        this.pos += count;
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
pub struct MemorySource {
    files: HashMap<String, Vec<u8>>,
    /// Injected failures: (location, offset) -> (bytes served before the reset, remaining)
    flaky: Mutex<HashMap<(String, u64), (usize, u32)>>,
    opens: Mutex<Vec<(String, u64)>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, location: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(location.to_string(), data.into());
        self
    }

    /// The next `times` opens of `location` at `offset` reset the connection
    /// after serving `bytes` bytes
    pub fn fail_at(mut self, location: &str, offset: u64, bytes: usize, times: u32) -> Self {
        self.flaky
            .get_mut()
            .insert((location.to_string(), offset), (bytes, times));
        self
    }

    /// Every `(location, offset)` opened so far
    pub async fn opens(&self) -> Vec<(String, u64)> {
        self.opens.lock().await.clone()
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn open(&self, location: &str, offset: u64) -> ImportResult<SourceStream> {
        self.opens.lock().await.push((location.to_string(), offset));

        let data = self
            .files
            .get(location)
            .ok_or_else(|| ImportError::Source(format!("{} does not exist", location)))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let rest = data[start..].to_vec();

        let mut flaky = self.flaky.lock().await;
        match flaky.get_mut(&(location.to_string(), offset)) {
            Some((fail_at, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Ok(Box::pin(FlakyReader {
                    data: rest,
                    pos: 0,
                    fail_at: *fail_at,
                }))
            },
            _ => Ok(Box::pin(Cursor::new(rest))),
        }
    }
}

// ============================================================================
// Materializer
// ============================================================================

#[derive(Default)]
pub struct MemoryMaterializer {
    fail: bool,
    calls: Mutex<Vec<Uuid>>,
}

impl MemoryMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Jobs refreshed so far
    pub async fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Materializer for MemoryMaterializer {
    async fn refresh(&self, job: &JobRecord) -> ImportResult<()> {
        self.calls.lock().await.push(job.id);
        if self.fail {
            return Err(ImportError::Database(
                "materialized view ledger_period_summaries is locked".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_injected_failure_is_bounded() {
        let source = MemorySource::new()
            .with_file("f", b"0123456789".to_vec())
            .fail_at("f", 2, 4, 1);

        let mut stream = source.open("f", 0).await.unwrap();
        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"0123456789");

        let mut stream = source.open("f", 2).await.unwrap();
        let mut buf = Vec::new();
        let err = stream.read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);

        let mut stream = source.open("f", 2).await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"23456789");
        assert_eq!(source.opens().await.len(), 3);
    }

    #[tokio::test]
    async fn test_guarded_save() {
        let store = MemoryJobStore::new();
        let job = JobRecord::new(Uuid::new_v4(), "f", 10);
        store.insert(job.clone()).await;

        assert!(store.save(&job).await.unwrap());
        store.set_status(job.id, JobStatus::Cancelled).await;

        let mut update = job.clone();
        update.status = JobStatus::Completed;
        assert!(!store.save(&update).await.unwrap());
        assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_claim_next_skips_fresh_processing_jobs() {
        let store = MemoryJobStore::new();
        let mut running = JobRecord::new(Uuid::new_v4(), "a", 10);
        running.status = JobStatus::Processing;
        store.insert(running.clone()).await;

        assert_eq!(store.claim_next(Duration::from_secs(60)).await.unwrap(), None);

        store.touch_back(running.id, Duration::from_secs(120)).await;
        assert_eq!(
            store.claim_next(Duration::from_secs(60)).await.unwrap(),
            Some(running.id)
        );

        let pending = JobRecord::new(Uuid::new_v4(), "b", 10);
        store.insert(pending.clone()).await;
        assert_eq!(
            store.claim_next(Duration::from_secs(60)).await.unwrap(),
            Some(pending.id)
        );
        assert_eq!(store.get(pending.id).await.unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_ensure_branch_merges_fields() {
        let branches = MemoryBranches::new();
        let company = Uuid::new_v4();
        let mut spec = BranchSpec {
            document: "12345678000190".to_string(),
            external_code: Some("E1".to_string()),
            name: Some("MATRIZ".to_string()),
            state: None,
            city_code: None,
        };
        let first = branches.ensure_branch(company, &spec).await.unwrap();

        spec.name = None;
        spec.state = Some("SP".to_string());
        let second = branches.ensure_branch(company, &spec).await.unwrap();
        assert_eq!(first, second);

        let stored = branches.spec(company, "12345678000190").await.unwrap();
        assert_eq!(stored.name.as_deref(), Some("MATRIZ"));
        assert_eq!(stored.state.as_deref(), Some("SP"));
    }
}

//! Durable job records
//!
//! Every write issued by the engine is guarded against a concurrent external
//! cancellation: once a job reads `cancelled` it stays `cancelled`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::types::{JobCounts, JobRecord, JobStatus};
use crate::error::{ImportError, ImportResult};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self, job_id: Uuid) -> ImportResult<JobRecord>;

    /// Cheap status read for cooperative cancellation checks
    async fn current_status(&self, job_id: Uuid) -> ImportResult<JobStatus>;

    /// Persist the full record.
    ///
    /// Returns `false` when the job was cancelled externally, in which case
    /// nothing was written.
    async fn save(&self, job: &JobRecord) -> ImportResult<bool>;

    /// Intermediate progress write that leaves the checkpoint untouched
    async fn report_progress(
        &self,
        job_id: Uuid,
        bytes_processed: i64,
        progress: i32,
    ) -> ImportResult<()>;

    /// Claim the oldest runnable job: a `pending` one, or an unfinished one
    /// nobody touched for `stale_after`
    async fn claim_next(&self, stale_after: Duration) -> ImportResult<Option<Uuid>>;
}

/// Row shape of `import_jobs`
#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    company_id: Uuid,
    branch_id: Option<Uuid>,
    file_path: String,
    file_name: String,
    file_size: i64,
    status: String,
    progress: i32,
    bytes_processed: i64,
    chunk_number: i32,
    total_lines_processed: i64,
    record_limit: i64,
    import_scope: String,
    counts: serde_json::Value,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = ImportError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let counts: JobCounts = if row.counts.is_null() {
            JobCounts::default()
        } else {
            serde_json::from_value(row.counts)?
        };

        Ok(JobRecord {
            id: row.id,
            company_id: row.company_id,
            branch_id: row.branch_id,
            file_path: row.file_path,
            file_name: row.file_name,
            file_size: row.file_size,
            status: JobStatus::from(row.status),
            progress: row.progress,
            bytes_processed: row.bytes_processed,
            chunk_number: row.chunk_number,
            total_lines_processed: row.total_lines_processed,
            record_limit: row.record_limit,
            import_scope: row.import_scope,
            counts,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a job record; used by tooling and tests, the upload flow owns creation
    pub async fn create(&self, job: &JobRecord) -> ImportResult<()> {
        sqlx::query(
            r#"
            INSERT INTO import_jobs (
                id, company_id, branch_id, file_path, file_name, file_size,
                status, record_limit, import_scope, counts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id)
        .bind(job.company_id)
        .bind(job.branch_id)
        .bind(&job.file_path)
        .bind(&job.file_name)
        .bind(job.file_size)
        .bind(job.status.as_str())
        .bind(job.record_limit)
        .bind(&job.import_scope)
        .bind(serde_json::to_value(&job.counts)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn load(&self, job_id: Uuid) -> ImportResult<JobRecord> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, company_id, branch_id, file_path, file_name, file_size,
                   status, progress, bytes_processed, chunk_number,
                   total_lines_processed, record_limit, import_scope, counts,
                   error_message, created_at, updated_at
            FROM import_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ImportError::JobNotFound(job_id))?;

        JobRecord::try_from(row)
    }

    async fn current_status(&self, job_id: Uuid) -> ImportResult<JobStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM import_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        status
            .map(JobStatus::from)
            .ok_or(ImportError::JobNotFound(job_id))
    }

    async fn save(&self, job: &JobRecord) -> ImportResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = $2,
                progress = GREATEST(progress, $3),
                bytes_processed = $4,
                chunk_number = $5,
                total_lines_processed = $6,
                counts = $7,
                error_message = $8,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'cancelled'
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.progress)
        .bind(job.bytes_processed)
        .bind(job.chunk_number)
        .bind(job.total_lines_processed)
        .bind(serde_json::to_value(&job.counts)?)
        .bind(&job.error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn report_progress(
        &self,
        job_id: Uuid,
        bytes_processed: i64,
        progress: i32,
    ) -> ImportResult<()> {
        sqlx::query(
            r#"
            UPDATE import_jobs
            SET progress = GREATEST(progress, $2), updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(progress)
        .execute(&self.pool)
        .await?;

        tracing::debug!(%job_id, bytes_processed, progress, "Progress reported");
        Ok(())
    }

    async fn claim_next(&self, stale_after: Duration) -> ImportResult<Option<Uuid>> {
        let claimed: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE import_jobs
            SET status = CASE WHEN status = 'pending' THEN 'processing' ELSE status END,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM import_jobs
                WHERE status = 'pending'
                   OR (status IN ('processing', 'refreshing_downstream')
                       AND updated_at < NOW() - make_interval(secs => $1))
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(stale_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed)
    }
}

//! Downstream materialization triggered once per completed job

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use super::types::JobRecord;
use crate::error::ImportResult;

#[async_trait]
pub trait Materializer: Send + Sync {
    async fn refresh(&self, job: &JobRecord) -> ImportResult<()>;
}

/// Refreshes the per-period ledger summaries of the job's company
pub struct PgMaterializer {
    pool: PgPool,
}

impl PgMaterializer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Materializer for PgMaterializer {
    async fn refresh(&self, job: &JobRecord) -> ImportResult<()> {
        sqlx::query("SELECT refresh_ledger_summaries($1)")
            .bind(job.company_id)
            .execute(&self.pool)
            .await?;

        info!(job_id = %job.id, company_id = %job.company_id, "Ledger summaries refreshed");
        Ok(())
    }
}

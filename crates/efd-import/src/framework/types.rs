//! Job record and its status machine

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{Family, ImportScope};

/// Import job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    RefreshingDownstream,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::RefreshingDownstream => "refreshing_downstream",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// No slice may run once the job reached one of these
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => JobStatus::Pending,
            "processing" => JobStatus::Processing,
            "refreshing_downstream" => JobStatus::RefreshingDownstream,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Pending,
        }
    }
}

/// Cumulative counters and the resume checkpoint (maps to `import_jobs.counts`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Rows written per destination table
    #[serde(default)]
    pub inserted: BTreeMap<String, u64>,
    /// Lines seen per record tag, classified or not
    #[serde(default)]
    pub lines_by_tag: BTreeMap<String, u64>,
    /// Records admitted per family; drives quota resumption
    #[serde(default)]
    pub emitted: BTreeMap<Family, u64>,
    /// Classified lines that produced nothing usable
    #[serde(default)]
    pub dropped: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream_error: Option<String>,
    /// Serialized processing context of the last completed slice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<serde_json::Value>,
}

impl JobCounts {
    pub fn add_inserted(&mut self, written: &BTreeMap<String, u64>) {
        for (table, count) in written {
            *self.inserted.entry(table.clone()).or_insert(0) += count;
        }
    }

    pub fn add_lines(&mut self, lines_by_tag: &BTreeMap<String, u64>) {
        for (tag, count) in lines_by_tag {
            *self.lines_by_tag.entry(tag.clone()).or_insert(0) += count;
        }
    }

    pub fn total_inserted(&self) -> u64 {
        self.inserted.values().sum()
    }
}

/// Import job (maps to import_jobs table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub company_id: Uuid,
    pub branch_id: Option<Uuid>,
    /// Opaque location of the source object
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub status: JobStatus,
    pub progress: i32,
    pub bytes_processed: i64,
    pub chunk_number: i32,
    pub total_lines_processed: i64,
    /// `0` imports everything
    pub record_limit: i64,
    pub import_scope: String,
    pub counts: JobCounts,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh `pending` job, as the upload flow would create it
    pub fn new(company_id: Uuid, file_path: impl Into<String>, file_size: i64) -> Self {
        let file_path = file_path.into();
        let file_name = file_path
            .rsplit('/')
            .next()
            .unwrap_or(file_path.as_str())
            .to_string();
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            company_id,
            branch_id: None,
            file_path,
            file_name,
            file_size,
            status: JobStatus::Pending,
            progress: 0,
            bytes_processed: 0,
            chunk_number: 0,
            total_lines_processed: 0,
            record_limit: 0,
            import_scope: ImportScope::All.as_str().to_string(),
            counts: JobCounts::default(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_branch(mut self, branch_id: Uuid) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    pub fn with_record_limit(mut self, record_limit: i64) -> Self {
        self.record_limit = record_limit;
        self
    }

    pub fn with_scope(mut self, scope: ImportScope) -> Self {
        self.import_scope = scope.as_str().to_string();
        self
    }

    pub fn scope(&self) -> ImportScope {
        ImportScope::from_job(&self.import_scope)
    }

    /// Raise progress, never lowering it
    pub fn advance_progress(&mut self, progress: i32) {
        self.progress = self.progress.max(progress.clamp(0, 100));
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
    }
}

/// Percentage of `file_size` covered by `bytes_processed`, held below 100
/// until the job completes
pub fn progress_for(bytes_processed: i64, file_size: i64) -> i32 {
    if file_size <= 0 {
        return 0;
    }
    let percent = bytes_processed.max(0).saturating_mul(100) / file_size;
    percent.min(99) as i32
}

//! Import engine configuration

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Slice Budget Constants
// ============================================================================

/// Wall-clock budget of one slice in seconds.
pub const DEFAULT_SLICE_TIME_BUDGET_SECS: u64 = 50;

/// Lines read by one slice before it checkpoints.
pub const DEFAULT_SLICE_LINE_BUDGET: u64 = 50_000;

/// Buffered rows per destination before a flush.
pub const DEFAULT_BATCH_SIZE: usize = 2_000;

/// Postgres accepts at most 65535 bind parameters per statement and a ledger
/// row binds 17 of them.
pub const MAX_BATCH_SIZE: usize = u16::MAX as usize / 17;

/// Lines between two cancellation checks.
pub const DEFAULT_CANCEL_CHECK_INTERVAL: u64 = 2_000;

/// Lines between two intermediate progress writes.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 10_000;

// ============================================================================
// Retry and Worker Constants
// ============================================================================

/// Pause before a slice is retried after a transport error.
pub const DEFAULT_TRANSPORT_RETRY_DELAY_MS: u64 = 2_000;

/// Consecutive transport failures tolerated before the job fails.
pub const DEFAULT_MAX_TRANSPORT_RETRIES: u32 = 5;

/// Idle time between two claim attempts of the worker.
pub const DEFAULT_WORKER_POLL_SECS: u64 = 5;

/// A `processing` job untouched for this long is considered abandoned.
pub const DEFAULT_STALE_AFTER_SECS: u64 = 600;

/// Where source files are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    S3,
    Local,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s3" => Ok(SourceKind::S3),
            "local" | "file" => Ok(SourceKind::Local),
            other => Err(format!("unknown source kind '{}', expected s3 or local", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    pub slice_time_budget_secs: u64,
    /// `0` disables the line budget
    pub slice_line_budget: u64,
    pub batch_size: usize,
    pub cancel_check_interval: u64,
    pub progress_interval: u64,
    pub transport_retry_delay_ms: u64,
    pub max_transport_retries: u32,
    pub worker_poll_secs: u64,
    pub stale_after_secs: u64,
    pub source: SourceKind,
    /// Root directory for [`SourceKind::Local`]
    pub local_root: Option<PathBuf>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            slice_time_budget_secs: DEFAULT_SLICE_TIME_BUDGET_SECS,
            slice_line_budget: DEFAULT_SLICE_LINE_BUDGET,
            batch_size: DEFAULT_BATCH_SIZE,
            cancel_check_interval: DEFAULT_CANCEL_CHECK_INTERVAL,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            transport_retry_delay_ms: DEFAULT_TRANSPORT_RETRY_DELAY_MS,
            max_transport_retries: DEFAULT_MAX_TRANSPORT_RETRIES,
            worker_poll_secs: DEFAULT_WORKER_POLL_SECS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            source: SourceKind::default(),
            local_root: None,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl ImportConfig {
    /// Load from `EFD_*` environment variables, falling back to defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let source = match std::env::var("EFD_SOURCE") {
            Ok(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            Err(_) => SourceKind::default(),
        };

        let config = Self {
            slice_time_budget_secs: env_or(
                "EFD_SLICE_TIME_BUDGET_SECS",
                DEFAULT_SLICE_TIME_BUDGET_SECS,
            ),
            slice_line_budget: env_or("EFD_SLICE_LINE_BUDGET", DEFAULT_SLICE_LINE_BUDGET),
            batch_size: env_or("EFD_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            cancel_check_interval: env_or(
                "EFD_CANCEL_CHECK_INTERVAL",
                DEFAULT_CANCEL_CHECK_INTERVAL,
            ),
            progress_interval: env_or("EFD_PROGRESS_INTERVAL", DEFAULT_PROGRESS_INTERVAL),
            transport_retry_delay_ms: env_or(
                "EFD_TRANSPORT_RETRY_DELAY_MS",
                DEFAULT_TRANSPORT_RETRY_DELAY_MS,
            ),
            max_transport_retries: env_or(
                "EFD_MAX_TRANSPORT_RETRIES",
                DEFAULT_MAX_TRANSPORT_RETRIES,
            ),
            worker_poll_secs: env_or("EFD_WORKER_POLL_SECS", DEFAULT_WORKER_POLL_SECS),
            stale_after_secs: env_or("EFD_STALE_AFTER_SECS", DEFAULT_STALE_AFTER_SECS),
            source,
            local_root: std::env::var("EFD_LOCAL_ROOT").ok().map(PathBuf::from),
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.slice_time_budget_secs == 0 {
            anyhow::bail!("Slice time budget must be greater than 0");
        }

        if self.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.batch_size > MAX_BATCH_SIZE {
            anyhow::bail!(
                "Batch size {} exceeds {} rows, the most one insert statement can bind",
                self.batch_size,
                MAX_BATCH_SIZE
            );
        }

        if self.cancel_check_interval == 0 || self.progress_interval == 0 {
            anyhow::bail!("Cancel and progress intervals must be greater than 0");
        }

        if self.source == SourceKind::Local && self.local_root.is_none() {
            anyhow::bail!("EFD_LOCAL_ROOT must be set when EFD_SOURCE=local");
        }

        if self.slice_line_budget == 0 {
            tracing::warn!("Slice line budget disabled - slices stop on time budget only");
        }

        Ok(())
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.slice_time_budget_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.transport_retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker_poll_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

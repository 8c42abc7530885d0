//! EFD Import Library
//!
//! Resumable import of EFD/SPED fiscal ledger files into relational tables.
//!
//! # Layout
//!
//! - **ledger**: pure line handling: classification, decoding, the
//!   processing context that doubles as checkpoint, and block quotas
//! - **framework**: the job state machine, stream driver, batch persister
//!   and the storage seams they talk to
//! - **memory**: in-memory implementations of those seams
//! - **storage** / **db**: S3 and Postgres plumbing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use efd_import::config::ImportConfig;
//! use efd_import::framework::ChunkScheduler;
//! use efd_import::memory::{
//!     MemoryBranches, MemoryJobStore, MemoryMaterializer, MemorySink, MemorySource,
//! };
//!
//! # async fn run(job_id: uuid::Uuid) -> efd_import::ImportResult<()> {
//! let scheduler = ChunkScheduler::new(
//!     Arc::new(MemoryJobStore::new()),
//!     Arc::new(MemorySink::new()),
//!     Arc::new(MemoryBranches::new()),
//!     Arc::new(MemorySource::new()),
//!     Arc::new(MemoryMaterializer::new()),
//!     ImportConfig::default(),
//! );
//! let status = scheduler.run_to_completion(job_id).await?;
//! println!("{}", status.as_str());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod framework;
pub mod ledger;
pub mod memory;
pub mod storage;

pub use config::ImportConfig;
pub use error::{DecodeError, ImportError, ImportResult, WriteError};

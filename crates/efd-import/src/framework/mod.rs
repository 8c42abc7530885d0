//! Import framework: durable collaborators and the slice loop
//!
//! The traits ([`JobStore`], [`RecordSink`], [`BranchDirectory`],
//! [`SourceReader`], [`Materializer`]) are the seams between the engine and
//! its storage; Postgres and S3 implementations live next to each trait and
//! in-memory ones in [`crate::memory`].

pub mod branches;
pub mod driver;
pub mod job_store;
pub mod materialize;
pub mod persister;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod types;
pub mod worker;

pub use branches::{BranchDirectory, PgBranchDirectory};
pub use driver::{SliceOutcome, SliceStop, StreamDriver};
pub use job_store::{JobStore, PgJobStore};
pub use materialize::{Materializer, PgMaterializer};
pub use persister::BatchPersister;
pub use scheduler::{ChunkScheduler, SliceResult};
pub use sink::{PgRecordSink, RecordSink, RowBatch, WriteScope};
pub use source::{LocalFileSource, SourceReader, SourceStream};
pub use types::{progress_for, JobCounts, JobRecord, JobStatus};
pub use worker::ImportWorker;

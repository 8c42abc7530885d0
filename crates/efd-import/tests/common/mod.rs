//! Shared fixtures for the import integration tests
//!
//! A [`Harness`] wires a [`ChunkScheduler`] to the in-memory adapters and
//! keeps typed handles on them so tests can inspect what was written.

#![allow(dead_code)]

use std::sync::Arc;

use efd_import::config::ImportConfig;
use efd_import::framework::{ChunkScheduler, JobRecord, JobStatus};
use efd_import::memory::{
    MemoryBranches, MemoryJobStore, MemoryMaterializer, MemorySink, MemorySource,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub const FILE: &str = "uploads/efd.txt";

/// EFD Contribuições header, period March 2024
pub const HEADER_CONTRIB: &str =
    "|0000|006|0|||01032024|31032024|EMPRESA Z SA|11222333000181|SP|3550308||00|0|";

/// EFD ICMS/IPI header, period February 2024
pub const HEADER_ICMS: &str =
    "|0000|017|0|01022024|29022024|EMPRESA Y LTDA|98765432000110||SP|123|3550308||A|1|";

pub const PARTNER: &str = "|0150|F1|FORNECEDOR UM|1058|12345678000190||||";

/// Goods document (C100) with the given direction code, counterparty and total
pub fn goods(direction: &str, counterparty: &str, number: u32, amount: &str) -> String {
    format!(
        "|C100|{}|1|{}|55|00|1|{}||10032024||{}|{}",
        direction,
        counterparty,
        number,
        amount,
        "0|".repeat(16)
    )
}

pub fn freight(number: u32) -> String {
    format!(
        "|D100|0|1|F1|57|00|1||{}|CTE{}|10032024|10032024|0||300,00|0|1|300,00|300,00|36,00|0|||",
        number, number
    )
}

pub const FREIGHT_PIS: &str = "|D101|0|300,00|50|03|300,00|1,65|4,95||";
pub const FREIGHT_COFINS: &str = "|D105|0|300,00|50|03|300,00|7,60|22,80||";

pub const UTILITY_ICMS: &str =
    "|C500|0|1|E1|06|00|1||01|88|15022024|15022024|400,00|0|0|0|0|0|400,00|72,00|0|0|0|6,60|30,40||";

pub fn service() -> String {
    format!("|A100|1|0|C1|00|A|1|500||20022024||90,00|{}", "0|".repeat(10))
}

/// Join lines into a file body, each line terminated by CRLF
pub fn file(lines: &[&str]) -> Vec<u8> {
    let mut body = Vec::new();
    for line in lines {
        body.extend_from_slice(line.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body
}

/// Byte offset just past the first `lines` lines of `body`
pub fn offset_after(body: &[u8], lines: usize) -> u64 {
    body.iter()
        .enumerate()
        .filter(|(_, byte)| **byte == b'\n')
        .nth(lines - 1)
        .map(|(index, _)| index as u64 + 1)
        .unwrap_or(body.len() as u64)
}

/// Route importer logs through the test harness; `RUST_LOG` overrides
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("efd_import=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Defaults suited to tests: no time cutoff, no line cutoff, fast retries
pub fn config() -> ImportConfig {
    ImportConfig {
        slice_line_budget: 0,
        transport_retry_delay_ms: 1,
        ..ImportConfig::default()
    }
}

pub struct Harness {
    pub jobs: Arc<MemoryJobStore>,
    pub sink: Arc<MemorySink>,
    pub branches: Arc<MemoryBranches>,
    pub source: Arc<MemorySource>,
    pub materializer: Arc<MemoryMaterializer>,
    pub scheduler: Arc<ChunkScheduler>,
}

pub struct HarnessBuilder {
    body: Vec<u8>,
    config: ImportConfig,
    sink: MemorySink,
    source: Option<MemorySource>,
    materializer: MemoryMaterializer,
}

impl HarnessBuilder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            config: config(),
            sink: MemorySink::new(),
            source: None,
            materializer: MemoryMaterializer::new(),
        }
    }

    pub fn config(mut self, config: ImportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sink(mut self, sink: MemorySink) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the default source (which serves `body` as [`FILE`])
    pub fn source(mut self, source: MemorySource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn materializer(mut self, materializer: MemoryMaterializer) -> Self {
        self.materializer = materializer;
        self
    }

    pub fn build(self) -> Harness {
        init_tracing();

        let source = self
            .source
            .unwrap_or_else(|| MemorySource::new().with_file(FILE, self.body));

        let jobs = Arc::new(MemoryJobStore::new());
        let sink = Arc::new(self.sink);
        let branches = Arc::new(MemoryBranches::new());
        let source = Arc::new(source);
        let materializer = Arc::new(self.materializer);

        let scheduler = Arc::new(ChunkScheduler::new(
            jobs.clone(),
            sink.clone(),
            branches.clone(),
            source.clone(),
            materializer.clone(),
            self.config,
        ));

        Harness {
            jobs,
            sink,
            branches,
            source,
            materializer,
            scheduler,
        }
    }
}

impl Harness {
    /// Register a fresh pending job for [`FILE`]
    pub async fn job(&self, size: usize) -> JobRecord {
        self.enqueue(JobRecord::new(Uuid::new_v4(), FILE, size as i64))
            .await
    }

    pub async fn enqueue(&self, job: JobRecord) -> JobRecord {
        self.jobs.insert(job.clone()).await;
        job
    }

    pub async fn run(&self, job: &JobRecord) -> JobStatus {
        self.scheduler
            .run_to_completion(job.id)
            .await
            .expect("import should not error")
    }

    pub async fn reload(&self, job: &JobRecord) -> JobRecord {
        self.jobs.get(job.id).await.expect("job should exist")
    }
}

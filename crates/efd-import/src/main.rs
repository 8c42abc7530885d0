//! EFD Import - Main entry point

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use efd_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use efd_import::{
    config::{ImportConfig, SourceKind},
    db::{self, DbConfig},
    framework::{
        ChunkScheduler, ImportWorker, JobRecord, LocalFileSource, PgBranchDirectory, PgJobStore,
        PgMaterializer, PgRecordSink, SliceResult, SourceReader,
    },
    ledger::ImportScope,
    storage::{config::StorageConfig, Storage},
};

#[derive(Parser, Debug)]
#[command(name = "efd-import", version, about = "Resumable EFD/SPED ledger importer")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive one job to a terminal state
    Run {
        #[arg(long)]
        job: Uuid,
    },
    /// Run exactly one slice of a job
    Slice {
        #[arg(long)]
        job: Uuid,
    },
    /// Claim and run jobs until interrupted
    Worker,
    /// Register a new pending job
    Enqueue {
        #[arg(long)]
        company: Uuid,
        /// Object key (S3) or path under EFD_LOCAL_ROOT
        #[arg(long)]
        file: String,
        #[arg(long)]
        size: i64,
        #[arg(long)]
        branch: Option<Uuid>,
        /// all, movements or transport
        #[arg(long, default_value = "all")]
        scope: String,
        /// Rows per quota-bounded family, 0 for no limit
        #[arg(long, default_value_t = 0)]
        limit: i64,
    },
    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let defaults = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("efd-import")
        .filter_directives(if cli.verbose {
            "efd_import=debug,sqlx=warn"
        } else {
            "efd_import=info,sqlx=warn"
        })
        .build();
    let log_config = if cli.verbose {
        defaults
    } else {
        LogConfig::from_env().unwrap_or(defaults)
    };
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Failed to initialize logging: {:#}", err);
            None
        },
    };

    if let Err(err) = execute(cli.command).await {
        error!(error = %format!("{:#}", err), "Command failed");
        eprintln!("Error: {:#}", err);
        process::exit(1);
    }
}

async fn execute(command: Command) -> Result<()> {
    let db_config = DbConfig::from_env().context("Failed to load database configuration")?;
    let pool = db::create_pool(&db_config)
        .await
        .context("Failed to connect to database")?;

    match command {
        Command::Migrate => {
            db::migrate(&pool).await.context("Failed to apply migrations")?;
            info!("Migrations applied");
        },
        Command::Enqueue {
            company,
            file,
            size,
            branch,
            scope,
            limit,
        } => {
            let mut job = JobRecord::new(company, file, size)
                .with_scope(ImportScope::from_job(&scope))
                .with_record_limit(limit);
            if let Some(branch) = branch {
                job = job.with_branch(branch);
            }
            PgJobStore::new(pool).create(&job).await?;
            info!(job_id = %job.id, file = %job.file_name, "Job enqueued");
            println!("{}", job.id);
        },
        Command::Run { job } => {
            let scheduler = build_scheduler(pool).await?;
            let status = scheduler.run_to_completion(job).await?;
            info!(job_id = %job, status = status.as_str(), "Job finished");
        },
        Command::Slice { job } => {
            let scheduler = build_scheduler(pool).await?;
            match scheduler.run_slice(job).await? {
                SliceResult::Continue => info!(job_id = %job, "Slice done, more input remains"),
                SliceResult::Retry { delay, error } => info!(
                    job_id = %job,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Slice interrupted, retry from checkpoint"
                ),
                SliceResult::Finished(status) => {
                    info!(job_id = %job, status = status.as_str(), "Job finished")
                },
            }
        },
        Command::Worker => {
            let scheduler = Arc::new(build_scheduler(pool).await?);
            let worker = ImportWorker::new(scheduler);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested, finishing current job");
                    let _ = shutdown_tx.send(true);
                }
            });

            worker.run(shutdown_rx).await?;
        },
    }

    Ok(())
}

async fn build_scheduler(pool: PgPool) -> Result<ChunkScheduler> {
    let config = ImportConfig::from_env()?;
    config.validate()?;

    let source: Arc<dyn SourceReader> = match config.source {
        SourceKind::S3 => {
            let storage_config = StorageConfig::from_env()?;
            info!(bucket = %storage_config.bucket, "Reading sources from S3");
            Arc::new(Storage::new(storage_config).await?)
        },
        SourceKind::Local => {
            let root = config
                .local_root
                .clone()
                .context("EFD_LOCAL_ROOT is required for the local source")?;
            info!(root = %root.display(), "Reading sources from local directory");
            Arc::new(LocalFileSource::new(root))
        },
    };

    Ok(ChunkScheduler::new(
        Arc::new(PgJobStore::new(pool.clone())),
        Arc::new(PgRecordSink::new(pool.clone())),
        Arc::new(PgBranchDirectory::new(pool.clone())),
        source,
        Arc::new(PgMaterializer::new(pool)),
        config,
    ))
}

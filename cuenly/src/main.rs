//! Entrypoint: parses the CLI, loads configuration, and dispatches to a
//! one-shot processing sweep or scheduler control command.

mod backends;
mod cli;
mod config;
mod fanout;
mod pipeline;

use std::num::NonZeroUsize;
use std::process::ExitCode;

use argh::FromArgs;
use cuenly_crypto::MasterKey;
use cuenly_extract::cache::ResultCache;
use cuenly_imap::{AttachmentResolver, ConnectionPool};
use cuenly_queue::{JobQueue, QueueName};
use cuenly_scheduler::{BillingSweep, LeaderConfig, LeaderScheduler};
use cuenly_storage::artifact_store::ObjectStore;
use cuenly_storage::{ArtifactStore, EmailConfigStore, InvoiceRepository, ProcessedEmailRegistry};
use cuenly_tokio::notify_once::NotifyOnce;
use mongodb::Client as MongoClient;
use tracing::{error, info, warn};

use crate::backends::{
    MinioObjectStore, MongoEmailConfigBackend, MongoInvoiceBackend, MongoProcessedEmailBackend,
    MongoQuotaGate, MuPdfRasterizer, NoOpOcrEngine, OpenAiVisionClient, Vision,
};
use crate::cli::{Args, Command};
use crate::config::Config;
use crate::fanout::QueueFanOut;
use crate::pipeline::PipelineContext;

const PROCESSED_CACHE_CAPACITY: usize = 4096;

struct Runtime {
    config: Config,
    mongo: MongoClient,
    redis: redis::Client,
}

impl Runtime {
    async fn connect(config: Config) -> anyhow::Result<Self> {
        let mongo = MongoClient::with_uri_str(&config.mongo.url).await?;
        let redis = redis::Client::open(config.redis.to_url())?;
        Ok(Self { config, mongo, redis })
    }

    fn database(&self) -> mongodb::Database {
        self.mongo.database(&self.config.mongo.database)
    }

    fn processed_registry(&self) -> ProcessedEmailRegistry<MongoProcessedEmailBackend> {
        let backend = MongoProcessedEmailBackend {
            collection: self.database().collection("processed_emails"),
        };
        ProcessedEmailRegistry::new(
            backend,
            NonZeroUsize::new(PROCESSED_CACHE_CAPACITY).expect("nonzero constant"),
        )
    }

    fn invoice_repository(&self) -> InvoiceRepository<MongoInvoiceBackend> {
        let backend = MongoInvoiceBackend {
            headers: self.database().collection("invoice_headers"),
        };
        InvoiceRepository::new(backend)
    }

    fn email_config_store(&self) -> anyhow::Result<EmailConfigStore<MongoEmailConfigBackend>> {
        let backend = MongoEmailConfigBackend {
            collection: self.database().collection("email_configs"),
        };
        let master_key =
            MasterKey::derive(self.config.email_config_encryption_key.as_bytes());
        Ok(EmailConfigStore::new(backend, master_key))
    }

    fn job_queue(&self) -> JobQueue {
        JobQueue::new(self.redis.clone())
    }

    fn connection_pool(&self) -> ConnectionPool {
        ConnectionPool::new()
    }

    fn attachment_resolver(&self) -> AttachmentResolver {
        AttachmentResolver::new()
    }

    fn artifact_store(&self) -> ArtifactStore {
        let object_store: Option<Box<dyn ObjectStore>> =
            self.config.minio.as_ref().map(|minio| {
                let scheme = if minio.use_ssl { "https" } else { "http" };
                Box::new(MinioObjectStore {
                    client: reqwest::Client::new(),
                    endpoint: format!("{scheme}://{}", minio.endpoint),
                    bucket: minio.bucket.clone(),
                    access_key: minio.access_key.clone(),
                    secret_key: minio.secret_key.clone(),
                }) as Box<dyn ObjectStore>
            });
        ArtifactStore::new(std::path::PathBuf::from(&self.config.temp_pdf_dir), object_store)
    }

    /// `None` when `OPENAI_API_KEY` isn't configured; PDF attachments are
    /// then skipped rather than failing the pipeline.
    fn vision(&self) -> Option<Vision> {
        let api_key = self.config.openai_api_key.clone()?;
        let cache = ResultCache::new(self.redis.clone());
        let quota = MongoQuotaGate {
            users: self.database().collection("users"),
        };
        let llm = OpenAiVisionClient {
            client: reqwest::Client::new(),
            api_key,
            model: self.config.openai_model.clone(),
        };
        Some(Vision::new(cache, MuPdfRasterizer, NoOpOcrEngine, quota, llm))
    }
}

/// Runs a single ingestion sweep, synchronously, across either one
/// owner's mailboxes or every active mailbox in the warehouse.
async fn run_process(runtime: &Runtime, owner: Option<String>) -> anyhow::Result<()> {
    let email_configs = runtime.email_config_store()?;
    let processed = runtime.processed_registry();
    let invoices = runtime.invoice_repository();
    let artifacts = runtime.artifact_store();
    let imap_pool = runtime.connection_pool();
    let resolver = runtime.attachment_resolver();
    let vision = runtime.vision();

    let targets: Vec<(cuenly_common::model::TenantId, String)> = match owner {
        Some(owner) => email_configs
            .list_configs(&owner, false)
            .await?
            .into_iter()
            .filter(|c| c.active)
            .map(|c| (c.tenant, c.username))
            .collect(),
        None => email_configs
            .list_all_active_configs()
            .await?
            .into_iter()
            .map(|c| (c.tenant, c.username))
            .collect(),
    };

    let ctx = PipelineContext {
        email_configs: &email_configs,
        processed: &processed,
        invoices: &invoices,
        artifacts: &artifacts,
        imap_pool: &imap_pool,
        resolver: &resolver,
        vision: vision.as_ref(),
    };

    for (tenant, username) in targets {
        match pipeline::process_account(&ctx, &tenant, &username).await {
            Ok(summary) => info!(tenant = %tenant.0, %username, ?summary, "processed mailbox"),
            Err(e) => warn!(tenant = %tenant.0, %username, error = %e, "failed to process mailbox"),
        }
    }

    Ok(())
}

/// Dequeues `process_account_job`s from the job queue and runs them until
/// ctrl-c is observed. A single dequeue loop suffices at this scale; the
/// heavier watchdog/leader machinery in `cuenly-scheduler` is only needed
/// for the fan-out enqueuer, not for consuming its jobs.
async fn run_worker(runtime: &Runtime) -> anyhow::Result<()> {
    let queue = runtime.job_queue();
    let email_configs = runtime.email_config_store()?;
    let processed = runtime.processed_registry();
    let invoices = runtime.invoice_repository();
    let artifacts = runtime.artifact_store();
    let imap_pool = runtime.connection_pool();
    let resolver = runtime.attachment_resolver();
    let vision = runtime.vision();

    let ctx = PipelineContext {
        email_configs: &email_configs,
        processed: &processed,
        invoices: &invoices,
        artifacts: &artifacts,
        imap_pool: &imap_pool,
        resolver: &resolver,
        vision: vision.as_ref(),
    };

    let mut shutdown = NotifyOnce::new();
    let shutdown_sender = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_sender.send();
        }
    });

    info!("worker started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("shutdown signal received, worker stopping");
                return Ok(());
            }
            dequeued = queue.dequeue(&[QueueName::High, QueueName::Default]) => {
                let Some((queue_name, job)) = dequeued? else {
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    continue;
                };
                run_job(&ctx, &queue, queue_name, job).await;
            }
        }
    }
}

async fn run_job(
    ctx: &PipelineContext<'_>,
    queue: &JobQueue,
    queue_name: QueueName,
    job: cuenly_common::model::Job,
) {
    if job.func_name != fanout::PROCESS_ACCOUNT_JOB {
        warn!(job_id = %job.id, func_name = %job.func_name, "unrecognized job, failing");
        let _ = queue.fail(queue_name, &job.id, "unrecognized job func_name".to_string()).await;
        return;
    }

    let tenant = job.kwargs.get("tenant").and_then(|v| v.as_str());
    let username = job.kwargs.get("username").and_then(|v| v.as_str());
    let (Some(tenant), Some(username)) = (tenant, username) else {
        let _ = queue
            .fail(queue_name, &job.id, "job is missing tenant/username kwargs".to_string())
            .await;
        return;
    };
    let tenant = cuenly_common::model::TenantId(tenant.to_string());

    match pipeline::process_account(ctx, &tenant, username).await {
        Ok(summary) => {
            info!(job_id = %job.id, tenant = %tenant.0, username, ?summary, "job finished");
            let result = serde_json::to_value(&summary).unwrap_or(serde_json::Value::Null);
            let _ = queue.finish(queue_name, &job.id, result).await;
        }
        Err(e) => {
            warn!(job_id = %job.id, tenant = %tenant.0, username, error = %e, "job failed");
            let _ = queue.fail(queue_name, &job.id, e.to_string()).await;
        }
    }
}

fn fan_out(runtime: &Runtime) -> anyhow::Result<QueueFanOut> {
    Ok(QueueFanOut {
        email_configs: runtime.email_config_store()?,
        queue: runtime.job_queue(),
    })
}

async fn run_start_job(runtime: &Runtime) -> anyhow::Result<()> {
    let scheduler = LeaderScheduler::new(
        runtime.redis.clone(),
        LeaderConfig {
            pod_id: hostname_fallback(),
            interval_minutes: runtime.config.job_interval_minutes,
            owner_ttl_seconds: runtime.config.job_owner_ttl_seconds,
            restore_on_boot: runtime.config.job_restore_on_boot,
        },
        fan_out(runtime)?,
    );
    scheduler.start().await?;
    info!("scheduler enabled");
    Ok(())
}

async fn run_stop_job(runtime: &Runtime) -> anyhow::Result<()> {
    let scheduler = LeaderScheduler::new(
        runtime.redis.clone(),
        LeaderConfig {
            pod_id: hostname_fallback(),
            interval_minutes: runtime.config.job_interval_minutes,
            owner_ttl_seconds: runtime.config.job_owner_ttl_seconds,
            restore_on_boot: runtime.config.job_restore_on_boot,
        },
        fan_out(runtime)?,
    );
    scheduler.stop().await?;
    info!("scheduler disabled");
    Ok(())
}

async fn run_status(runtime: &Runtime) -> anyhow::Result<()> {
    let queue = runtime.job_queue();
    let active = queue
        .iter_active(&[cuenly_queue::QueueName::High, cuenly_queue::QueueName::Default])
        .await?;
    println!("active jobs: {}", active.len());
    for job in active {
        println!("  {} {:?} {}", job.id, job.status, job.func_name);
    }
    Ok(())
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "cuenly-pod".to_string())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    // SAFETY: called before any other threads are spawned.
    if let Err(e) = unsafe {
        cuenly_common::dotenv::dotenv_filtered(&[
            "REDIS_HOST", "REDIS_PORT", "REDIS_PASSWORD", "REDIS_DB", "REDIS_SSL",
            "MONGODB_URL", "MONGODB_DATABASE", "EMAIL_CONFIG_ENCRYPTION_KEY",
            "OPENAI_API_KEY", "OPENAI_MODEL", "JOB_INTERVAL_MINUTES",
            "JOB_RESTORE_ON_BOOT", "JOB_OWNER_TTL_SECONDS", "MINIO_ENDPOINT",
            "MINIO_ACCESS_KEY", "MINIO_SECRET_KEY", "MINIO_BUCKET", "MINIO_USE_SSL",
            "TEMP_PDF_DIR", "TIMEZONE",
        ])
    } {
        info!(error = %e, "no .env file found, continuing with process environment only");
    }

    let args: Args = argh::from_env();

    let result = run(args).await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let runtime = Runtime::connect(config).await?;

    match args.command {
        Command::Process(cli::ProcessArgs { owner }) => run_process(&runtime, owner).await,
        Command::StartJob(cli::StartJobArgs {}) => run_start_job(&runtime).await,
        Command::StopJob(cli::StopJobArgs {}) => run_stop_job(&runtime).await,
        Command::Status(cli::StatusArgs {}) => run_status(&runtime).await,
        Command::Worker(cli::WorkerArgs {}) => run_worker(&runtime).await,
    }
}

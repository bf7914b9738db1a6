//! Worker binary: consumes crawl jobs, runs the feeder, and drives the cron
//! loops. One process per replica; leader election keeps the feeder a
//! singleton across replicas.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ingest_core::cron::{
    self, Cadence, CronJob, TokenSource,
};
use ingest_core::embeddings::{EmbeddingThrottle, HttpProviderFactory};
use ingest_core::feeder::CrawlFeeder;
use ingest_core::jobs::JobPayload;
use ingest_core::limiter::TenantConcurrencyLimiter;
use ingest_core::persist::BatchPersister;
use ingest_core::queue::RedisJobQueue;
use ingest_core::redis_pool::RedisPool;
use ingest_core::runner::{CrawlOutcome, CrawlTaskRunner, RunnerSettings};
use ingest_core::storage::{
    BlobStore, CredentialStore, SubscriptionStore, TenantStore, WebsiteStore,
};
use ingest_core::subscriptions::{
    GraphHttpClient, GraphToken, SubscriptionConfig, SubscriptionManager,
};
use ingest_storage_turso::IngestStore;

mod config;
mod crawler;

use config::WorkerBinConfig;
use crawler::HttpPageCrawler;

#[derive(Parser)]
#[command(name = "ingest-worker")]
#[command(about = "Multi-tenant crawl-and-ingest worker")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full worker: job consumer, feeder, and cron loops
    Run,
    /// Run only the feeder loop (leader election included)
    Feeder,
    /// Run one cron job immediately and exit
    Cron {
        #[arg(value_enum)]
        job: CronJobName,
    },
    /// Create the database schema and exit
    Migrate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CronJobName {
    QueueDueWebsites,
    RenewSubscriptions,
    PurgeAuditLogs,
    PurgeConversations,
    CleanupExports,
    CleanupPendingQueues,
}

/// Wired application components shared by the subcommands.
struct App {
    config: WorkerBinConfig,
    store: Arc<IngestStore>,
    redis: Arc<RedisPool>,
    limiter: Arc<TenantConcurrencyLimiter>,
    queue: Arc<RedisJobQueue>,
    runner: Arc<CrawlTaskRunner>,
    feeder: Arc<CrawlFeeder>,
    subscriptions: Arc<SubscriptionManager>,
}

async fn build_app(config: WorkerBinConfig) -> anyhow::Result<App> {
    let store = Arc::new(
        IngestStore::new(&config.core.database_url, &config.database_token).await?,
    );
    let redis = Arc::new(RedisPool::new(&config.core.redis_url)?);
    let limiter = Arc::new(TenantConcurrencyLimiter::new(Arc::clone(&redis), &config.core));
    let queue = Arc::new(RedisJobQueue::new(Arc::clone(&redis)));

    let persister = Arc::new(BatchPersister::new(
        Arc::clone(&store) as Arc<dyn CredentialStore>,
        Arc::clone(&store) as Arc<dyn BlobStore>,
        Arc::new(HttpProviderFactory),
        EmbeddingThrottle::process_global(config.core.embedding_concurrency),
    ));

    let runner = Arc::new(CrawlTaskRunner::new(
        Arc::clone(&limiter),
        Arc::clone(&queue) as Arc<dyn ingest_core::jobs::JobQueue>,
        Arc::new(HttpPageCrawler::new()),
        persister,
        Arc::clone(&store) as Arc<dyn WebsiteStore>,
        Arc::clone(&store) as Arc<dyn TenantStore>,
        Arc::clone(&redis),
        RunnerSettings::from(&config.core),
    ));

    let feeder = Arc::new(CrawlFeeder::new(
        Arc::clone(&redis),
        Arc::clone(&queue) as Arc<dyn ingest_core::jobs::JobQueue>,
        Arc::clone(&limiter),
        Arc::clone(&store) as Arc<dyn TenantStore>,
        config.core.feeder_lock_ttl_seconds,
        Duration::from_secs(config.core.feeder_refresh_seconds),
    ));

    let subscriptions = Arc::new(SubscriptionManager::new(
        Arc::clone(&store) as Arc<dyn SubscriptionStore>,
        Arc::new(GraphHttpClient::new()),
        SubscriptionConfig {
            notification_url: config.core.webhook_notification_url.clone(),
            client_state: config.core.webhook_client_state.clone(),
            ..SubscriptionConfig::default()
        },
    ));

    Ok(App {
        config,
        store,
        redis,
        limiter,
        queue,
        runner,
        feeder,
        subscriptions,
    })
}

/// Token supply from the environment. Production deployments wire the OAuth
/// token service here; a static application token covers single-tenant
/// installs.
struct EnvTokenSource {
    token: Option<GraphToken>,
}

impl EnvTokenSource {
    fn from_env() -> Self {
        let token = std::env::var("GRAPH_ACCESS_TOKEN").ok().map(|access_token| GraphToken {
            access_token,
            base_url: std::env::var("GRAPH_BASE_URL")
                .unwrap_or_else(|_| "https://graph.microsoft.com".to_string()),
        });
        Self { token }
    }
}

#[async_trait::async_trait]
impl TokenSource for EnvTokenSource {
    async fn token_for(&self, _user_integration_id: uuid::Uuid) -> ingest_core::Result<GraphToken> {
        self.token.clone().ok_or_else(|| {
            ingest_core::Error::Configuration("GRAPH_ACCESS_TOKEN is not set".to_string())
        })
    }
}

fn cron_jobs(app: &App) -> Vec<CronJob> {
    let mut jobs = Vec::new();

    {
        let store = Arc::clone(&app.store);
        let redis = Arc::clone(&app.redis);
        jobs.push(CronJob {
            name: "queue-due-websites",
            cadence: Cadence::Hourly { minute: 0 },
            run: Arc::new(move || {
                let store = Arc::clone(&store);
                let redis = Arc::clone(&redis);
                Box::pin(async move {
                    cron::queue_due_websites(store.as_ref(), &redis, chrono::Utc::now())
                        .await
                        .map(|_| ())
                })
            }),
        });
    }

    {
        let manager = Arc::clone(&app.subscriptions);
        let threshold = app.config.core.renewal_threshold_hours;
        jobs.push(CronJob {
            name: "subscription-renewal",
            cadence: Cadence::Every(Duration::from_secs(15 * 60)),
            run: Arc::new(move || {
                let manager = Arc::clone(&manager);
                Box::pin(async move {
                    let tokens = EnvTokenSource::from_env();
                    cron::renew_expiring_subscriptions(&manager, &tokens, threshold)
                        .await
                        .map(|_| ())
                })
            }),
        });
    }

    {
        let store = Arc::clone(&app.store);
        jobs.push(CronJob {
            name: "purge-audit-logs",
            cadence: Cadence::Daily { hour: 2, minute: 0 },
            run: Arc::new(move || {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    cron::purge_audit_logs(store.as_ref(), store.as_ref(), chrono::Utc::now())
                        .await
                        .map(|_| ())
                })
            }),
        });
    }

    {
        let redis = Arc::clone(&app.redis);
        let export_dir = PathBuf::from(&app.config.export_dir);
        let max_age = Duration::from_secs(app.config.core.export_max_age_hours * 3600);
        jobs.push(CronJob {
            name: "cleanup-export-files",
            cadence: Cadence::Daily { hour: 3, minute: 0 },
            run: Arc::new(move || {
                let redis = Arc::clone(&redis);
                let export_dir = export_dir.clone();
                Box::pin(async move {
                    cron::cleanup_export_files(&redis, &export_dir, max_age, chrono::Utc::now())
                        .await
                        .map(|_| ())
                })
            }),
        });
    }

    {
        let store = Arc::clone(&app.store);
        let redis = Arc::clone(&app.redis);
        jobs.push(CronJob {
            name: "cleanup-pending-queues",
            cadence: Cadence::Daily { hour: 1, minute: 30 },
            run: Arc::new(move || {
                let store = Arc::clone(&store);
                let redis = Arc::clone(&redis);
                Box::pin(async move {
                    cron::cleanup_orphaned_pending_queues(store.as_ref(), &redis)
                        .await
                        .map(|_| ())
                })
            }),
        });
    }

    {
        let store = Arc::clone(&app.store);
        jobs.push(CronJob {
            name: "purge-conversations",
            cadence: Cadence::Daily { hour: 4, minute: 0 },
            run: Arc::new(move || {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    cron::purge_conversations(store.as_ref(), chrono::Utc::now())
                        .await
                        .map(|_| ())
                })
            }),
        });
    }

    jobs
}

/// Consume jobs until shutdown. The scheduled-set promote runs on the same
/// cadence as the blocking pop timeout.
async fn consume_jobs(
    queue: Arc<RedisJobQueue>,
    runner: Arc<CrawlTaskRunner>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!("job consumer starting");
    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = queue.promote_due().await {
            warn!(error = %e, "failed to promote scheduled jobs");
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        match queue.dequeue(Duration::from_secs(2)).await {
            Ok(Some(job)) => {
                let JobPayload::Crawl(descriptor) = job.payload;
                match runner.run(&descriptor).await {
                    CrawlOutcome::Completed(report) => info!(
                        job_id = %job.job_id,
                        success = report.success_count,
                        failed = report.failed_count,
                        "crawl job completed"
                    ),
                    CrawlOutcome::Requeued { attempt, delay } => info!(
                        job_id = %job.job_id,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        "crawl job requeued"
                    ),
                    CrawlOutcome::Abandoned { reason } => {
                        warn!(job_id = %job.job_id, ?reason, "crawl job abandoned");
                    }
                    CrawlOutcome::Failed { error } => {
                        warn!(job_id = %job.job_id, error, "crawl job failed");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "dequeue failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    info!("job consumer stopped");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = config::load(cli.config.as_deref())?;
    let app = build_app(config).await?;

    match cli.command {
        Commands::Migrate => {
            app.store.initialize_schema().await?;
            info!("schema ready");
            Ok(())
        }
        Commands::Cron { job } => {
            run_single_cron(&app, job).await?;
            Ok(())
        }
        Commands::Feeder => {
            let (tx, rx) = tokio::sync::watch::channel(false);
            let feeder = Arc::clone(&app.feeder);
            let feeder_task = tokio::spawn(async move { feeder.run(rx).await });
            tokio::signal::ctrl_c().await?;
            info!("shutting down feeder");
            let _ = tx.send(true);
            let _ = feeder_task.await;
            Ok(())
        }
        Commands::Run => {
            let (tx, rx) = tokio::sync::watch::channel(false);

            let feeder = Arc::clone(&app.feeder);
            let feeder_task = tokio::spawn({
                let rx = rx.clone();
                async move { feeder.run(rx).await }
            });

            let cron_task = tokio::spawn(cron::run_cron_jobs(cron_jobs(&app), rx.clone()));

            let consumer_task = tokio::spawn(consume_jobs(
                Arc::clone(&app.queue),
                Arc::clone(&app.runner),
                rx,
            ));

            info!(
                circuit = ?app.limiter.circuit_state(),
                "worker running; press ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await?;
            info!("shutting down worker");
            let _ = tx.send(true);
            let _ = tokio::join!(feeder_task, cron_task, consumer_task);
            Ok(())
        }
    }
}

async fn run_single_cron(app: &App, job: CronJobName) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    match job {
        CronJobName::QueueDueWebsites => {
            let stats = cron::queue_due_websites(app.store.as_ref(), &app.redis, now).await?;
            info!(due = stats.websites_due, queued = stats.descriptors_queued, "done");
        }
        CronJobName::RenewSubscriptions => {
            let tokens = EnvTokenSource::from_env();
            let stats = cron::renew_expiring_subscriptions(
                &app.subscriptions,
                &tokens,
                app.config.core.renewal_threshold_hours,
            )
            .await?;
            info!(expiring = stats.expiring, renewed = stats.renewed, failed = stats.failed, "done");
        }
        CronJobName::PurgeAuditLogs => {
            let stats =
                cron::purge_audit_logs(app.store.as_ref(), app.store.as_ref(), now).await?;
            info!(
                processed = stats.tenants_processed,
                failed = stats.tenants_failed,
                purged = stats.rows_purged,
                "done"
            );
        }
        CronJobName::PurgeConversations => {
            let stats = cron::purge_conversations(app.store.as_ref(), now).await?;
            info!(
                questions = stats.questions_deleted,
                app_runs = stats.app_runs_deleted,
                sessions = stats.orphaned_sessions_deleted,
                "done"
            );
        }
        CronJobName::CleanupExports => {
            let stats = cron::cleanup_export_files(
                &app.redis,
                std::path::Path::new(&app.config.export_dir),
                Duration::from_secs(app.config.core.export_max_age_hours * 3600),
                now,
            )
            .await?;
            info!(files = stats.files_deleted, bytes = stats.bytes_freed, "done");
        }
        CronJobName::CleanupPendingQueues => {
            let stats =
                cron::cleanup_orphaned_pending_queues(app.store.as_ref(), &app.redis).await?;
            info!(
                scanned = stats.queues_scanned,
                dropped = stats.queues_dropped,
                entries = stats.entries_dropped,
                "done"
            );
        }
    }
    Ok(())
}

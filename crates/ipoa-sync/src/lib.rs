//! Reconciliation engine, sync pipeline, background jobs and service wiring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ipoa_adapters::{AiAnalyst, AiExtractor, Analyst, GeminiClient, IpoPageScraper, TextGenerator};
use ipoa_storage::{HttpClientConfig, HttpFetcher, RecordStore, SheetBestStore, SnapshotStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

mod config;
mod jobs;
mod pipeline;
mod reconcile;

pub use config::{AppConfig, ConfigError};
pub use jobs::{EnqueueOutcome, JobRunner, JobStatus, MAX_RETAINED_JOBS};
pub use pipeline::{RunOutcome, SyncPipeline, SyncRunSummary};
pub use reconcile::{reconcile, ReconcileConfig, ReconcileEngine, Reconciliation};

pub const CRATE_NAME: &str = "ipoa-sync";

/// The long-lived collaborators a running service shares.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn RecordStore>,
    pub analyst: Arc<dyn Analyst>,
    pub pipeline: Arc<SyncPipeline>,
    pub jobs: Arc<JobRunner>,
}

impl Services {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let web_http = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })
            .context("building page/sheet http client")?,
        );
        // Model calls are slow; they get their own client and timeout.
        let ai_http = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.ai_timeout_secs),
                concurrency: 2,
                ..Default::default()
            })
            .context("building model http client")?,
        );

        let generator: Arc<dyn TextGenerator> = Arc::new(GeminiClient::new(
            ai_http,
            config.google_api_key.clone(),
            config.gemini_model.clone(),
        ));
        let store: Arc<dyn RecordStore> = Arc::new(SheetBestStore::new(
            config.sheet_endpoint.clone(),
            Arc::clone(&web_http),
        ));
        let source = Arc::new(IpoPageScraper::new(
            web_http,
            config.source_url.clone(),
            config.scrape_max_chars,
        ));

        let mut pipeline = SyncPipeline::new(
            source,
            Arc::new(AiExtractor::new(Arc::clone(&generator))),
            Arc::clone(&store),
        );
        if let Some(dir) = &config.snapshot_dir {
            pipeline = pipeline.with_snapshots(SnapshotStore::new(dir.clone()));
        }
        let pipeline = Arc::new(pipeline);

        if config.sheet_endpoint.is_none() {
            info!("IPO_SHEET_API not set; sheet reads are empty and writes are skipped");
        }

        Ok(Self {
            store,
            analyst: Arc::new(AiAnalyst::new(generator)),
            jobs: Arc::new(JobRunner::new(Arc::clone(&pipeline))),
            pipeline,
        })
    }
}

/// Cron-driven enqueues onto the same runner the web routes use.
pub async fn maybe_build_scheduler(
    config: &AppConfig,
    jobs: Arc<JobRunner>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let jobs = Arc::clone(&jobs);
        Box::pin(async move {
            let outcome = jobs.enqueue().await;
            info!(job_id = %outcome.job_id, coalesced = outcome.coalesced, "scheduled sync enqueued");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipoa_adapters::{Extractor, PageSource};
use ipoa_core::{normalize_record, IpoRecord};
use ipoa_storage::{RecordStore, SnapshotStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reconcile::{ReconcileEngine, Reconciliation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    NothingScraped,
    NothingExtracted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub scraped_chars: usize,
    pub snapshot_path: Option<String>,
    pub extracted: usize,
    pub existing: usize,
    /// Rows the store accepted.
    pub inserted: usize,
    /// Patches the store accepted.
    pub patched: usize,
    pub dropped: usize,
    pub skipped_invalid: usize,
    pub write_errors: Vec<String>,
    pub outcome: RunOutcome,
}

impl SyncRunSummary {
    fn started(run_id: Uuid, source_id: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            source_id: source_id.to_string(),
            scraped_chars: 0,
            snapshot_path: None,
            extracted: 0,
            existing: 0,
            inserted: 0,
            patched: 0,
            dropped: 0,
            skipped_invalid: 0,
            write_errors: Vec::new(),
            outcome: RunOutcome::Completed,
        }
    }

    fn finish(mut self, outcome: RunOutcome) -> Self {
        self.outcome = outcome;
        self.finished_at = Utc::now();
        self
    }
}

/// Scrape → extract → reconcile → persist, once.
pub struct SyncPipeline {
    source: Arc<dyn PageSource>,
    extractor: Arc<dyn Extractor>,
    store: Arc<dyn RecordStore>,
    snapshots: Option<SnapshotStore>,
    engine: ReconcileEngine,
}

impl SyncPipeline {
    pub fn new(
        source: Arc<dyn PageSource>,
        extractor: Arc<dyn Extractor>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            source,
            extractor,
            store,
            snapshots: None,
            engine: ReconcileEngine::default(),
        }
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_engine(mut self, engine: ReconcileEngine) -> Self {
        self.engine = engine;
        self
    }

    /// External failures degrade to "no data" and write failures are counted,
    /// so the only error is an unwritable snapshot archive.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let mut summary = SyncRunSummary::started(run_id, self.source.source_id());

        let text = self.source.scrape().await;
        summary.scraped_chars = text.chars().count();
        if text.trim().is_empty() {
            warn!("nothing scraped; skipping extraction");
            return Ok(summary.finish(RunOutcome::NothingScraped));
        }

        if let Some(snapshots) = &self.snapshots {
            let stored = snapshots
                .store_bytes(summary.started_at, self.source.source_id(), "txt", text.as_bytes())
                .await
                .context("archiving scraped page")?;
            summary.snapshot_path = Some(stored.relative_path.display().to_string());
        }

        let rows = self.extractor.extract(&text).await;
        summary.extracted = rows.len();
        if rows.is_empty() {
            warn!("extraction produced no rows");
            return Ok(summary.finish(RunOutcome::NothingExtracted));
        }

        let existing: Vec<IpoRecord> = self
            .store
            .fetch_all()
            .await
            .iter()
            .map(normalize_record)
            .collect();
        summary.existing = existing.len();
        let incoming: Vec<IpoRecord> = rows.iter().map(normalize_record).collect();

        let plan = self.engine.reconcile(&incoming, &existing);
        summary.dropped = plan.dropped.len();
        summary.skipped_invalid = plan.skipped_invalid.len();
        if !plan.skipped_invalid.is_empty() {
            warn!(
                count = plan.skipped_invalid.len(),
                "skipped extracted rows without a company name"
            );
        }

        self.persist(&plan, &mut summary).await;

        info!(
            extracted = summary.extracted,
            inserted = summary.inserted,
            patched = summary.patched,
            dropped = summary.dropped,
            write_errors = summary.write_errors.len(),
            "sync run finished"
        );
        Ok(summary.finish(RunOutcome::Completed))
    }

    /// Inserts first so same-batch patches can address freshly appended rows.
    async fn persist(&self, plan: &Reconciliation, summary: &mut SyncRunSummary) {
        if !plan.to_insert.is_empty() {
            match self.store.insert_many(&plan.to_insert).await {
                Ok(count) => summary.inserted = count,
                Err(err) => {
                    warn!(error = %err, rows = plan.to_insert.len(), "insert failed");
                    summary.write_errors.push(format!("insert: {err}"));
                }
            }
        }

        for patch in &plan.to_patch {
            match self.store.patch_by_key(patch).await {
                Ok(()) => summary.patched += 1,
                Err(err) => {
                    warn!(key = %patch.key, error = %err, "patch failed");
                    summary.write_errors.push(format!("patch {}: {err}", patch.key));
                }
            }
        }
    }
}

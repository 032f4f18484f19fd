use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ipoa_adapters::{Extractor, PageSource};
use ipoa_core::{IpoRecord, RawRecord};
use ipoa_storage::{MemoryStore, RecordStore, SnapshotStore};
use ipoa_sync::{JobRunner, JobStatus, RunOutcome, SyncPipeline};
use serde_json::{json, Value as JsonValue};
use tempfile::tempdir;
use tokio::sync::Notify;

struct FixedPage {
    text: String,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl FixedPage {
    fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
            gate: None,
        })
    }

    fn gated(text: &str, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
            gate: Some(gate),
        })
    }
}

#[async_trait]
impl PageSource for FixedPage {
    fn source_id(&self) -> &str {
        "fixed"
    }

    async fn scrape(&self) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.text.clone()
    }
}

struct CannedRows(Vec<JsonValue>);

#[async_trait]
impl Extractor for CannedRows {
    async fn extract(&self, _raw_text: &str) -> Vec<RawRecord> {
        self.0
            .iter()
            .filter_map(|v| v.as_object().cloned())
            .collect()
    }
}

fn listing_rows() -> Vec<JsonValue> {
    vec![
        json!({"company_name": "Alpha Infra", "price_band_high": 100, "lot_size": 150}),
        json!({"company_name": "Beta Foods", "gmp": 12}),
        json!({"company_name": "beta foods", "lot_size": 80}),
        json!({"industry": "Unknown"}),
    ]
}

#[tokio::test]
async fn first_run_writes_and_second_run_is_quiet() {
    let store = Arc::new(MemoryStore::with_records(&[IpoRecord::placeholder("Alpha Infra")]));
    let pipeline = SyncPipeline::new(
        FixedPage::new("Alpha Infra opens Monday"),
        Arc::new(CannedRows(listing_rows())),
        store.clone(),
    );

    let first = pipeline.run_once().await.expect("first run");
    assert_eq!(first.outcome, RunOutcome::Completed);
    assert_eq!(first.extracted, 4);
    assert_eq!(first.existing, 1);
    assert_eq!(first.inserted, 1);
    assert_eq!(first.patched, 2);
    assert_eq!(first.skipped_invalid, 1);
    assert!(first.write_errors.is_empty());

    let records = store.records().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].price_band_high, 100.0);
    assert_eq!(records[1].lot_size, 80.0);

    let before = store.rows().await;
    let second = pipeline.run_once().await.expect("second run");
    assert_eq!(second.inserted, 0);
    assert_eq!(second.patched, 0);
    assert_eq!(second.dropped, 3);
    assert_eq!(store.rows().await, before);
}

#[tokio::test]
async fn empty_page_and_empty_extraction_short_circuit() {
    let store = Arc::new(MemoryStore::new());

    let blank = SyncPipeline::new(FixedPage::new("   "), Arc::new(CannedRows(listing_rows())), store.clone());
    let summary = blank.run_once().await.expect("run");
    assert_eq!(summary.outcome, RunOutcome::NothingScraped);

    let silent = SyncPipeline::new(FixedPage::new("page"), Arc::new(CannedRows(Vec::new())), store.clone());
    let summary = silent.run_once().await.expect("run");
    assert_eq!(summary.outcome, RunOutcome::NothingExtracted);

    assert!(store.rows().await.is_empty());
}

#[tokio::test]
async fn write_failures_are_counted_not_raised() {
    let store = Arc::new(MemoryStore::rejecting_writes(vec![
        IpoRecord::placeholder("Beta Foods").to_raw(),
    ]));
    let pipeline = SyncPipeline::new(FixedPage::new("page"), Arc::new(CannedRows(listing_rows())), store);

    let summary = pipeline.run_once().await.expect("run");
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.patched, 0);
    // One insert batch plus two patches for Beta Foods.
    assert_eq!(summary.write_errors.len(), 3);
}

#[tokio::test]
async fn scraped_page_is_archived_once_per_content() {
    let dir = tempdir().expect("tempdir");
    let pipeline = SyncPipeline::new(
        FixedPage::new("Alpha Infra opens Monday"),
        Arc::new(CannedRows(listing_rows())),
        Arc::new(MemoryStore::new()),
    )
    .with_snapshots(SnapshotStore::new(dir.path()));

    let summary = pipeline.run_once().await.expect("run");
    let path = summary.snapshot_path.expect("snapshot path");
    assert!(path.ends_with(".txt"));
    assert!(dir.path().join(&path).exists());
}

#[tokio::test]
async fn unwritable_archive_fails_the_job() {
    let dir = tempdir().expect("tempdir");
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").expect("write blocker");

    let pipeline = SyncPipeline::new(
        FixedPage::new("page"),
        Arc::new(CannedRows(listing_rows())),
        Arc::new(MemoryStore::new()),
    )
    .with_snapshots(SnapshotStore::new(&blocker));
    let runner = JobRunner::new(Arc::new(pipeline));

    let queued = runner.enqueue().await;
    match runner.wait(queued.job_id).await {
        Some(JobStatus::Failed { message }) => assert!(message.contains("archiving scraped page")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn overlapping_requests_share_one_run() {
    let gate = Arc::new(Notify::new());
    let page = FixedPage::gated("Alpha Infra opens Monday", gate.clone());
    let store = Arc::new(MemoryStore::new());
    let runner = JobRunner::new(Arc::new(SyncPipeline::new(
        page.clone(),
        Arc::new(CannedRows(listing_rows())),
        store.clone(),
    )));

    let first = runner.enqueue().await;
    let second = runner.enqueue().await;
    assert!(!first.coalesced);
    assert!(second.coalesced);
    assert_eq!(first.job_id, second.job_id);
    assert!(!runner.status(first.job_id).await.expect("known job").is_finished());

    gate.notify_one();
    let summary = match runner.wait(first.job_id).await {
        Some(JobStatus::Succeeded { summary }) => summary,
        other => panic!("expected success, got {other:?}"),
    };
    assert_eq!(summary.inserted, 2);
    assert_eq!(page.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.fetch_all().await.len(), 2);

    gate.notify_one();
    let third = runner.enqueue().await;
    assert!(!third.coalesced);
    assert_ne!(third.job_id, first.job_id);
    runner.wait(third.job_id).await.expect("finished");
    assert_eq!(page.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn finished_jobs_are_evicted_past_the_cap() {
    let runner = JobRunner::new(Arc::new(SyncPipeline::new(
        FixedPage::new(""),
        Arc::new(CannedRows(Vec::new())),
        Arc::new(MemoryStore::new()),
    )))
    .with_retention(2);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let queued = runner.enqueue().await;
        runner.wait(queued.job_id).await.expect("finished");
        ids.push(queued.job_id);
    }
    // The cap is enforced when the next job is queued.
    let latest = runner.enqueue().await;
    runner.wait(latest.job_id).await.expect("finished");

    assert!(runner.status(ids[0]).await.is_none());
    assert!(runner.status(ids[1]).await.is_none());
    assert!(runner.status(ids[2]).await.is_some());
    assert!(runner.status(latest.job_id).await.is_some());
    assert!(runner.wait(ids[0]).await.is_none());
}

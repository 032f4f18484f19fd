//! HTTP fetch utilities, the sheet persistence gateway and the scrape snapshot archive.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipoa_core::{normalize_key, normalize_record, IpoRecord, RawRecord, RecordPatch};
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::Method;

pub const CRATE_NAME: &str = "ipoa-storage";

// ── Snapshot archive ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Write-once archive of scraped pages, addressed by content hash.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Same bytes on the same day land on the same path and are written once.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.snapshot_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?;

        if !deduplicated {
            let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
            fs::write(&temp_path, bytes)
                .await
                .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
            if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err).with_context(|| {
                    format!("renaming snapshot into place at {}", absolute_path.display())
                });
            }
        }

        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET with retry on 5xx, 429 and transport errors.
    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let span = info_span!("http_fetch", method = "GET", url);

        async {
            let mut attempt = 0usize;
            loop {
                match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(%status, attempt, "retryable status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(error = %err, attempt, "retryable request error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// One attempt only: writes are not replayed, a retried append could duplicate rows.
    pub async fn send_json(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: &JsonValue,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let span = info_span!("http_send", method = %method, url);

        async {
            let mut request = self.client.request(method.clone(), url).json(body);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

// ── Record store ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store endpoint {0}")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not encode rows: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no stored row matches key {0:?}")]
    UnknownKey(String),
    #[error("store rejected the write: {0}")]
    Rejected(String),
}

/// Persistence gateway for IPO rows.
///
/// Reads never fail: an unreachable store reads as empty. Writes report
/// errors and the caller decides whether to log or surface them.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch_all(&self) -> Vec<RawRecord>;
    async fn insert_many(&self, records: &[IpoRecord]) -> Result<usize, StoreError>;
    async fn patch_by_key(&self, patch: &RecordPatch) -> Result<(), StoreError>;
}

/// Google Sheet exposed through a sheet.best style REST proxy.
///
/// `GET endpoint` lists rows, `POST endpoint` appends, and
/// `PATCH endpoint/company_name/{name}` updates matching rows.
pub struct SheetBestStore {
    endpoint: Option<String>,
    http: Arc<HttpFetcher>,
}

impl SheetBestStore {
    pub fn new(endpoint: Option<String>, http: Arc<HttpFetcher>) -> Self {
        let endpoint = endpoint
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());
        Self { endpoint, http }
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn patch_url(endpoint: &str, company_name: &str) -> Result<Url, StoreError> {
        let mut url =
            Url::parse(endpoint).map_err(|_| StoreError::InvalidEndpoint(endpoint.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidEndpoint(endpoint.to_string()))?
            .pop_if_empty()
            .push("company_name")
            .push(company_name);
        Ok(url)
    }
}

#[async_trait]
impl RecordStore for SheetBestStore {
    async fn fetch_all(&self) -> Vec<RawRecord> {
        let Some(endpoint) = &self.endpoint else {
            debug!("no sheet endpoint configured; reading as empty");
            return Vec::new();
        };
        let resp = match self.http.get(endpoint).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(error = %err, "sheet read failed");
                return Vec::new();
            }
        };
        match resp.json() {
            Ok(value) => rows_from_json(value),
            Err(err) => {
                warn!(error = %err, "sheet returned non-JSON body");
                Vec::new()
            }
        }
    }

    async fn insert_many(&self, records: &[IpoRecord]) -> Result<usize, StoreError> {
        let Some(endpoint) = &self.endpoint else {
            debug!(rows = records.len(), "no sheet endpoint configured; skipping insert");
            return Ok(0);
        };
        if records.is_empty() {
            return Ok(0);
        }
        let body = serde_json::to_value(records)?;
        self.http.send_json(Method::POST, endpoint, &[], &body).await?;
        info!(rows = records.len(), "appended rows to sheet");
        Ok(records.len())
    }

    async fn patch_by_key(&self, patch: &RecordPatch) -> Result<(), StoreError> {
        let Some(endpoint) = &self.endpoint else {
            debug!(key = %patch.key, "no sheet endpoint configured; skipping patch");
            return Ok(());
        };
        let url = Self::patch_url(endpoint, &patch.company_name)?;
        let resp = self
            .http
            .send_json(Method::PATCH, url.as_str(), &[], &patch.updates_json())
            .await?;
        // The proxy answers with the rows it touched.
        if let Ok(JsonValue::Array(rows)) = resp.json() {
            if rows.is_empty() {
                return Err(StoreError::UnknownKey(patch.key.clone()));
            }
        }
        info!(key = %patch.key, fields = patch.updates.len(), "patched sheet row");
        Ok(())
    }
}

/// Keeps the object rows of a JSON array; anything else reads as no rows.
pub fn rows_from_json(value: JsonValue) -> Vec<RawRecord> {
    match value {
        JsonValue::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::Object(row) => Some(row),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// In-process store with the same contract as the sheet, used for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<RawRecord>>,
    reject_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<RawRecord>) -> Self {
        Self {
            rows: Mutex::new(rows),
            reject_writes: false,
        }
    }

    pub fn with_records(records: &[IpoRecord]) -> Self {
        Self::from_rows(records.iter().map(IpoRecord::to_raw).collect())
    }

    /// Every write fails; reads still work.
    pub fn rejecting_writes(rows: Vec<RawRecord>) -> Self {
        Self {
            rows: Mutex::new(rows),
            reject_writes: true,
        }
    }

    pub async fn rows(&self) -> Vec<RawRecord> {
        self.rows.lock().await.clone()
    }

    pub async fn records(&self) -> Vec<IpoRecord> {
        self.rows.lock().await.iter().map(normalize_record).collect()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_all(&self) -> Vec<RawRecord> {
        self.rows().await
    }

    async fn insert_many(&self, records: &[IpoRecord]) -> Result<usize, StoreError> {
        if self.reject_writes {
            return Err(StoreError::Rejected("memory store is read-only".into()));
        }
        let mut rows = self.rows.lock().await;
        rows.extend(records.iter().map(IpoRecord::to_raw));
        Ok(records.len())
    }

    async fn patch_by_key(&self, patch: &RecordPatch) -> Result<(), StoreError> {
        if self.reject_writes {
            return Err(StoreError::Rejected("memory store is read-only".into()));
        }
        let mut rows = self.rows.lock().await;
        let mut touched = false;
        for row in rows.iter_mut() {
            let key = row
                .get("company_name")
                .and_then(JsonValue::as_str)
                .map(normalize_key)
                .unwrap_or_default();
            if key == patch.key {
                for (field, value) in &patch.updates {
                    row.insert(field.name().to_string(), value.to_json());
                }
                touched = true;
            }
        }
        if touched {
            Ok(())
        } else {
            Err(StoreError::UnknownKey(patch.key.clone()))
        }
    }
}

//! External collaborators: the IPO listing page, the Gemini text model, and the
//! extractor and analyst built on top of it.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use ipoa_core::{AnalysisItem, IpoRecord, RawRecord};
use ipoa_storage::{FetchError, HttpFetcher, Method};
use scraper::{Html, Node, Selector};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "ipoa-adapters";

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_SOURCE_URL: &str = "https://ipowatch.in/upcoming-ipo-calendar-ipo-list/";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
pub const DEFAULT_SCRAPE_MAX_CHARS: usize = 10_000;

const SKIPPED_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("model returned no text")]
    EmptyResponse,
    #[error("malformed model response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Prompt in, free text out.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, AdapterError>;
}

/// Something that yields the readable text of an IPO listing. Empty on failure.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn source_id(&self) -> &str;
    async fn scrape(&self) -> String;
}

/// Turns scraped text into loosely-typed rows. Empty on failure.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, raw_text: &str) -> Vec<RawRecord>;
}

#[async_trait]
pub trait Analyst: Send + Sync {
    async fn analyze(&self, records: &[IpoRecord]) -> Result<Vec<AnalysisItem>, AdapterError>;
}

// ── Gemini ───────────────────────────────────────────────────────────────────

/// Client for the Generative Language `generateContent` endpoint.
///
/// The key travels in the `x-goog-api-key` header so request URLs are safe to log.
pub struct GeminiClient {
    http: Arc<HttpFetcher>,
    api_key: String,
    model: String,
    api_base: String,
}

impl GeminiClient {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            api_base: GEMINI_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            self.model
        )
    }

    pub fn request_body(prompt: &str) -> JsonValue {
        json!({ "contents": [{ "parts": [{ "text": prompt }] }] })
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, AdapterError> {
        let endpoint = self.endpoint();
        debug!(model = %self.model, prompt_chars = prompt.len(), "calling gemini");
        let resp = self
            .http
            .send_json(
                Method::POST,
                &endpoint,
                &[("x-goog-api-key", self.api_key.as_str())],
                &Self::request_body(prompt),
            )
            .await?;
        let body = resp
            .json()
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;
        response_text(&body)
    }
}

/// Concatenates the text parts of the first candidate.
pub fn response_text(body: &JsonValue) -> Result<String, AdapterError> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(JsonValue::as_array);

    let text: String = parts
        .into_iter()
        .flatten()
        .filter_map(|part| part.get("text").and_then(JsonValue::as_str))
        .collect();

    if !text.trim().is_empty() {
        return Ok(text);
    }
    if let Some(reason) = body
        .pointer("/promptFeedback/blockReason")
        .and_then(JsonValue::as_str)
    {
        return Err(AdapterError::Malformed(format!("prompt blocked: {reason}")));
    }
    Err(AdapterError::EmptyResponse)
}

// ── Model output parsing ─────────────────────────────────────────────────────

/// Best-effort recovery of a JSON list from model output.
///
/// Tries, in order: the whole text, the outermost `[...]` span, the text with
/// markdown fences removed. Anything else yields an empty list.
pub fn parse_ai_json(text: &str) -> Vec<JsonValue> {
    let trimmed = text.trim();
    if let Some(items) = json_list(trimmed) {
        return items;
    }
    if let Some(items) = outermost_brackets(trimmed).and_then(json_list) {
        return items;
    }
    if let Some(items) = json_list(strip_fences(trimmed)) {
        return items;
    }
    debug!(chars = text.len(), "model output held no JSON list");
    Vec::new()
}

fn json_list(text: &str) -> Option<Vec<JsonValue>> {
    match serde_json::from_str::<JsonValue>(text).ok()? {
        JsonValue::Array(items) => Some(items),
        JsonValue::Object(map) => {
            // `{"ipos": [...]}` unwraps; any other object is a single row.
            if map.len() == 1 {
                if let Some(JsonValue::Array(items)) = map.values().next() {
                    return Some(items.clone());
                }
            }
            Some(vec![JsonValue::Object(map)])
        }
        _ => None,
    }
}

fn outermost_brackets(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (start < end).then(|| &text[start..=end])
}

fn strip_fences(text: &str) -> &str {
    if let Some(rest) = text.split("```json").nth(1) {
        rest.split("```").next().unwrap_or(rest).trim()
    } else if text.contains("```") {
        text.split("```").nth(1).unwrap_or(text).trim()
    } else {
        text
    }
}

// ── Prompts ──────────────────────────────────────────────────────────────────

pub fn extraction_prompt(raw_text: &str) -> String {
    format!(
        r#"I have scraped this raw text from an IPO website:
{raw_text}

Task: Identify the upcoming or open IPOs.
Extract them into a JSON list matching these exact keys:
- company_name
- symbol (create a short 4-5 letter code if not found)
- ipo_date (YYYY-MM-DD format, estimate if needed)
- application_open (YYYY-MM-DD)
- application_close (YYYY-MM-DD)
- industry (guess based on name if not found)
- lot_size (number)
- price_band_low (number)
- price_band_high (number)
- gmp (Grey Market Premium as number, put 0 if not found)
- issue_price (use price_band_high if not confirmed)
- status (must be 'upcoming' or 'open')
- notes (short 1 sentence summary of hype/risk)

Return ONLY raw JSON. No markdown."#
    )
}

pub fn analysis_prompt(records_json: &str) -> String {
    format!(
        r#"You are a strict Financial Analyst AI.
Here is the data for upcoming IPOs: {records_json}

Instructions:
1. Analyze GMP, Price Band, and Subscription data.
2. Decide if I should APPLY, AVOID, or WATCH.
3. Give a Score (0-100).

Output Format:
Return ONLY a raw JSON list.
Keys: "company", "decision", "score", "reason""#
    )
}

// ── Extractor / analyst ──────────────────────────────────────────────────────

pub struct AiExtractor {
    generator: Arc<dyn TextGenerator>,
}

impl AiExtractor {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Extractor for AiExtractor {
    async fn extract(&self, raw_text: &str) -> Vec<RawRecord> {
        if raw_text.trim().is_empty() {
            return Vec::new();
        }
        let text = match self.generator.generate(&extraction_prompt(raw_text)).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "extraction call failed");
                return Vec::new();
            }
        };
        let rows: Vec<RawRecord> = parse_ai_json(&text)
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::Object(row) => Some(row),
                _ => None,
            })
            .collect();
        info!(rows = rows.len(), "extracted rows from page text");
        rows
    }
}

pub struct AiAnalyst {
    generator: Arc<dyn TextGenerator>,
}

impl AiAnalyst {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Analyst for AiAnalyst {
    async fn analyze(&self, records: &[IpoRecord]) -> Result<Vec<AnalysisItem>, AdapterError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let payload = serde_json::to_string(records).context("encoding records for analysis")?;
        let text = self.generator.generate(&analysis_prompt(&payload)).await?;
        let items: Vec<AnalysisItem> = parse_ai_json(&text)
            .iter()
            .filter_map(AnalysisItem::from_json)
            .collect();
        info!(records = records.len(), items = items.len(), "scored records");
        Ok(items)
    }
}

// ── Listing page ─────────────────────────────────────────────────────────────

/// Fetches the listing page and flattens it to readable text.
pub struct IpoPageScraper {
    http: Arc<HttpFetcher>,
    url: String,
    max_chars: usize,
}

impl IpoPageScraper {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>, max_chars: usize) -> Self {
        Self {
            http,
            url: url.into(),
            max_chars,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PageSource for IpoPageScraper {
    fn source_id(&self) -> &str {
        "ipo-listing"
    }

    async fn scrape(&self) -> String {
        match self.http.get(&self.url).await {
            Ok(resp) => {
                let text = page_text(&resp.text(), self.max_chars);
                info!(url = %self.url, chars = text.chars().count(), "scraped listing page");
                text
            }
            Err(err) => {
                warn!(url = %self.url, error = %err, "listing page fetch failed");
                String::new()
            }
        }
    }
}

/// Visible text of the document body, whitespace collapsed, cut to `max_chars` characters.
pub fn page_text(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);
    let root = Selector::parse("body")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .unwrap_or_else(|| document.root_element());

    let mut words: Vec<&str> = Vec::new();
    for node in root.descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|el| SKIPPED_ELEMENTS.contains(&el.name()))
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }

    words.join(" ").chars().take(max_chars).collect()
}

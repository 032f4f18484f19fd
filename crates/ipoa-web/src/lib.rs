//! Axum + Askama HTTP surface: sheet refresh jobs, JSON scoring and the HTML report.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use ipoa_adapters::Analyst;
use ipoa_core::{normalize_record, AnalysisItem, Decision, IpoRecord};
use ipoa_storage::RecordStore;
use ipoa_sync::{maybe_build_scheduler, AppConfig, JobRunner, Services};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ipoa-web";

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobRunner>,
    pub store: Arc<dyn RecordStore>,
    pub analyst: Arc<dyn Analyst>,
}

impl AppState {
    pub fn new(jobs: Arc<JobRunner>, store: Arc<dyn RecordStore>, analyst: Arc<dyn Analyst>) -> Self {
        Self {
            jobs,
            store,
            analyst,
        }
    }

    pub fn from_services(services: &Services) -> Self {
        Self::new(
            Arc::clone(&services.jobs),
            Arc::clone(&services.store),
            Arc::clone(&services.analyst),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceInfo {
    message: &'static str,
    service: &'static str,
    version: &'static str,
    routes: [&'static str; 5],
}

#[derive(Debug, Clone)]
struct ReportCard {
    company: String,
    decision: String,
    score: u8,
    reason: String,
    color: &'static str,
    background: &'static str,
}

impl From<AnalysisItem> for ReportCard {
    fn from(item: AnalysisItem) -> Self {
        let (color, background) = decision_palette(item.decision);
        Self {
            company: item.company,
            decision: item.decision.to_string(),
            score: item.score,
            reason: item.reason,
            color,
            background,
        }
    }
}

fn decision_palette(decision: Decision) -> (&'static str, &'static str) {
    match decision {
        Decision::Apply => ("#27ae60", "#eafaf1"),
        Decision::Watch => ("#f39c12", "#fef9e7"),
        Decision::Avoid | Decision::Error => ("#e74c3c", "#fdedec"),
    }
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate {
    cards: Vec<ReportCard>,
    notice: String,
    generated_at: String,
    record_count: usize,
    refresh_job: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/update_sheet", get(update_sheet_handler))
        .route("/jobs/{id}", get(job_status_handler))
        .route("/analyze", get(analyze_handler))
        .route("/report", get(report_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &AppConfig) -> anyhow::Result<()> {
    let services = Services::from_config(config)?;

    let scheduler = maybe_build_scheduler(config, Arc::clone(&services.jobs)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "ipo agent listening");
    axum::serve(listener, app(AppState::from_services(&services)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn index_handler() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        message: "IPO Agent is running. Use /update_sheet to scrape, /report to analyze.",
        service: CRATE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        routes: ["/update_sheet", "/jobs/{id}", "/analyze", "/report", "/"],
    })
}

async fn update_sheet_handler(State(state): State<Arc<AppState>>) -> Response {
    let queued = state.jobs.enqueue().await;
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "job_id": queued.job_id,
            "coalesced": queued.coalesced,
            "status_url": format!("/jobs/{}", queued.job_id),
        })),
    )
        .into_response()
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Response {
    match state.jobs.status(job_id).await {
        Some(status) => Json(json!({ "job_id": job_id, "status": status })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown job {job_id}") })),
        )
            .into_response(),
    }
}

async fn analyze_handler(State(state): State<Arc<AppState>>) -> Json<Vec<AnalysisItem>> {
    let records = load_records(state.store.as_ref()).await;
    match state.analyst.analyze(&records).await {
        Ok(items) => Json(items),
        Err(err) => {
            warn!(error = %err, "analysis failed");
            Json(vec![AnalysisItem::error(err.to_string())])
        }
    }
}

/// Always renders: scoring failures show the empty state with a notice.
async fn report_handler(State(state): State<Arc<AppState>>) -> Response {
    let refresh = state.jobs.enqueue().await;
    let records = load_records(state.store.as_ref()).await;

    let (items, notice) = match state.analyst.analyze(&records).await {
        Ok(items) => (items, String::new()),
        Err(err) => {
            warn!(error = %err, "report scoring failed");
            (
                Vec::new(),
                format!("Scoring is unavailable right now ({err})."),
            )
        }
    };

    render_html(ReportTemplate {
        cards: items.into_iter().map(ReportCard::from).collect(),
        notice,
        generated_at: Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
        record_count: records.len(),
        refresh_job: refresh.job_id.to_string(),
    })
}

async fn load_records(store: &dyn RecordStore) -> Vec<IpoRecord> {
    store
        .fetch_all()
        .await
        .iter()
        .map(normalize_record)
        .filter(|r| !r.natural_key().is_empty())
        .collect()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use ipoa_adapters::{AdapterError, Extractor, PageSource};
    use ipoa_core::RawRecord;
    use ipoa_storage::MemoryStore;
    use ipoa_sync::SyncPipeline;
    use tower::ServiceExt;

    struct QuietPage;

    #[async_trait]
    impl PageSource for QuietPage {
        fn source_id(&self) -> &str {
            "quiet"
        }

        async fn scrape(&self) -> String {
            String::new()
        }
    }

    struct NoRows;

    #[async_trait]
    impl Extractor for NoRows {
        async fn extract(&self, _raw_text: &str) -> Vec<RawRecord> {
            Vec::new()
        }
    }

    struct FixedAnalyst(Result<Vec<AnalysisItem>, String>);

    #[async_trait]
    impl Analyst for FixedAnalyst {
        async fn analyze(&self, _records: &[IpoRecord]) -> Result<Vec<AnalysisItem>, AdapterError> {
            self.0.clone().map_err(AdapterError::Message)
        }
    }

    fn test_app(analyst: FixedAnalyst) -> Router {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::with_records(&[
            IpoRecord::placeholder("Alpha Infra"),
            IpoRecord::placeholder("Beta Foods"),
        ]));
        let pipeline = SyncPipeline::new(Arc::new(QuietPage), Arc::new(NoRows), Arc::clone(&store));
        let jobs = Arc::new(JobRunner::new(Arc::new(pipeline)));
        app(AppState::new(jobs, store, Arc::new(analyst)))
    }

    fn scored() -> FixedAnalyst {
        FixedAnalyst(Ok(vec![
            AnalysisItem {
                company: "Alpha Infra".into(),
                decision: Decision::Apply,
                score: 82,
                reason: "GMP up 20% & strong book".into(),
            },
            AnalysisItem {
                company: "Beta Foods".into(),
                decision: Decision::Avoid,
                score: 31,
                reason: "Weak financials".into(),
            },
        ]))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn index_describes_the_service() {
        let (status, body) = get(test_app(scored()), "/").await;
        assert_eq!(status, StatusCode::OK);
        let info: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(info["message"].as_str().unwrap().contains("IPO Agent is running"));
    }

    #[tokio::test]
    async fn update_sheet_accepts_and_the_job_is_observable() {
        let app = test_app(scored());
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/update_sheet").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let accepted: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let job_id = accepted["job_id"].as_str().unwrap().to_string();

        let (status, body) = get(app, &format!("/jobs/{job_id}")).await;
        assert_eq!(status, StatusCode::OK);
        let job: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(job["job_id"], job_id);
        assert!(job["status"]["state"].is_string());
    }

    #[tokio::test]
    async fn unknown_or_malformed_job_ids_are_rejected() {
        let app = test_app(scored());
        let (status, _) = get(app.clone(), &format!("/jobs/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(app, "/jobs/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn analyze_returns_scored_items() {
        let (status, body) = get(test_app(scored()), "/analyze").await;
        assert_eq!(status, StatusCode::OK);
        let items: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(items[0]["decision"], "APPLY");
        assert_eq!(items[1]["score"], 31);
    }

    #[tokio::test]
    async fn analyze_failure_is_a_single_error_item() {
        let (status, body) = get(test_app(FixedAnalyst(Err("quota exceeded".into()))), "/analyze").await;
        assert_eq!(status, StatusCode::OK);
        let items: Vec<AnalysisItem> = serde_json::from_str(&body).unwrap();
        assert_eq!(items, vec![AnalysisItem::error("quota exceeded")]);
    }

    #[tokio::test]
    async fn report_renders_colored_cards() {
        let (status, body) = get(test_app(scored()), "/report").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Daily IPO Report"));
        assert!(body.contains("Alpha Infra"));
        assert!(body.contains("#27ae60"));
        assert!(body.contains("#fdedec"));
        assert!(body.contains("GMP up 20% &amp; strong book"));
        assert!(body.contains("2 IPOs on file"));
        assert!(!body.contains("id=\"no-data\""));
    }

    #[tokio::test]
    async fn report_falls_back_to_the_empty_state() {
        let (status, body) = get(test_app(FixedAnalyst(Err("timeout".into()))), "/report").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("id=\"no-data\""));
        assert!(body.contains("Scoring is unavailable right now"));
        assert!(body.contains("Disclaimer"));
    }
}

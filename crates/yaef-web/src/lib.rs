//! Read-side JSON API over the stored calendars, plus a manual sync trigger.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use yaef_core::{Decoded, DocumentError, EarningsCalendar, EconomicsCalendar};
use yaef_storage::Store;
use yaef_sync::{
    maybe_start_scheduler, SyncConfig, SyncPipeline, SyncStatus, EARNINGS_DOCUMENT,
    ECONOMICS_DOCUMENT,
};

const DATE_BOUND_FORMAT: &str = "%Y-%m-%d";

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<SyncPipeline>,
    store: Arc<dyn Store>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        let store = pipeline.store();
        Self { pipeline, store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    results: Vec<SyncStatus>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/calendar/earnings", get(earnings_handler))
        .route("/calendar/economics", get(economics_handler))
        .route("/admin/sync", post(admin_sync_handler))
        .with_state(Arc::new(state))
}

/// Serves the API and, when enabled, the background sync scheduler.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let pipeline = Arc::new(SyncPipeline::from_config(&config)?);
    let _scheduler = maybe_start_scheduler(Arc::clone(&pipeline), &config).await?;

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, data_dir = %config.data_dir.display(), "serving calendars");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn earnings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let (start, end) = match (parse_bound(query.start), parse_bound(query.end)) {
        (Ok(start), Ok(end)) => (start, end),
        (Err(message), _) | (_, Err(message)) => return bad_request(message),
    };

    let loaded = load_document(
        state.store.as_ref(),
        EARNINGS_DOCUMENT,
        EarningsCalendar::from_json_slice,
    )
    .await;
    match loaded {
        Ok(document) => {
            let mut document = document.unwrap_or_default();
            document.retain_range(start, end);
            Json(document).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn economics_handler(State(state): State<Arc<AppState>>) -> Response {
    let loaded = load_document(
        state.store.as_ref(),
        ECONOMICS_DOCUMENT,
        EconomicsCalendar::from_json_slice,
    )
    .await;
    match loaded {
        Ok(document) => Json(document.unwrap_or_default()).into_response(),
        Err(err) => server_error(err),
    }
}

/// Runs both syncs now. Responds 502 when either calendar failed outright;
/// an empty result is reported but not treated as a failure.
async fn admin_sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.pipeline.sync_all().await;
    report.log();
    let results = report.statuses();
    let status = if results.iter().any(|r| r.status == "error") {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };
    (status, Json(SyncResponse { results })).into_response()
}

fn parse_bound(raw: Option<String>) -> Result<Option<NaiveDate>, String> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => NaiveDate::parse_from_str(text, DATE_BOUND_FORMAT)
            .map(Some)
            .map_err(|_| format!("invalid date {text:?}; expected YYYY-MM-DD")),
    }
}

async fn load_document<T>(
    store: &dyn Store,
    key: &str,
    decode: fn(&[u8]) -> Result<Decoded<T>, DocumentError>,
) -> anyhow::Result<Option<T>> {
    let Some(bytes) = store
        .read(key)
        .await
        .with_context(|| format!("reading {key} document"))?
    else {
        return Ok(None);
    };
    let decoded = decode(&bytes).with_context(|| format!("decoding {key} document"))?;
    Ok(Some(decoded.document))
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = ?err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;
    use yaef_adapters::{AdapterError, EarningsSource, EconomicPageSource, PageRequest, RawEarningsRow};
    use yaef_storage::MemoryStore;

    struct NoEarnings;

    #[async_trait]
    impl EarningsSource for NoEarnings {
        fn source_id(&self) -> &'static str {
            "no-earnings"
        }

        async fn fetch_page(
            &self,
            _request: PageRequest,
        ) -> Result<Option<Vec<RawEarningsRow>>, AdapterError> {
            Ok(None)
        }
    }

    struct Page(Option<String>);

    #[async_trait]
    impl EconomicPageSource for Page {
        fn source_id(&self) -> &'static str {
            "page"
        }

        async fn fetch_page(&self) -> Result<String, AdapterError> {
            self.0
                .clone()
                .ok_or_else(|| AdapterError::Payload("calendar unavailable".into()))
        }
    }

    fn fixture_page() -> Page {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/forexfactory/calendar_week.html");
        Page(Some(std::fs::read_to_string(path).unwrap()))
    }

    fn test_app(store: Arc<MemoryStore>, page: Page) -> Router {
        let pipeline = SyncPipeline::new(store, Box::new(NoEarnings), Box::new(page), 0)
            .with_reference_date(NaiveDate::from_ymd_opt(2024, 3, 6).unwrap());
        app(AppState::new(Arc::new(pipeline)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn earnings_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let document = json!({
            "Monday, 03/04/2024": {"Apple": [{"symbol": "AAPL", "company": "Apple"}]},
            "Sunday, 03/03/2024": {"Oracle": [{"symbol": "ORCL", "company": "Oracle"}]},
            "Saturday, 03/02/2024": {"Nike": [{"symbol": "NKE", "company": "Nike"}]},
            "Friday, 03/01/2024": [
                {"symbol": "GOOG", "company": "Alphabet"},
                {"symbol": "MSFT", "company": "Microsoft"}
            ]
        });
        store
            .insert(EARNINGS_DOCUMENT, serde_json::to_vec(&document).unwrap())
            .await;
        store
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let app = test_app(Arc::new(MemoryStore::new()), Page(None));
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn earnings_range_is_inclusive() {
        let app = test_app(earnings_store().await, Page(None));
        let (status, body) =
            get_json(app, "/calendar/earnings?start=2024-03-02&end=2024-03-03").await;
        assert_eq!(status, StatusCode::OK);
        let days = body.as_object().unwrap();
        assert_eq!(days.len(), 2);
        assert!(days.contains_key("Saturday, 03/02/2024"));
        assert!(days.contains_key("Sunday, 03/03/2024"));
    }

    #[tokio::test]
    async fn earnings_without_bounds_returns_everything_with_legacy_days_grouped() {
        let app = test_app(earnings_store().await, Page(None));
        let (status, body) = get_json(app, "/calendar/earnings?start=").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_object().unwrap().len(), 4);
        let friday = &body["Friday, 03/01/2024"];
        assert_eq!(friday["Alphabet"][0]["symbol"], "GOOG");
        assert_eq!(friday["Microsoft"][0]["symbol"], "MSFT");
    }

    #[tokio::test]
    async fn invalid_range_bound_is_rejected() {
        let app = test_app(earnings_store().await, Page(None));
        let (status, body) = get_json(app, "/calendar/earnings?end=03/04/2024").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("03/04/2024"));
    }

    #[tokio::test]
    async fn missing_documents_are_empty_objects() {
        let store = Arc::new(MemoryStore::new());
        let (status, body) = get_json(test_app(store.clone(), Page(None)), "/calendar/earnings").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));

        let (status, body) = get_json(test_app(store, Page(None)), "/calendar/economics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn corrupt_document_is_a_server_error() {
        let store = Arc::new(MemoryStore::new());
        store.insert(ECONOMICS_DOCUMENT, b"{\"yesterday\": []}".to_vec()).await;
        let (status, _) = get_json(test_app(store, Page(None)), "/calendar/economics").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn admin_sync_stores_economics_and_reports_each_calendar() {
        let store = Arc::new(MemoryStore::new());
        let app = test_app(store.clone(), fixture_page());
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: JsonValue =
            serde_json::from_slice(&resp.into_body().collect().await.unwrap().to_bytes()).unwrap();
        assert_eq!(body["results"][0]["kind"], "earnings");
        assert_eq!(body["results"][0]["status"], "empty");
        assert_eq!(body["results"][1]["kind"], "economics");
        assert_eq!(body["results"][1]["status"], "ok");
        assert_eq!(body["results"][1]["outcome"]["stored_records"], 5);

        let (status, economics) = get_json(app, "/calendar/economics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(economics["Monday, 03/04/2024"][2]["event"], "ISM Services PMI");
        assert_eq!(economics["Monday, 03/04/2024"][2]["impact"], "High");
    }

    #[tokio::test]
    async fn admin_sync_failure_is_a_bad_gateway() {
        let app = test_app(Arc::new(MemoryStore::new()), Page(None));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}

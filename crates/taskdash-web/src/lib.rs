//! HTTP boundary: CSV upload ingestion plus health and status reporting.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use taskdash_core::IngestionSummary;
use taskdash_ingest::IngestError;
use taskdash_sync::{open_store, store_status, IngestConfig, IngestPipeline, PipelineError};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "taskdash-web";

/// Content types a CSV upload may declare.
pub const ACCEPTED_CONTENT_TYPES: [&str; 3] =
    ["text/csv", "application/vnd.ms-excel", "application/octet-stream"];

const MAX_DETAIL_CHARS: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: IngestPipeline,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(pipeline: IngestPipeline) -> Self {
        Self {
            pipeline,
            max_upload_bytes: taskdash_sync::DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("multipart error: {0}")]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Ingest(IngestError),
    #[error("{0}")]
    StoreUnavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Ingest(IngestError::Profile(msg)) => {
                ApiError::Internal(format!("invalid ingest profile: {msg}"))
            }
            PipelineError::Ingest(err) => ApiError::Ingest(err),
            PipelineError::StoreUnavailable(err) => ApiError::StoreUnavailable(err.to_string()),
            PipelineError::Store(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Ingest(_) => StatusCode::BAD_REQUEST,
            ApiError::Multipart(err) => err.status(),
            ApiError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Server errors are cut short.
    pub fn detail(&self) -> String {
        let message = self.to_string();
        match self {
            ApiError::Internal(_) => message.chars().take(MAX_DETAIL_CHARS).collect(),
            _ => message,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        let body = ErrorBody {
            status: "error",
            detail: self.detail(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    let ingest = post(ingest_tasks_handler).layer(DefaultBodyLimit::max(state.max_upload_bytes));
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/ingest/tasks", ingest.clone())
        .route("/api/ingest-csv", ingest)
        .with_state(Arc::new(state))
}

/// Binds the port and serves until ctrl-c.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "taskdash web listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub async fn serve_with_config(config: IngestConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let result = match IngestPipeline::from_config(store.clone(), &config) {
        Ok(pipeline) => {
            let state = AppState::new(pipeline).with_max_upload_bytes(config.max_upload_bytes);
            serve(state, config.web_port).await
        }
        Err(err) => Err(err),
    };
    store.close().await;
    result
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve_with_config(IngestConfig::from_env()).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

pub fn is_accepted_content_type(content_type: Option<&str>, file_name: Option<&str>) -> bool {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .filter(|ct| !ct.is_empty());
    match essence {
        Some(ct) => ACCEPTED_CONTENT_TYPES.contains(&ct.as_str()),
        None => file_name.is_some_and(|name| name.to_ascii_lowercase().ends_with(".csv")),
    }
}

struct Upload {
    file_name: Option<String>,
    bytes: axum::body::Bytes,
}

async fn read_upload(multipart: &mut Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") && field.file_name().is_none() {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        if !is_accepted_content_type(content_type.as_deref(), file_name.as_deref()) {
            return Err(ApiError::BadRequest(format!(
                "unsupported content type `{}`; expected a CSV upload",
                content_type.as_deref().unwrap_or("none")
            )));
        }
        let bytes = field.bytes().await?;
        return Ok(Upload { file_name, bytes });
    }
    Err(ApiError::BadRequest(
        "missing CSV file in multipart field `file`".into(),
    ))
}

async fn ingest_tasks_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<IngestionSummary>, ApiError> {
    let upload = read_upload(&mut multipart).await?;
    info!(
        file = upload.file_name.as_deref().unwrap_or("-"),
        bytes = upload.bytes.len(),
        "received task upload"
    );
    let summary = state
        .pipeline
        .run(&upload.bytes, upload.file_name.as_deref())
        .await?;
    Ok(Json(summary))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "timestamp": Utc::now() }))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = store_status(state.pipeline.store().as_ref())
        .await
        .map_err(|err| ApiError::StoreUnavailable(err.to_string()))?;
    Ok(Json(json!({
        "status": "online",
        "store_connected": true,
        "backend": status.backend,
        "task_count": status.task_count,
        "resource_count": status.resource_count,
        "last_ingestion": status.last_ingestion,
        "timestamp": Utc::now(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use taskdash_core::{IngestionMetadata, ResourceRecord, TaskRecord, UpsertOutcome};
    use taskdash_storage::{DocumentStore, MemoryStore, StoreError};
    use tower::ServiceExt;

    const TASKS_CSV: &str = "task_id,task_description,status,start_date,due_date,assigned_user_id\n\
T1,Design schema,done,01/03/2024,05/03/2024,u9\n";

    struct DownStore;

    #[async_trait]
    impl DocumentStore for DownStore {
        fn backend_name(&self) -> &'static str {
            "down"
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }

        async fn upsert_task(&self, _task: &TaskRecord) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }

        async fn upsert_resource(&self, _resource: &ResourceRecord) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }

        async fn put_ingestion_metadata(&self, _metadata: &IngestionMetadata) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }

        async fn ingestion_metadata(&self, _key: &str) -> Result<Option<IngestionMetadata>, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }

        async fn get_task(&self, _task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }

        async fn get_resource(&self, _user_id: &str) -> Result<Option<ResourceRecord>, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }

        async fn count_tasks(&self) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }

        async fn count_resources(&self) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("pool timed out".into()))
        }
    }

    fn memory_app() -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(IngestPipeline::new(store.clone()));
        (store, app(state))
    }

    fn upload_request(uri: &str, content_type: Option<&str>, file_name: &str, csv: &str) -> Request<Body> {
        let boundary = "taskdash-test-boundary";
        let mut payload = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n"
        );
        if let Some(ct) = content_type {
            payload.push_str(&format!("Content-Type: {ct}\r\n"));
        }
        payload.push_str("\r\n");
        payload.push_str(csv);
        payload.push_str(&format!("\r\n--{boundary}--\r\n"));
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(payload))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn ingest_returns_summary() {
        let (store, app) = memory_app();
        let resp = app
            .oneshot(upload_request("/api/ingest/tasks", Some("text/csv"), "tasks.csv", TASKS_CSV))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Ingestion complete. 1 tasks loaded.");
        assert_eq!(body["total_records"], 1);
        assert_eq!(body["inserted"], 1);
        assert_eq!(body["resources_count"], 1);
        assert_eq!(body["metadata_written"], true);
        assert_eq!(store.count_tasks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn legacy_alias_accepts_csv_without_content_type() {
        let (_store, app) = memory_app();
        let resp = app
            .oneshot(upload_request("/api/ingest-csv", None, "export.CSV", TASKS_CSV))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_unsupported_content_type() {
        let (store, app) = memory_app();
        let resp = app
            .oneshot(upload_request("/api/ingest/tasks", Some("application/json"), "tasks.json", TASKS_CSV))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "error");
        assert!(body["detail"].as_str().unwrap().contains("application/json"));
        assert_eq!(store.count_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_columns_are_a_bad_request() {
        let (store, app) = memory_app();
        let csv = "task_id,task_description,start_date,due_date\nT1,x,01/03/2024,05/03/2024\n";
        let resp = app
            .oneshot(upload_request("/api/ingest/tasks", Some("text/csv"), "tasks.csv", csv))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let detail = json_body(resp).await["detail"].as_str().unwrap().to_string();
        assert!(detail.contains("missing required columns: status"));
        assert!(detail.contains("task_description"));
        assert_eq!(store.count_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_file_field_is_a_bad_request() {
        let (_store, app) = memory_app();
        let boundary = "b";
        let payload = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{boundary}--\r\n"
        );
        let req = Request::builder()
            .method("POST")
            .uri("/api/ingest/tasks")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(payload))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(IngestPipeline::new(store)).with_max_upload_bytes(64);
        let big = format!("{TASKS_CSV}{}", "T2,x,todo,01/03/2024,05/03/2024,u1\n".repeat(20));
        let resp = app(state)
            .oneshot(upload_request("/api/ingest/tasks", Some("text/csv"), "tasks.csv", &big))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unavailable_store_is_503() {
        let app = app(AppState::new(IngestPipeline::new(Arc::new(DownStore))));
        let resp = app
            .clone()
            .oneshot(upload_request("/api/ingest/tasks", Some("text/csv"), "tasks.csv", TASKS_CSV))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let status = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_and_status_report() {
        let (_store, app) = memory_app();
        let health = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(json_body(health).await["status"], "healthy");

        app.clone()
            .oneshot(upload_request("/api/ingest/tasks", Some("text/csv"), "tasks.csv", TASKS_CSV))
            .await
            .unwrap();
        let status = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        let body = json_body(status).await;
        assert_eq!(body["status"], "online");
        assert_eq!(body["task_count"], 1);
        assert_eq!(body["last_ingestion"]["source_name"], "tasks.csv");
    }

    #[test]
    fn server_error_detail_is_truncated() {
        let err = ApiError::Internal("x".repeat(500));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.detail().chars().count(), 200);
    }

    #[test]
    fn content_type_allow_list() {
        assert!(is_accepted_content_type(Some("text/csv; charset=utf-8"), None));
        assert!(is_accepted_content_type(Some("application/vnd.ms-excel"), Some("a.xls")));
        assert!(is_accepted_content_type(None, Some("tasks.csv")));
        assert!(!is_accepted_content_type(None, Some("tasks.txt")));
        assert!(!is_accepted_content_type(Some("text/plain"), Some("tasks.csv")));
    }
}

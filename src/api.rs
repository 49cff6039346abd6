use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::errors::SentinelError;
use crate::lifecycle::ActionOutcome;
use crate::metrics::MetricsSnapshot;
use crate::models::{DetectionQuery, NewStream, StreamHealth, StreamUpdate};
use crate::utils::from_epoch_millis;
use crate::websocket::stream_events_handler;
use crate::AppState;

const DEFAULT_DETECTION_LIMIT: i64 = 50;
const MAX_DETECTION_LIMIT: i64 = 500;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: &str, code: u16) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            code: Some(code),
        }
    }
}

fn error_response(message: &str, code: u16) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ApiResponse::<()>::error(message, code))).into_response()
}

fn failure(err: SentinelError) -> Response {
    let code = err.status_code();
    if code >= 500 {
        error!("Request failed: {}", err);
    }
    error_response(&err.to_string(), code)
}

fn success<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(ApiResponse::success(data))).into_response()
}

/// Mutating endpoints require `Authorization: Bearer <admin_token>` when a
/// token is configured.
fn check_admin_token(headers: &HeaderMap, admin_token: &Option<String>) -> Result<(), Response> {
    let Some(expected) = admin_token else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(error_response("Invalid or missing Authorization header", 401))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(service_health))
        .route("/api/streams", get(list_streams).post(create_stream))
        .route(
            "/api/streams/:id",
            get(get_stream).patch(update_stream).delete(delete_stream),
        )
        .route("/api/streams/:id/start", post(start_stream))
        .route("/api/streams/:id/stop", post(stop_stream))
        .route("/api/streams/:id/health", get(stream_health))
        .route("/api/streams/:id/detections", get(list_detections))
        .route("/api/streams/:id/frames/:captured_ms", get(get_frame))
        .route("/api/streams/:id/events", get(stream_events_handler))
        .route("/api/streams/:id/jobs", get(list_stream_jobs))
        .route("/api/jobs/:job_id", get(get_job))
        .route("/api/detector/health", get(detector_health))
        .with_state(state)
}

async fn service_health(State(state): State<AppState>) -> Response {
    let streams = match state.database.list_streams().await {
        Ok(streams) => streams.len(),
        Err(e) => return failure(e),
    };
    success(StatusCode::OK, serde_json::json!({
        "service": "stream-sentinel",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": (Utc::now() - state.started_at).num_seconds(),
        "streams": streams,
        "eventSubscribers": state.events.subscriber_count(),
    }))
}

async fn list_streams(State(state): State<AppState>) -> Response {
    match state.database.list_streams().await {
        Ok(streams) => success(StatusCode::OK, streams),
        Err(e) => failure(e),
    }
}

async fn create_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new_stream): Json<NewStream>,
) -> Response {
    if let Err(response) = check_admin_token(&headers, &state.config.server.admin_token) {
        return response;
    }
    if let Err(e) = new_stream.validate() {
        return failure(e);
    }
    match state.database.create_stream(&new_stream).await {
        Ok(stream) => {
            info!("Created stream '{}' ({})", stream.name, stream.id);
            success(StatusCode::CREATED, stream)
        }
        Err(e) => failure(e),
    }
}

async fn get_stream(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    match state.database.get_stream(&id).await {
        Ok(Some(stream)) => success(StatusCode::OK, stream),
        Ok(None) => error_response(&format!("Stream '{}' not found", id), 404),
        Err(e) => failure(e),
    }
}

async fn update_stream(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    Json(update): Json<StreamUpdate>,
) -> Response {
    if let Err(response) = check_admin_token(&headers, &state.config.server.admin_token) {
        return response;
    }
    match state.lifecycle.update_stream(&id, update).await {
        Ok(stream) => success(StatusCode::OK, stream),
        Err(e) => failure(e),
    }
}

async fn delete_stream(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_admin_token(&headers, &state.config.server.admin_token) {
        return response;
    }
    match state.lifecycle.delete_stream(&id).await {
        Ok(()) => success(StatusCode::OK, serde_json::json!({ "deleted": id })),
        Err(e) => failure(e),
    }
}

fn outcome_response(outcome: ActionOutcome) -> Response {
    let status = match outcome {
        ActionOutcome::Queued { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    success(status, outcome)
}

async fn start_stream(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_admin_token(&headers, &state.config.server.admin_token) {
        return response;
    }
    match state.lifecycle.start(&id).await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => failure(e),
    }
}

async fn stop_stream(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_admin_token(&headers, &state.config.server.admin_token) {
        return response;
    }
    match state.lifecycle.stop(&id).await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => failure(e),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamHealthReport {
    #[serde(flatten)]
    health: StreamHealth,
    in_flight: usize,
    window: Option<MetricsSnapshot>,
}

async fn stream_health(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    match state.lifecycle.health(&id).await {
        Ok(health) => success(StatusCode::OK, StreamHealthReport {
            in_flight: state.dispatcher.in_flight(&id),
            window: state.metrics.snapshot(&id).await,
            health,
        }),
        Err(e) => failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DetectionsQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

async fn list_detections(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Query(params): Query<DetectionsQuery>,
) -> Response {
    match state.database.get_stream(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(&format!("Stream '{}' not found", id), 404),
        Err(e) => return failure(e),
    }

    let query = DetectionQuery {
        stream_id: id,
        from: params.from,
        to: params.to,
        limit: params.limit.unwrap_or(DEFAULT_DETECTION_LIMIT).clamp(1, MAX_DETECTION_LIMIT),
    };
    match state.database.list_detections(&query).await {
        Ok(detections) => success(StatusCode::OK, detections),
        Err(e) => failure(e),
    }
}

async fn get_frame(
    State(state): State<AppState>,
    AxumPath((id, captured_ms)): AxumPath<(String, i64)>,
) -> Response {
    let Some(captured_at) = from_epoch_millis(captured_ms) else {
        return error_response("Invalid capture timestamp", 400);
    };
    // Only ids of known streams ever reach the filesystem.
    match state.database.get_stream(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(&format!("Stream '{}' not found", id), 404),
        Err(e) => return failure(e),
    }
    let path = state.storage.frame_path(&id, captured_at);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/jpeg")],
            Body::from(bytes),
        ).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => error_response("Frame not found", 404),
        Err(e) => failure(e.into()),
    }
}

async fn get_job(State(state): State<AppState>, AxumPath(job_id): AxumPath<String>) -> Response {
    match state.lifecycle.job(&job_id).await {
        Some(job) => success(StatusCode::OK, job),
        None => error_response(&format!("Job {} not found", job_id), 404),
    }
}

async fn list_stream_jobs(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    success(StatusCode::OK, state.lifecycle.jobs(Some(&id)).await)
}

async fn detector_health(State(state): State<AppState>) -> Response {
    match state.detector.health().await {
        Ok(health) => success(StatusCode::OK, health),
        Err(e) => failure(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::database::{DatabaseProvider, SqliteDatabase};
    use crate::detector::{Detector, DetectorHealth, DetectorResponse};
    use crate::dispatcher::DetectionDispatcher;
    use crate::errors::Result;
    use crate::events::EventBus;
    use crate::ingestion::{FrameCallback, FrameIngestor};
    use crate::lifecycle::{LifecycleDeps, StreamLifecycle};
    use crate::metrics::MetricsAggregator;
    use crate::models::Stream;
    use crate::storage::FrameStorage;
    use async_trait::async_trait;
    use axum::http::Request;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[derive(Default)]
    struct NullIngestor {
        active: Mutex<HashMap<String, u64>>,
    }

    #[async_trait]
    impl FrameIngestor for NullIngestor {
        async fn start_stream(&self, stream: &Stream, _on_frame: FrameCallback) -> Result<()> {
            self.active.lock().unwrap().entry(stream.id.clone()).or_insert(1);
            Ok(())
        }
        async fn stop_stream(&self, stream_id: &str) {
            self.active.lock().unwrap().remove(stream_id);
        }
        async fn decoder_generation(&self, stream_id: &str) -> Option<u64> {
            self.active.lock().unwrap().get(stream_id).copied()
        }
        async fn stop_all(&self) {
            self.active.lock().unwrap().clear();
        }
    }

    struct HealthyDetector;

    #[async_trait]
    impl Detector for HealthyDetector {
        async fn detect(&self, _stream_id: &str, _image: Bytes) -> Result<DetectorResponse> {
            Err(SentinelError::detector("not used"))
        }
        async fn health(&self) -> Result<DetectorHealth> {
            Ok(DetectorHealth { status: "healthy".to_string(), model_loaded: true, version: Some("1.0.0".to_string()) })
        }
    }

    async fn app_state(admin_token: Option<&str>) -> (AppState, TempDir) {
        let mut config = Config::default();
        config.server.admin_token = admin_token.map(str::to_string);
        config.lifecycle.start_backoff_ms = 10;

        let frames = TempDir::new().unwrap();
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        db.initialize().await.unwrap();
        let database: Arc<dyn DatabaseProvider> = db;
        let events = EventBus::new(16);
        let storage = FrameStorage::new(frames.path());
        let detector: Arc<dyn Detector> = Arc::new(HealthyDetector);
        let metrics = Arc::new(MetricsAggregator::new(database.clone(), config.metrics.clone()));
        let dispatcher = Arc::new(DetectionDispatcher::new(
            &config.detector,
            database.clone(),
            detector.clone(),
            storage.clone(),
            events.clone(),
            metrics.clone(),
        ));
        let lifecycle = StreamLifecycle::new(
            LifecycleDeps {
                database: database.clone(),
                ingestor: Arc::new(NullIngestor::default()),
                dispatcher: dispatcher.clone(),
                metrics: metrics.clone(),
                storage: storage.clone(),
                events: events.clone(),
            },
            config.lifecycle.clone(),
        );

        let state = AppState {
            config: Arc::new(config),
            database,
            lifecycle,
            dispatcher,
            metrics,
            detector,
            storage,
            events,
            started_at: Utc::now(),
        };
        (state, frames)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>, token: Option<&str>)
        -> (StatusCode, serde_json::Value)
    {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn camera() -> serde_json::Value {
        serde_json::json!({ "name": "Lookout", "sourceUrl": "rtsp://192.168.1.20/live", "fps": 5 })
    }

    #[tokio::test]
    async fn test_stream_crud() {
        let (state, _frames) = app_state(None).await;
        let app = router(state);

        let (status, body) = send(&app, "POST", "/api/streams", Some(camera()), None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["status"], "STOPPED");
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "GET", "/api/streams", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "PATCH", &format!("/api/streams/{}", id),
            Some(serde_json::json!({ "detectionEnabled": false })), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["detectionEnabled"], false);

        let (status, _) = send(&app, "DELETE", &format!("/api/streams/{}", id), None, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", &format!("/api/streams/{}", id), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
    }

    #[tokio::test]
    async fn test_invalid_stream_is_rejected() {
        let (state, _frames) = app_state(None).await;
        let app = router(state);

        let (status, body) = send(&app, "POST", "/api/streams",
            Some(serde_json::json!({ "name": "Bad", "sourceUrl": "rtsp://10.0.0.1/x", "fps": 90 })), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_admin_token_guards_mutations() {
        let (state, _frames) = app_state(Some("s3cret")).await;
        let app = router(state);

        let (status, _) = send(&app, "POST", "/api/streams", Some(camera()), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, "POST", "/api/streams", Some(camera()), Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, "POST", "/api/streams", Some(camera()), Some("s3cret")).await;
        assert_eq!(status, StatusCode::CREATED);

        // Reads stay open.
        let (status, _) = send(&app, "GET", "/api/streams", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_stop_through_api() {
        let (state, _frames) = app_state(None).await;
        let app = router(state);
        let (_, body) = send(&app, "POST", "/api/streams", Some(camera()), None).await;
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "POST", &format!("/api/streams/{}/stop", id), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["outcome"], "already_stopped");

        let (status, body) = send(&app, "POST", &format!("/api/streams/{}/start", id), None, None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["outcome"], "queued");
        let job_id = body["data"]["jobId"].as_str().unwrap().to_string();

        let job = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                let (_, body) = send(&app, "GET", &format!("/api/jobs/{}", job_id), None, None).await;
                if body["data"]["status"] == "completed" {
                    return body;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }).await.unwrap();
        assert_eq!(job["data"]["action"], "start");

        let (_, body) = send(&app, "POST", &format!("/api/streams/{}/start", id), None, None).await;
        assert_eq!(body["data"]["outcome"], "already_running");

        let (_, body) = send(&app, "GET", &format!("/api/streams/{}/jobs", id), None, None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "GET", &format!("/api/streams/{}/health", id), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "RUNNING");
        assert_eq!(body["data"]["stale"], false);
        assert_eq!(body["data"]["decoderActive"], true);
        assert_eq!(body["data"]["inFlight"], 0);
    }

    #[tokio::test]
    async fn test_detections_and_frames() {
        let (state, _frames) = app_state(None).await;
        let storage = state.storage.clone();
        let app = router(state);
        let (_, body) = send(&app, "POST", "/api/streams", Some(camera()), None).await;
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "GET", &format!("/api/streams/{}/detections?limit=10", id), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].as_array().unwrap().is_empty());

        let (status, _) = send(&app, "GET", "/api/streams/nope/detections", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let captured_at = from_epoch_millis(1_700_000_000_000).unwrap();
        storage.save_frame(&id, captured_at, &[0xFF, 0xD8, 0xFF, 0xD9]).await.unwrap();

        let request = Request::builder()
            .uri(format!("/api/streams/{}/frames/1700000000000", id))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");

        let (status, _) = send(&app, "GET", &format!("/api/streams/{}/frames/1700000000001", id), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // An encoded path that resolves to the stored frame is still refused.
        std::fs::create_dir_all(storage.frame_path("x", captured_at).parent().unwrap()).unwrap();
        let (status, _) = send(&app, "GET", &format!("/api/streams/x%2F..%2F{}/frames/1700000000000", id), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_service_and_detector_health() {
        let (state, _frames) = app_state(None).await;
        let app = router(state);

        let (status, body) = send(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["streams"], 0);

        let (status, body) = send(&app, "GET", "/api/detector/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "healthy");

        let (status, _) = send(&app, "GET", "/api/jobs/unknown", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

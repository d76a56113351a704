//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::liveness::liveness_socket;
use crate::health::HealthResponse;
use crate::manager::{HealthSnapshot, SlotError, SlotManager};
use crate::reclaim::ReclaimOutcome;
use crate::slot::SlotId;
use crate::version::VersionInfo;

const ANONYMOUS_ACTOR: &str = "anonymous";
const DEFAULT_ACTIVITY_LIMIT: usize = 50;
const MAX_ACTIVITY_LIMIT: usize = 500;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: HealthResponse,
    pub total_slots: usize,
    pub idle_slots: usize,
    pub version: VersionInfo,
}

impl HealthCheckResponse {
    pub fn from_snapshot(snapshot: HealthSnapshot) -> Self {
        Self {
            status: snapshot.response(),
            total_slots: snapshot.total_slots,
            idle_slots: snapshot.idle_slots,
            version: snapshot.version,
        }
    }
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    status: &'static str,
    url: String,
    instance_id: SlotId,
    ws_url: String,
}

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    limit: Option<usize>,
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "detail": detail.into() }))).into_response()
}

fn slot_error_response(error: &SlotError) -> Response {
    let status = match error {
        SlotError::NotFound(_) => StatusCode::NOT_FOUND,
        SlotError::Busy(_) | SlotError::NotRunning(_) => StatusCode::CONFLICT,
        SlotError::UnsupportedArtifact(_) => StatusCode::BAD_REQUEST,
        SlotError::Allocation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        SlotError::StoreUnavailable(_) | SlotError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, error.to_string())
}

/// Client address for the activity log: first `x-forwarded-for` hop.
fn actor(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_ACTOR)
        .to_string()
}

fn ws_url(headers: &HeaderMap, manager: &SlotManager, id: SlotId) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| manager.public_host().to_string());
    format!("ws://{host}/ws/{id}")
}

async fn health_check(State(manager): State<Arc<SlotManager>>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse::from_snapshot(manager.health().await))
}

async fn instances_status(State(manager): State<Arc<SlotManager>>) -> Response {
    match manager.snapshot().await {
        Ok(slots) => Json(slots).into_response(),
        Err(e) => slot_error_response(&e),
    }
}

async fn instance(State(manager): State<Arc<SlotManager>>, Path(id): Path<u32>) -> Response {
    match manager.slot(SlotId::new(id)).await {
        Ok(slot) => Json(slot).into_response(),
        Err(e) => slot_error_response(&e),
    }
}

async fn instance_activity(
    State(manager): State<Arc<SlotManager>>,
    Path(id): Path<u32>,
    Query(query): Query<ActivityQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .min(MAX_ACTIVITY_LIMIT);
    match manager.activity(SlotId::new(id), limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => slot_error_response(&e),
    }
}

async fn upload(
    State(manager): State<Arc<SlotManager>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut instance_id: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error_response(e.status(), e.body_text()),
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => file = Some((file_name, bytes.to_vec())),
                    Err(e) => return error_response(e.status(), e.body_text()),
                }
            }
            Some("instance_id") => match field.text().await {
                Ok(text) => instance_id = Some(text),
                Err(e) => return error_response(e.status(), e.body_text()),
            },
            _ => {}
        }
    }

    let Some((file_name, bytes)) = file else {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "missing form field: file");
    };
    let Some(raw_id) = instance_id else {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "missing form field: instance_id");
    };
    let Ok(id) = raw_id.trim().parse::<u32>().map(SlotId::new) else {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("invalid instance_id: {raw_id:?}"),
        );
    };

    let actor = actor(&headers);
    tracing::info!(slot = %id, %file_name, size = bytes.len(), %actor, "Upload received");

    match manager.allocate(id, &file_name, bytes, &actor).await {
        Ok(allocation) => Json(UploadResponse {
            status: "success",
            url: allocation.url,
            instance_id: allocation.slot_id,
            ws_url: ws_url(&headers, &manager, id),
        })
        .into_response(),
        Err(e) => slot_error_response(&e),
    }
}

async fn release(
    State(manager): State<Arc<SlotManager>>,
    Path(id): Path<u32>,
    headers: HeaderMap,
) -> Response {
    let id = SlotId::new(id);
    match manager.release(id, &actor(&headers)).await {
        Ok(ReclaimOutcome::Stuck { pid }) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("worker {pid} could not be stopped; slot {id} marked ERROR"),
        ),
        Ok(outcome) => {
            let (label, failures) = match outcome {
                ReclaimOutcome::AlreadyIdle => ("already_idle", Vec::new()),
                ReclaimOutcome::PartialFailure { failures } => ("partial_failure", failures),
                _ => ("reclaimed", Vec::new()),
            };
            Json(serde_json::json!({
                "status": "success",
                "instance_id": id,
                "outcome": label,
                "failures": failures,
            }))
            .into_response()
        }
        Err(e) => slot_error_response(&e),
    }
}

async fn shutdown(State(manager): State<Arc<SlotManager>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    manager.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(manager: Arc<SlotManager>) -> Router {
    let upload_limit = manager.config().max_upload_bytes;
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/instances/status", get(instances_status))
        .route("/api/instances/{id}", get(instance))
        .route("/api/instances/{id}/activity", get(instance_activity))
        .route("/api/instances/{id}/release", post(release))
        .route("/ws/{id}", get(liveness_socket))
        .with_state(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPool, test_pool};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const BOUNDARY: &str = "boxpool-test-boundary";

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn upload_request(instance_id: &str, file_name: &str, content: &str) -> Request<Body> {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"instance_id\"\r\n\r\n\
             {instance_id}\r\n\
             --{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\
             {content}\r\n\
             --{BOUNDARY}--\r\n"
        );
        Request::post("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::HOST, "pool.example:8000")
            .header("x-forwarded-for", "198.51.100.7, 10.0.0.1")
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(pool: &TestPool, request: Request<Body>) -> Response {
        routes(pool.manager.clone()).oneshot(request).await.unwrap()
    }

    async fn get_json(pool: &TestPool, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = send(pool, Request::get(uri).body(Body::empty()).unwrap()).await;
        let status = response.status();
        (status, response_json(response).await)
    }

    async fn post_empty(pool: &TestPool, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = send(pool, Request::post(uri).body(Body::empty()).unwrap()).await;
        let status = response.status();
        (status, response_json(response).await)
    }

    #[tokio::test]
    async fn health_check_returns_status_and_version() {
        let pool = test_pool().await;
        let (status, json) = get_json(&pool, "/health-check").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "STARTING");
        assert_eq!(json["total_slots"], 5);
        assert!(json["version"]["boxpool"].is_string());
    }

    #[tokio::test]
    async fn status_lists_every_slot_in_order() {
        let pool = test_pool().await;
        let (status, json) = get_json(&pool, "/api/instances/status").await;

        assert_eq!(status, StatusCode::OK);
        let slots = json.as_array().unwrap();
        assert_eq!(slots.len(), 5);
        for (i, slot) in slots.iter().enumerate() {
            assert_eq!(slot["id"], i + 1);
            assert_eq!(slot["port"], i + 2);
            assert_eq!(slot["status"], "IDLE");
            assert!(slot["running_duration_seconds"].is_null());
        }
    }

    #[tokio::test]
    async fn unknown_instance_is_404() {
        let pool = test_pool().await;
        let (status, json) = get_json(&pool, "/api/instances/42").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["detail"], "slot 42 not found");
    }

    #[tokio::test]
    async fn upload_allocates_slot_and_release_frees_it() {
        let pool = test_pool().await;

        let response = send(&pool, upload_request("3", "data.mdb", "db-bytes")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "success");
        assert_eq!(json["url"], "http://127.0.0.1:4");
        assert_eq!(json["instance_id"], 3);
        assert_eq!(json["ws_url"], "ws://pool.example:8000/ws/3");

        let (_, slot) = get_json(&pool, "/api/instances/3").await;
        assert_eq!(slot["status"], "RUNNING");
        assert!(slot["running_duration_seconds"].is_i64());

        let (_, activity) = get_json(&pool, "/api/instances/3/activity").await;
        assert_eq!(activity[0]["action"], "start");
        assert_eq!(activity[1]["action"], "allocate");
        assert_eq!(activity[1]["actor"], "198.51.100.7");
        assert_eq!(activity[1]["detail"], "data.mdb");

        let (status, json) = post_empty(&pool, "/api/instances/3/release").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "reclaimed");

        let (status, json) = post_empty(&pool, "/api/instances/3/release").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "already_idle");

        let (_, slot) = get_json(&pool, "/api/instances/3").await;
        assert_eq!(slot["status"], "IDLE");
        assert!(!pool.root.path().join("instance_3").exists());
    }

    #[tokio::test]
    async fn upload_to_busy_slot_is_409() {
        let pool = test_pool().await;
        assert_eq!(
            send(&pool, upload_request("1", "a.mdb", "x")).await.status(),
            StatusCode::OK
        );

        let response = send(&pool, upload_request("1", "b.mdb", "y")).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(pool.spawner.launches(), 1);

        pool.manager.release(SlotId::new(1), "test").await.unwrap();
    }

    #[tokio::test]
    async fn upload_rejects_bad_extension_and_unknown_slot() {
        let pool = test_pool().await;

        let response = send(&pool, upload_request("1", "notes.txt", "x")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&pool, upload_request("8", "a.mdb", "x")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&pool, upload_request("one", "a.mdb", "x")).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        assert_eq!(pool.spawner.launches(), 0);
    }

    #[tokio::test]
    async fn release_unknown_slot_is_404() {
        let pool = test_pool().await;
        let (status, _) = post_empty(&pool, "/api/instances/9/release").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_triggers_manager_shutdown() {
        let pool = test_pool().await;
        let mut rx = pool.manager.shutdown_rx();

        assert!(!*rx.borrow());

        let (status, _) = post_empty(&pool, "/shutdown").await;
        assert_eq!(status, StatusCode::OK);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn actor_uses_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(actor(&headers), "anonymous");
        headers.insert("x-forwarded-for", "203.0.113.1, 10.0.0.2".parse().unwrap());
        assert_eq!(actor(&headers), "203.0.113.1");
    }

    #[test]
    fn slot_errors_map_to_status_codes() {
        let id = SlotId::new(1);
        let cases = [
            (SlotError::NotFound(id), StatusCode::NOT_FOUND),
            (SlotError::Busy(id), StatusCode::CONFLICT),
            (SlotError::UnsupportedArtifact("a.txt".into()), StatusCode::BAD_REQUEST),
            (
                SlotError::Allocation {
                    slot: id,
                    reason: "launch failed".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                SlotError::StoreUnavailable("disk".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(slot_error_response(&error).status(), status);
        }
    }
}

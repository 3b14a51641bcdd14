//! API Routes

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    middleware,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event_bus::Event;
use crate::models::ApiResponse;
use crate::speech::SpeechRequest;
use crate::state::AppState;
use crate::state_store::{StatePatch, SystemState};
use crate::stream_mux::StreamMultiplexer;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        // State
        .route("/api/state", get(get_state).post(patch_state))
        // Cameras
        .route("/api/cameras", get(list_cameras))
        .route("/api/cameras/start", post(camera_start))
        .route("/api/cameras/stop", post(camera_stop))
        .route("/api/cameras/status", get(camera_status))
        // Speech
        .route("/api/speak", post(speak))
        .route("/api/speech", get(speech_status))
        .route("/api/speech/:id/cancel", post(speech_cancel))
        // Metrics
        .route("/api/metrics", get(get_metrics))
        // Live streams
        .route("/stream/camera/:name", get(stream_camera))
        .route("/stream/events", get(stream_events))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            super::require_api_key,
        ));

    Router::new()
        .route("/api/health", get(super::health_check))
        .merge(protected)
        .with_state(state)
}

// ========================================
// State Handlers
// ========================================

async fn get_state(State(state): State<AppState>) -> Json<SystemState> {
    Json(state.state_store.get().await)
}

async fn patch_state(
    State(state): State<AppState>,
    Json(patch): Json<StatePatch>,
) -> Result<Json<SystemState>> {
    Ok(Json(state.state_store.set(patch).await?))
}

// ========================================
// Camera Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct CameraRequest {
    name: String,
}

async fn list_cameras(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "cameras": state.cameras.list() }))
}

async fn camera_start(
    State(state): State<AppState>,
    Json(req): Json<CameraRequest>,
) -> Result<Json<ApiResponse<String>>> {
    state.cameras.start(&req.name).await?;
    Ok(Json(ApiResponse::success(req.name)))
}

async fn camera_stop(
    State(state): State<AppState>,
    Json(req): Json<CameraRequest>,
) -> Result<Json<ApiResponse<String>>> {
    state.cameras.stop(&req.name).await?;
    Ok(Json(ApiResponse::success(req.name)))
}

async fn camera_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cameras.status().await)
}

// ========================================
// Speech Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct SpeakRequest {
    text: String,
    voice: Option<String>,
}

async fn speak(
    State(state): State<AppState>,
    Json(req): Json<SpeakRequest>,
) -> Result<impl IntoResponse> {
    let request = state.speech.enqueue(&req.text, req.voice)?;
    Ok(Json(
        json!({ "id": request.id, "created_at": request.created_at }),
    ))
}

async fn speech_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.speech.status())
}

async fn speech_cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<SpeechRequest>>> {
    Ok(Json(ApiResponse::success(state.speech.cancel(id)?)))
}

// ========================================
// Metrics Handler
// ========================================

async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.get().await)
}

// ========================================
// Stream Handlers
// ========================================

async fn stream_camera(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response> {
    let stream = state.stream_mux.open(&name).await?;
    Response::builder()
        .header(header::CONTENT_TYPE, StreamMultiplexer::CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Server-push event stream: replay the ring buffer so the client can
/// reconstruct recent state, then follow live events. The subscription
/// unregisters itself when the client disconnects and the stream drops.
async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let replay = futures::stream::iter(
        state
            .bus
            .history()
            .into_iter()
            .map(|event| Ok(sse_payload(&event))),
    );
    let live = futures::stream::unfold(state.bus.subscribe(), |mut sub| async move {
        let event = sub.recv().await?;
        Some((Ok(sse_payload(&event)), sub))
    });

    Sse::new(replay.chain(live)).keep_alive(KeepAlive::default())
}

fn sse_payload(event: &Event) -> SseEvent {
    SseEvent::default().data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}

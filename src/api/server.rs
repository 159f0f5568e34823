use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::buffer::now_ms;
use crate::config::CameraConfig;
use crate::recorder::{ManualError, TriggerHandler, TriggerOutcome};
use crate::status::StatusBroadcaster;

#[derive(Clone)]
pub struct AppState {
    pub cameras: Arc<Vec<CameraConfig>>,
    pub trigger: Arc<TriggerHandler>,
    pub status: StatusBroadcaster,
}

#[derive(Serialize)]
struct CameraResponse {
    id: String,
    name: String,
    url: String,
}

#[derive(Deserialize)]
struct TriggerRequest {
    camera_id: String,
    label: String,
    timestamp_ms: Option<u64>,
}

#[derive(Serialize)]
struct TriggerResponse {
    started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

pub async fn start_server(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/api/cameras", get(cameras_handler))
        .route("/api/cameras/{id}/segments", get(segments_handler))
        .route("/api/cameras/{id}/recording/start", post(manual_start_handler))
        .route("/api/cameras/{id}/recording/stop", post(manual_stop_handler))
        .route("/api/trigger", post(trigger_handler))
        .route("/api/status", get(status_handler))
        .route("/api/status/stream", get(status_stream_handler))
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn cameras_handler(State(state): State<AppState>) -> impl IntoResponse {
    let cameras: Vec<CameraResponse> = state
        .cameras
        .iter()
        .map(|c| CameraResponse {
            id: c.id.clone(),
            name: c.name.clone(),
            url: c.url.clone(),
        })
        .collect();
    Json(cameras)
}

async fn segments_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.trigger.segments_snapshot(&id) {
        Some(segments) => Json(segments).into_response(),
        None => (StatusCode::NOT_FOUND, "camera not found").into_response(),
    }
}

async fn trigger_handler(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Response {
    let timestamp = request.timestamp_ms.unwrap_or_else(now_ms);
    match state
        .trigger
        .handle_trigger(&request.camera_id, &request.label, timestamp)
        .await
    {
        TriggerOutcome::Started => Json(TriggerResponse {
            started: true,
            reason: None,
        })
        .into_response(),
        TriggerOutcome::AlreadyRecording => Json(TriggerResponse {
            started: false,
            reason: Some("already recording"),
        })
        .into_response(),
        TriggerOutcome::UnknownCamera => {
            (StatusCode::NOT_FOUND, "camera not found").into_response()
        }
    }
}

async fn manual_start_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.trigger.start_manual(&id).await {
        Ok(output) => Json(serde_json::json!({
            "recording": output.display().to_string(),
        }))
        .into_response(),
        Err(e) => manual_error_response(e),
    }
}

async fn manual_stop_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.trigger.stop_manual(&id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => manual_error_response(e),
    }
}

fn manual_error_response(e: ManualError) -> Response {
    match e {
        ManualError::UnknownCamera => (StatusCode::NOT_FOUND, "camera not found").into_response(),
        ManualError::AlreadyRecording => {
            (StatusCode::CONFLICT, "already recording").into_response()
        }
        ManualError::NotRecording => (StatusCode::CONFLICT, "not recording").into_response(),
        ManualError::Spawn(e) => {
            tracing::error!(error = %e, "manual recording spawn failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to start recording").into_response()
        }
    }
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.snapshot())
}

/// Push channel: the full status table on connect and again on every
/// change. A lagging observer skips ahead; a closed one is dropped.
async fn status_stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (current, mut rx) = state.status.subscribe();

    let stream = async_stream::stream! {
        if let Ok(event) = Event::default().json_data(&current) {
            yield Ok(event);
        }
        loop {
            match rx.recv().await {
                Ok(table) => {
                    if let Ok(event) = Event::default().json_data(&table) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "status observer lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

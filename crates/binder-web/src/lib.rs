//! Axum JSON + SSE surface for Binder: job triggers, live progress and
//! job history for the UI layer to poll or stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use binder_core::{JobKind, Resolution, TriggerKind};
use binder_sync::{SyncService, TriggerOutcome};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

pub const CRATE_NAME: &str = "binder-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/healthz", get(healthz_handler))
        .route("/api/jobs/{kind}/trigger", post(trigger_handler))
        .route("/api/jobs/{kind}/progress", get(progress_handler))
        .route("/api/jobs/{kind}/progress/stream", get(progress_stream_handler))
        .route("/api/jobs/{kind}/history", get(history_handler))
        .route("/api/items/{id}/resolve", post(resolve_item_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("BINDER_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn unknown_kind(kind: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("unknown job kind '{kind}'")})),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    let database = state.service.store().ping().await;
    let status = if database { "healthy" } else { "unhealthy" };
    let code = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({"status": status, "database": database}))).into_response()
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
) -> Response {
    let Some(kind) = JobKind::parse(&kind) else {
        return unknown_kind(&kind);
    };
    match Arc::clone(&state.service)
        .trigger(kind, TriggerKind::Manual, None)
        .await
    {
        Ok(TriggerOutcome::Accepted { job_id }) => (
            StatusCode::ACCEPTED,
            Json(json!({"accepted": true, "job_id": job_id})),
        )
            .into_response(),
        Ok(TriggerOutcome::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({"accepted": false, "reason": "already_running"})),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn progress_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
) -> Response {
    let Some(kind) = JobKind::parse(&kind) else {
        return unknown_kind(&kind);
    };
    match state.service.current_progress(kind).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => server_error(err),
    }
}

/// Push progress as an SSE stream of small JSON messages. The stream ends
/// after the job's terminal event; subscribers dropping mid-job never affect
/// the job itself.
async fn progress_stream_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
) -> Response {
    let Some(kind) = JobKind::parse(&kind) else {
        return unknown_kind(&kind);
    };
    let rx = state.service.subscribe();
    let stream = futures::stream::unfold(Some(rx), move |rx| async move {
        let mut rx = rx?;
        loop {
            match rx.recv().await {
                Ok(view) if view.kind == kind => {
                    let terminal = view.status.is_terminal();
                    let Ok(event) = Event::default().json_data(&view) else {
                        continue;
                    };
                    let next = if terminal { None } else { Some(rx) };
                    return Some((Ok::<Event, Infallible>(event), next));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    limit: Option<u32>,
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let Some(kind) = JobKind::parse(&kind) else {
        return unknown_kind(&kind);
    };
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    match state.service.recent_history(kind, limit).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    kind: String,
}

/// One-off resolve for a single card on the request path, e.g. right after
/// the user adds it. Goes through the same adapters and rate limiters as
/// the batch jobs.
async fn resolve_item_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(card_id): AxumPath<i64>,
    Query(query): Query<ResolveQuery>,
) -> Response {
    let Some(kind) = JobKind::parse(&query.kind) else {
        return unknown_kind(&query.kind);
    };
    match state.service.store().card_by_id(card_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("card {card_id} does not exist")})),
            )
                .into_response();
        }
        Err(err) => return server_error(err.into()),
    }
    match state.service.resolve_item_now(card_id, kind).await {
        Ok(Resolution::Resolved(record)) => Json(json!({
            "outcome": "resolved",
            "source": record.source,
            "external_id": record.external_id,
        }))
        .into_response(),
        Ok(Resolution::NotFound) => Json(json!({"outcome": "not_found"})).into_response(),
        Ok(Resolution::Unavailable) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"outcome": "unavailable"})),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

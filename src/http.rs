use crate::history::TableView;
use crate::metrics::Metrics;
use crate::sampler::{Controls, Publication};
use crate::state::{ProcessRecord, SystemSummary};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub controls: Arc<Controls>,
    pub publication: Publication,
}

#[derive(Debug, Serialize)]
pub struct ApiSnapshot {
    pub timestamp: i64,
    pub paused: bool,
    pub lines: Vec<String>,
    pub system: Option<SystemSummary>,
    pub processes: Vec<ProcessRecord>,
}

#[derive(Debug, Serialize)]
pub struct ApiHistory {
    pub cpu: TableView,
    pub mem: TableView,
}

#[derive(Debug, Serialize)]
struct ApiControls {
    paused: bool,
}

pub fn build_router(metrics: Arc<Metrics>, controls: Arc<Controls>, publication: Publication) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/history", get(history_handler))
        .route("/api/history/reset", post(reset_handler))
        .route("/api/pause", post(pause_handler))
        .route("/api/resume", post(resume_handler))
        .with_state(HttpAppState {
            metrics,
            controls,
            publication,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> Response {
    let latest = state.publication.borrow().clone();
    let Some(published) = latest else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no snapshot yet").into_response();
    };
    Json(ApiSnapshot {
        timestamp: published.snapshot.timestamp,
        paused: state.controls.is_paused(),
        lines: published.lines.clone(),
        system: published.snapshot.system.clone(),
        processes: published.snapshot.processes.clone(),
    })
    .into_response()
}

async fn history_handler(State(state): State<HttpAppState>) -> Response {
    let latest = state.publication.borrow().clone();
    let Some(published) = latest else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no snapshot yet").into_response();
    };
    Json(ApiHistory {
        cpu: published.history.cpu.view(),
        mem: published.history.mem.view(),
    })
    .into_response()
}

async fn reset_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    state.controls.request_reset();
    info!("history reset requested");
    StatusCode::ACCEPTED
}

async fn pause_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    state.controls.pause();
    info!("publication paused");
    Json(ApiControls { paused: true })
}

async fn resume_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    state.controls.resume();
    info!("publication resumed");
    Json(ApiControls { paused: false })
}

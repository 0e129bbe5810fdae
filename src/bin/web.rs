//! LessonFlow HTTP 接口
//!
//! 启动: cargo run --bin lessonflow-web --features web
//! - POST /api/runs                      启动教案运行（可选 Idempotency-Key 头）
//! - GET  /api/runs/:id/events?after_seq  SSE 事件流，支持续传（也接受 Last-Event-ID 头）
//! - POST /api/tutor                     一轮辅导对话（同步返回）
//! - GET  /api/router/metrics?n=         最近的路由记录
//! - GET  /api/health

#![cfg(feature = "web")]

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use lessonflow::config::load_config;
use lessonflow::graph::{PlanRequest, TutorRequest};
use lessonflow::{observability, Orchestrator, OrchestratorError, RunStart};

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

struct AppState {
    orchestrator: Orchestrator,
}

/// 请求体可携带调用方指定的 run_id
#[derive(Debug, Deserialize)]
struct StartRunBody<T> {
    #[serde(flatten)]
    request: T,
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    after_seq: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    n: Option<usize>,
}

/// 编排错误到 HTTP 状态码；响应体只带错误类别与简短信息
fn error_response(err: OrchestratorError) -> Response {
    let status = match &err {
        OrchestratorError::DuplicateRun(_) => StatusCode::CONFLICT,
        OrchestratorError::CircuitOpen { .. } | OrchestratorError::Transient { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        OrchestratorError::WorkflowTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::Fatal { .. } | OrchestratorError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let message = match &err {
        OrchestratorError::DuplicateRun(_) => err.to_string(),
        _ => "run failed".to_string(),
    };
    tracing::warn!(error = %err, "request failed");
    (status, Json(json!({ "error": message, "kind": err.kind() }))).into_response()
}

/// POST /api/runs
async fn api_start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<StartRunBody<PlanRequest>>,
) -> Response {
    let StartRunBody { request, run_id } = body;
    if request.prompt.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "prompt is required" })))
            .into_response();
    }
    let key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match state.orchestrator.start_plan_run(request, run_id, key).await {
        Ok(RunStart::Started { run_id }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "run_id": run_id,
                "events": format!("/api/runs/{run_id}/events"),
            })),
        )
            .into_response(),
        Ok(RunStart::Cached { outcome }) => {
            (StatusCode::OK, Json(json!({ "cached": true, "outcome": outcome }))).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// GET /api/runs/:id/events：回放 after_seq 之后的事件并跟随实时事件，终态后关闭
async fn api_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let after_seq = query.after_seq.or(last_event_id);

    let events = state
        .orchestrator
        .event_stream(&run_id, after_seq)
        .map(|entry| {
            Ok(Event::default()
                .id(entry.seq.to_string())
                .event(entry.kind.as_str())
                .data(entry.payload))
        });
    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// POST /api/tutor
async fn api_tutor(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<StartRunBody<TutorRequest>>,
) -> Response {
    let StartRunBody { request, run_id } = body;
    let key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok());
    let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    match state.orchestrator.run_tutor(&run_id, request, key).await {
        Ok(outcome) => Json(json!({ "run_id": run_id, "outcome": outcome })).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /api/router/metrics
async fn api_router_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let metrics = state.orchestrator.router_metrics(query.n.unwrap_or(50));
    Json(metrics).into_response()
}

async fn api_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });
    let orchestrator = Orchestrator::from_config(cfg).context("Failed to build orchestrator")?;
    let state = Arc::new(AppState { orchestrator });

    let app = Router::new()
        .route("/api/runs", post(api_start_run))
        .route("/api/runs/:id/events", get(api_run_events))
        .route("/api/tutor", post(api_tutor))
        .route("/api/router/metrics", get(api_router_metrics))
        .route("/api/health", get(api_health))
        .with_state(state);

    let port = std::env::var("LESSONFLOW_WEB_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("LessonFlow API: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

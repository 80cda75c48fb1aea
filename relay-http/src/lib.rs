//! HTTP surface of the relay kernel.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use relay_context::Role;
use relay_core::RelayKernel;
use relay_types::ToolRequest;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

pub mod error;
pub use error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<RelayKernel>,
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope { success: true, data })
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::invalid_input(e.body_text()))
}

pub fn router(kernel: Arc<RelayKernel>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/tools/call", post(call_tool))
        .route("/v1/tools/events", get(tool_events))
        .route("/v1/queues", get(list_queues))
        .route("/v1/queues/:queue/jobs", post(enqueue_job))
        .route("/v1/queues/:queue/stats", get(queue_stats))
        .route("/v1/jobs/:id", get(get_job))
        .route("/v1/circuits/:service", get(circuit))
        .route("/v1/circuits/:service/reset", post(reset_circuit))
        .route("/v1/threads", post(create_thread))
        .route("/v1/threads/:id", get(get_thread))
        .route("/v1/threads/:id/messages", post(append_message))
        .route("/v1/threads/:id/fork", post(fork_thread))
        .with_state(AppState { kernel })
        .layer(TraceLayer::new_for_http())
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "tools": state.kernel.tool_names() }))
}

/// Inline call, or a stream ticket when `stream: true`.
async fn call_tool(
    State(state): State<AppState>,
    payload: Result<Json<ToolRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(payload)?;
    if request.stream {
        let issued = state.kernel.issue_ticket(request).await?;
        return Ok(Json(issued).into_response());
    }
    let inv = state.kernel.invoke(request).await?;
    Ok(ok(json!({
        "tool": inv.tool,
        "request_id": inv.request_id,
        "result": inv.result,
        "latency_ms": inv.latency_ms,
        "cached": inv.cached,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    ticket: String,
}

/// Always 200; ticket and tool failures arrive as `error` then `done` events.
async fn tool_events(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = state.kernel.stream(q.ticket).map(|ev| {
        Ok::<_, Infallible>(Event::default().event(ev.name()).data(ev.data().to_string()))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct EnqueueBody {
    #[serde(flatten)]
    request: ToolRequest,
    #[serde(default)]
    priority: Option<f64>,
    #[serde(default)]
    max_attempts: Option<u32>,
}

async fn enqueue_job(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    payload: Result<Json<EnqueueBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let body = json_body(payload)?;
    let mut opts = state.kernel.config().push_options(body.priority);
    if let Some(max) = body.max_attempts {
        opts.max_attempts = max.max(1);
    }
    let job_id = state.kernel.enqueue(&queue, body.request, opts).await?;
    Ok((StatusCode::ACCEPTED, ok(json!({ "job_id": job_id, "queue": queue }))))
}

async fn queue_stats(State(state): State<AppState>, Path(queue): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.kernel.queue_stats(&queue).await?))
}

async fn list_queues(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.kernel.list_queues().await?))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.kernel.job(&id).await?))
}

async fn circuit(State(state): State<AppState>, Path(service): Path<String>) -> impl IntoResponse {
    ok(state.kernel.circuit(&service).await)
}

async fn reset_circuit(State(state): State<AppState>, Path(service): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.kernel.reset_circuit(&service).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CreateThreadBody {
    #[serde(default)]
    tags: Vec<String>,
}

async fn create_thread(
    State(state): State<AppState>,
    payload: Option<Json<CreateThreadBody>>,
) -> ApiResult<impl IntoResponse> {
    let tags = payload.map(|Json(b)| b.tags).unwrap_or_default();
    let view = state.kernel.create_thread(tags).await?;
    Ok((StatusCode::CREATED, ok(view)))
}

async fn get_thread(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(ok(state.kernel.thread(&id).await?))
}

#[derive(Debug, Deserialize)]
struct AppendBody {
    role: Role,
    content: String,
    #[serde(default)]
    meta: Value,
}

async fn append_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<AppendBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let b = json_body(payload)?;
    let message_id = state
        .kernel
        .append_message(&id, b.role, b.content, b.meta)
        .await?;
    Ok((StatusCode::CREATED, ok(json!({ "message_id": message_id }))))
}

#[derive(Debug, Deserialize)]
struct ForkBody {
    message_id: String,
}

async fn fork_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ForkBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let b = json_body(payload)?;
    let view = state.kernel.fork_thread(&id, &b.message_id).await?;
    Ok((StatusCode::CREATED, ok(view)))
}

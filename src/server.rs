//! HTTP surface and per-request orchestration.
//!
//! One request runs load -> translate -> call -> translate-back -> store as
//! an independent task. The router, middleware, and operational endpoints
//! live here too.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::config::Settings;
use crate::error::BridgeError;
use crate::models::chat::{ChatCompletionResponse, ChatMessage, ChatStreamChunk};
use crate::models::responses::{ResponseObject, ResponsesRequest};
use crate::state::{ConversationStore, StoredTurn};
use crate::streaming::{StreamBridge, StreamEvent};
use crate::translate::request::TranslationContext;
use crate::translate::{
    chat_response_to_response_object, response::assistant_message_for_state, translate_request,
};
use crate::tools::ToolRegistry;
use crate::upstream::{
    apply_degrade_fields, RetryPolicy, SseConnection, UpstreamClient, UpstreamResponse,
};
use crate::util::{new_id, now_ts};

/// Process-local request counters, surfaced by `/metrics`.
#[derive(Debug, Default)]
pub struct Metrics {
    requests_total: AtomicU64,
    responses_2xx: AtomicU64,
    responses_4xx: AtomicU64,
    responses_5xx: AtomicU64,
    streams_started: AtomicU64,
}

impl Metrics {
    fn observe(&self, status: http::StatusCode) {
        if status.is_success() {
            self.responses_2xx.fetch_add(1, Ordering::Relaxed);
        } else if status.is_client_error() {
            self.responses_4xx.fetch_add(1, Ordering::Relaxed);
        } else if status.is_server_error() {
            self.responses_5xx.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> Value {
        json!({
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "responses_2xx": self.responses_2xx.load(Ordering::Relaxed),
            "responses_4xx": self.responses_4xx.load(Ordering::Relaxed),
            "responses_5xx": self.responses_5xx.load(Ordering::Relaxed),
            "streams_started": self.streams_started.load(Ordering::Relaxed),
        })
    }
}

/// Shared application state: immutable after startup apart from the store
/// and the counters.
pub struct AppState {
    pub settings: Settings,
    pub registry: ToolRegistry,
    pub upstream: UpstreamClient,
    pub store: Arc<ConversationStore>,
    pub retry: RetryPolicy,
    pub metrics: Metrics,
}

impl AppState {
    pub fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        let upstream = UpstreamClient::from_settings(&settings)?;
        let store = ConversationStore::from_settings(&settings)?;
        let retry = RetryPolicy::from_settings(&settings);
        Ok(Self {
            registry: ToolRegistry::with_defaults(),
            upstream,
            store,
            retry,
            metrics: Metrics::default(),
            settings,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .route("/v1/responses", post(create_response))
        .route(
            "/v1/responses/{id}",
            get(get_response).delete(delete_response),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            request_context,
        ))
        .layer(cors_layer_from_env())
        .with_state(state)
}

/// Accept an inbound X-Request-Id or mint one, thread it through the log
/// context, and always echo it on the response. The upstream's own request
/// id is logged elsewhere and never exposed here.
async fn request_context(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| new_id("req"));

    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let mut response = next.run(request).instrument(span).await;
    state.metrics.observe(response.status());
    if let Ok(value) = http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn version() -> Json<Value> {
    Json(json!({"version": env!("CARGO_PKG_VERSION")}))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.metrics.snapshot())
}

async fn get_response(
    State(state): State<Arc<AppState>>,
    Path(response_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, BridgeError> {
    require_client_auth(&state.settings, &headers)?;
    if !state.store.is_enabled() {
        return Err(BridgeError::NotImplemented("State store is disabled".into()));
    }
    let stored = state
        .store
        .get(&response_id)
        .await?
        .ok_or_else(|| BridgeError::NotFound("response_id not found".into()))?;
    Ok(Json(stored.response).into_response())
}

async fn delete_response(
    State(state): State<Arc<AppState>>,
    Path(response_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, BridgeError> {
    require_client_auth(&state.settings, &headers)?;
    if !state.store.is_enabled() {
        return Err(BridgeError::NotImplemented("State store is disabled".into()));
    }
    let deleted = state.store.delete(&response_id).await?;
    Ok(Json(json!({"id": response_id, "deleted": deleted})).into_response())
}

async fn create_response(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ResponsesRequest>,
) -> Result<Response, BridgeError> {
    require_client_auth(&state.settings, &headers)?;

    let mut history: Vec<ChatMessage> = Vec::new();
    if let Some(previous_id) = &payload.previous_response_id {
        if !state.store.is_enabled() {
            return Err(BridgeError::NotImplemented("State store is disabled".into()));
        }
        let stored = state
            .store
            .get(previous_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound("previous_response_id not found".into()))?;
        history = stored.messages;
    }

    let translation = translate_request(&state.settings, &state.registry, &payload, &history)?;
    let response_id = new_id("resp");
    let created_at = now_ts();

    if payload.stream == Some(true) {
        stream_response(state, payload, translation, response_id, created_at).await
    } else {
        complete_response(state, payload, translation, response_id, created_at).await
    }
}

// ============================================================================
// Non-stream path
// ============================================================================

async fn complete_response(
    state: Arc<AppState>,
    payload: ResponsesRequest,
    translation: crate::translate::TranslationResult,
    response_id: String,
    created_at: u64,
) -> Result<Response, BridgeError> {
    let model = translation.chat_request.model.clone();
    let mut context = translation.context;
    let mut upstream_payload = serde_json::to_value(&translation.chat_request)?;

    let first = call_upstream_degrading(&state, &mut upstream_payload, &mut context).await?;
    log_upstream_id(&first, "upstream completion received");

    let mut chat_response = parse_completion(&first)?;
    let mut response = chat_response_to_response_object(
        &chat_response,
        &model,
        &context.tool_map,
        response_id.clone(),
        created_at,
    );

    // Some upstreams occasionally answer HTTP 200 with empty choices or an
    // empty assistant message; one retry covers short "ACK/OK" turns.
    let wants_output = payload.max_output_tokens.map_or(true, |n| n > 0);
    if response.output.is_empty() && wants_output {
        tracing::warn!("upstream returned empty output; retrying once");
        let second = call_upstream_degrading(&state, &mut upstream_payload, &mut context).await?;
        log_upstream_id(&second, "upstream completion received (retry)");
        let retried = parse_completion(&second)?;
        let rebuilt = chat_response_to_response_object(
            &retried,
            &model,
            &context.tool_map,
            response_id.clone(),
            created_at,
        );
        if rebuilt.output.is_empty() {
            return Err(BridgeError::BadGateway(
                "Upstream returned empty completion".into(),
            ));
        }
        chat_response = retried;
        response = rebuilt;
    }

    write_turn(
        &state,
        &payload,
        &context,
        &response_id,
        &model,
        &response,
        assistant_message_for_state(&chat_response),
    )
    .await;

    Ok(Json(response).into_response())
}

fn parse_completion(response: &UpstreamResponse) -> Result<ChatCompletionResponse, BridgeError> {
    response
        .json::<ChatCompletionResponse>()
        .map_err(|err| BridgeError::BadGateway(format!("Invalid upstream completion body: {err}")))
}

/// One upstream call with retry, plus a single degraded retry when a 4xx
/// error names a configured fragile field. Failures pass the upstream's
/// status and error body through.
async fn call_upstream_degrading(
    state: &AppState,
    upstream_payload: &mut Value,
    context: &mut TranslationContext,
) -> Result<UpstreamResponse, BridgeError> {
    let response = state
        .upstream
        .call_with_retry(upstream_payload, &state.retry)
        .await?;
    if response.status.as_u16() < 400 {
        return Ok(response);
    }

    let detail = response.error_detail();
    if response.status.is_client_error() {
        if let Some((degraded, dropped)) = apply_degrade_fields(
            upstream_payload,
            &state.settings.degrade_fields,
            &detail.message,
        ) {
            tracing::warn!(field = %dropped, "upstream rejected field; degrading and retrying");
            *upstream_payload = degraded;
            context.dropped_fields.push(dropped);
            let retried = state
                .upstream
                .call_with_retry(upstream_payload, &state.retry)
                .await?;
            if retried.status.as_u16() < 400 {
                return Ok(retried);
            }
            return Err(BridgeError::Upstream {
                status: retried.status.as_u16(),
                detail: retried.error_detail(),
            });
        }
    }
    Err(BridgeError::Upstream {
        status: response.status.as_u16(),
        detail,
    })
}

fn log_upstream_id(response: &UpstreamResponse, message: &str) {
    if let Some(request_id) = &response.request_id {
        tracing::info!(upstream_request_id = %request_id, "{}", message);
    }
}

async fn write_turn(
    state: &AppState,
    payload: &ResponsesRequest,
    context: &TranslationContext,
    response_id: &str,
    model: &str,
    response: &ResponseObject,
    assistant_message: Option<ChatMessage>,
) {
    if !state.store.is_enabled() || payload.store == Some(false) {
        return;
    }
    let mut messages = context.messages_for_state.clone();
    if let Some(assistant) = assistant_message {
        messages.push(assistant);
    }
    let record = StoredTurn {
        response: response.clone(),
        messages,
        tool_function_map: context.tool_map.function_to_external.clone(),
        model: model.to_string(),
    };
    if let Err(err) = state
        .store
        .put(response_id, &record, state.settings.state_ttl_seconds)
        .await
    {
        tracing::error!(error = %err, "failed to persist stored turn");
    }
}

// ============================================================================
// Streaming path
// ============================================================================

async fn stream_response(
    state: Arc<AppState>,
    payload: ResponsesRequest,
    translation: crate::translate::TranslationResult,
    response_id: String,
    created_at: u64,
) -> Result<Response, BridgeError> {
    let model = translation.chat_request.model.clone();
    let mut context = translation.context;
    let mut upstream_payload = serde_json::to_value(&translation.chat_request)?;
    if let Some(obj) = upstream_payload.as_object_mut() {
        obj.insert("stream".into(), Value::Bool(true));
    }

    let headers_timeout = Duration::from_secs_f64(state.settings.request_timeout_s);
    let mut degraded_once = false;
    let connection = loop {
        match state
            .upstream
            .connect_stream(&upstream_payload, &state.retry, headers_timeout)
            .await
        {
            Ok(connection) => break connection,
            Err(BridgeError::Upstream { status, detail })
                if !degraded_once && (400..500).contains(&status) =>
            {
                match apply_degrade_fields(
                    &upstream_payload,
                    &state.settings.degrade_fields,
                    &detail.message,
                ) {
                    Some((degraded, dropped)) => {
                        tracing::warn!(field = %dropped, "upstream rejected field; degrading and reconnecting");
                        upstream_payload = degraded;
                        context.dropped_fields.push(dropped);
                        degraded_once = true;
                    }
                    None => return Err(BridgeError::Upstream { status, detail }),
                }
            }
            Err(err) => return Err(err),
        }
    };

    if let Some(request_id) = &connection.request_id {
        tracing::info!(upstream_request_id = %request_id, "upstream stream opened");
    }
    state.metrics.streams_started.fetch_add(1, Ordering::Relaxed);

    let bridge = StreamBridge::new(
        response_id.clone(),
        model.clone(),
        created_at,
        context.tool_map.clone(),
    );
    let store_write = (state.store.is_enabled() && payload.store != Some(false)).then(|| {
        PendingTurn {
            response_id,
            messages: context.messages_for_state.clone(),
            tool_function_map: context.tool_map.function_to_external.clone(),
            model,
            ttl_seconds: state.settings.state_ttl_seconds,
        }
    });

    let (tx, rx) = mpsc::channel::<Result<axum::response::sse::Event, Infallible>>(32);
    let store = state.store.clone();
    let span = tracing::Span::current();
    tokio::spawn(
        drive_stream(connection, bridge, tx, store, store_write).instrument(span),
    );

    Ok(Sse::new(ReceiverStream::new(rx)).into_response())
}

struct PendingTurn {
    response_id: String,
    messages: Vec<ChatMessage>,
    tool_function_map: std::collections::HashMap<String, String>,
    model: String,
    ttl_seconds: u64,
}

/// Serial per-request loop: read upstream frames, emit derived events.
/// A send failure means the client went away; the upstream stream is dropped
/// and no state is written.
async fn drive_stream(
    mut connection: SseConnection,
    mut bridge: StreamBridge,
    tx: mpsc::Sender<Result<axum::response::sse::Event, Infallible>>,
    store: Arc<ConversationStore>,
    pending: Option<PendingTurn>,
) {
    let mut started = false;

    while let Some(frame) = connection.frames.next().await {
        match frame {
            Ok(data) => {
                if !started {
                    started = true;
                    if emit_all(&tx, bridge.start_events()).await.is_err() {
                        return;
                    }
                }
                if data == "[DONE]" {
                    break;
                }
                match serde_json::from_str::<ChatStreamChunk>(&data) {
                    Ok(chunk) => {
                        if emit_all(&tx, bridge.process_chunk(&chunk)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping malformed upstream chunk");
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "upstream stream failed mid-flight");
                if !started && emit_all(&tx, bridge.start_events()).await.is_err() {
                    return;
                }
                let error = json!({
                    "message": err.to_string(),
                    "type": "upstream_error",
                });
                let _ = emit(&tx, bridge.failure_event(error)).await;
                return;
            }
        }
    }

    if !started && emit_all(&tx, bridge.start_events()).await.is_err() {
        return;
    }
    if emit_all(&tx, bridge.finish_events()).await.is_err() {
        return;
    }

    // Converge with the non-stream path: same StoredTurn shape, same write.
    if let Some(pending) = pending {
        let mut messages = pending.messages;
        if let Some(assistant) = bridge.assistant_message() {
            messages.push(assistant);
        }
        let record = StoredTurn {
            response: bridge.final_response(),
            messages,
            tool_function_map: pending.tool_function_map,
            model: pending.model,
        };
        if let Err(err) = store
            .put(&pending.response_id, &record, pending.ttl_seconds)
            .await
        {
            tracing::error!(error = %err, "failed to persist stored turn after stream");
        }
    }
}

async fn emit(
    tx: &mpsc::Sender<Result<axum::response::sse::Event, Infallible>>,
    event: StreamEvent,
) -> Result<(), ()> {
    tx.send(Ok(event.to_sse())).await.map_err(|_| ())
}

async fn emit_all(
    tx: &mpsc::Sender<Result<axum::response::sse::Event, Infallible>>,
    events: Vec<StreamEvent>,
) -> Result<(), ()> {
    for event in events {
        emit(tx, event).await?;
    }
    Ok(())
}

// ============================================================================
// Client auth and CORS
// ============================================================================

fn require_client_auth(settings: &Settings, headers: &HeaderMap) -> Result<(), BridgeError> {
    let Some(expected) = &settings.client_api_key else {
        return Ok(());
    };
    let header = headers
        .get(http::header::AUTHORIZATION)
        .or_else(|| headers.get("x-api-key"))
        .and_then(|v| v.to_str().ok());
    let Some(header) = header else {
        return Err(BridgeError::Unauthorized("Missing client API key".into()));
    };
    let token = if header.len() >= 7 && header[..7].eq_ignore_ascii_case("bearer ") {
        header[7..].trim()
    } else {
        header.trim()
    };
    if token != expected {
        return Err(BridgeError::Unauthorized("Invalid client API key".into()));
    }
    Ok(())
}

/// Build a CORS layer from environment variables.
///
/// CORS_ALLOWED_ORIGINS: "*" or comma-separated origins; defaults to Any.
pub fn cors_layer_from_env() -> tower_http::cors::CorsLayer {
    let mut layer = tower_http::cors::CorsLayer::new()
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            let values: Vec<http::HeaderValue> = origins
                .split(',')
                .filter_map(|part| http::HeaderValue::from_str(part.trim()).ok())
                .collect();
            if values.is_empty() {
                layer = layer.allow_origin(tower_http::cors::Any);
            } else {
                layer = layer.allow_origin(tower_http::cors::AllowOrigin::list(values));
            }
        }
        _ => layer = layer.allow_origin(tower_http::cors::Any),
    }
    layer
}

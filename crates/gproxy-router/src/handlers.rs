use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use gproxy_core::state::AppState;
use gproxy_core::{ProxyError, RequestController, RequestOutcome, estimate_input_tokens};
use gproxy_protocol::anthropic::CreateMessageRequest;
use gproxy_provider_core::{AuthMode, Headers, ProviderHealthSnapshot, ProviderKind, header_get};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

pub async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "ok": true })))
}

/// `POST /v1/messages`. Parses the body by hand (rather than the `Json`
/// extractor) so a malformed body maps to the Anthropic error envelope
/// instead of axum's own rejection body.
pub async fn create_message(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let request: CreateMessageRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(&ProxyError::ClientError(err.to_string()), true),
    };

    let incoming: Headers = headers_to_vec(&headers);
    let request_id = format!("req_{}", Uuid::new_v4().simple());
    let original_request_id = header_get(&incoming, "idempotency-key").map(|value| value.to_string());

    let controller = RequestController::new(state);
    match controller.handle(request, incoming, request_id, None, original_request_id).await {
        RequestOutcome::Json { provider_name, body } => {
            let mut response = Json(*body).into_response();
            set_provider_header(&mut response, &provider_name);
            response
        }
        RequestOutcome::Stream { provider_name, receiver } => {
            let stream = ReceiverStream::new(receiver).map(Ok::<_, Infallible>);
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header("x-accel-buffering", "no")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "stream_build_failed").into_response());
            set_provider_header(&mut response, &provider_name);
            response
        }
        RequestOutcome::Error { error, exhausted } => error_response(&error, exhausted),
    }
}

/// `POST /v1/messages/count_tokens`. Out of core scope (§1): a character
/// heuristic rather than a provider's own tokenizer.
pub async fn count_tokens(body: Bytes) -> Response {
    let request: CreateMessageRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(&ProxyError::ClientError(err.to_string()), true),
    };
    Json(json!({ "input_tokens": estimate_input_tokens(&request) })).into_response()
}

#[derive(Debug, Serialize)]
struct ProviderStatus {
    name: String,
    kind: ProviderKind,
    auth_mode: AuthMode,
    enabled: bool,
    eligible: bool,
    health: ProviderHealthSnapshot,
}

/// `GET /providers`: the registry joined with live health state.
pub async fn list_providers(State(state): State<Arc<AppState>>) -> Response {
    let registry = state.registry.load();
    let now = gproxy_provider_core::health::now_secs();
    let statuses: Vec<ProviderStatus> = registry
        .all()
        .map(|provider| ProviderStatus {
            name: provider.name.clone(),
            kind: provider.kind,
            auth_mode: provider.auth_mode,
            enabled: provider.enabled,
            eligible: provider.enabled && state.health.is_eligible(&provider.name, now),
            health: state.health.snapshot(&provider.name),
        })
        .collect();
    Json(statuses).into_response()
}

/// `POST /providers/reload`: re-read the config file and atomically swap
/// `config`/`registry`. Health, dedup, and router state are untouched.
pub async fn reload_providers(State(state): State<Arc<AppState>>) -> Response {
    match state.reload_from_path() {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(json!({ "ok": false, "error": err.to_string() }))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    #[serde(default)]
    force: bool,
}

/// `POST /cleanup?force=bool`: the operational knob that force-expires
/// cached/pending dedup state and, when `force`, resets health counters too.
pub async fn cleanup(State(state): State<Arc<AppState>>, Query(query): Query<CleanupQuery>) -> Response {
    let now = gproxy_provider_core::health::now_secs();
    state.dedup.sweep(now);
    state.health.sweep(now);
    if query.force {
        state.dedup.force_expire_all();
        state.health.reset_all();
    }
    Json(json!({ "ok": true, "force": query.force })).into_response()
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str().to_string(), value.to_string())))
        .collect()
}

fn set_provider_header(response: &mut Response, provider_name: &str) {
    if let Ok(value) = HeaderValue::from_str(provider_name) {
        response.headers_mut().insert("x-provider-used", value);
    }
}

fn error_response(error: &ProxyError, exhausted: bool) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error.to_envelope(exhausted))).into_response()
}

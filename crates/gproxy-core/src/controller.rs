//! Request controller (C8, §4.8): the state machine that ties fingerprinting,
//! dedup, routing, the upstream client, and the broadcaster together.
//!
//! `RequestController::handle` is the single entry point the HTTP layer
//! calls for `POST /v1/messages`. It never returns until either a terminal
//! `RequestOutcome` is known or (for a streaming leader) the first upstream
//! byte has arrived — everything after that is driven by a detached pump
//! task feeding the broadcaster.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gproxy_protocol::anthropic::{CreateMessageRequest, CreateMessageResponse, StreamEvent};
use gproxy_protocol::openai::ChatCompletionChunk;
use gproxy_protocol::sse::SseParser;
use gproxy_provider_core::{Event, Headers, ModelRouter, Provider, ProviderKind, StreamingMode};
use gproxy_transform::generate_content::claude2openai_chat_completions::{OpenAiToClaudeStreamState, transform_request, transform_response};
use tokio::sync::mpsc;

use crate::broadcaster::{Broadcaster, SubscriberKind, synthesize_stream};
use crate::dedup::{Decision, WaiterOutcome};
use crate::error::ProxyError;
use crate::fingerprint::fingerprint;
use crate::state::AppState;
use crate::upstream::{UpstreamFailure, classify};

pub enum RequestOutcome {
    Json { provider_name: String, body: Box<CreateMessageResponse> },
    Stream { provider_name: String, receiver: mpsc::Receiver<Bytes> },
    Error { error: ProxyError, exhausted: bool },
}

pub struct RequestController {
    state: Arc<AppState>,
}

impl RequestController {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// §4.8 end to end: sweep health, compute the fingerprint, consult the
    /// dedup coordinator, and either serve a cached/broadcast result or lead
    /// a fresh attempt through the candidate list.
    pub async fn handle(&self, request: CreateMessageRequest, incoming_headers: Headers, request_id: String, explicit_provider: Option<String>, original_request_id: Option<String>) -> RequestOutcome {
        let now = gproxy_provider_core::health::now_secs();
        self.state.health.sweep(now);

        let wants_stream = request.wants_stream();
        let config = self.state.config.load();

        // Computed once here, from the request as the client sent it — before
        // `lead` may overwrite `model` with a route's `upstream_model`. Every
        // dedup/broadcaster key downstream (the `pending` entry, the waiters,
        // the streaming leader's broadcaster registration, the cached result)
        // must use this same value, or a model-remapping route fingerprints
        // the leader and its duplicates differently and dedup silently breaks.
        let fp = fingerprint(&request, self.state.include_max_tokens_in_fingerprint());

        if !config.settings.deduplication.enabled {
            return self.lead(request, incoming_headers, &request_id, explicit_provider.as_deref(), now, wants_stream, &fp).await;
        }

        match self.state.dedup.on_arrival(&fp, &request_id, wants_stream, original_request_id, now) {
            Decision::ServeCached(outcome) => {
                self.state.events.emit(Event::RequestServedFromCache { fingerprint: fp.clone(), request_id: request_id.clone() }).await;
                outcome_to_result(outcome, &self.state).await
            }
            Decision::JoinBroadcaster(broadcaster) => {
                self.state.events.emit(Event::RequestJoinedBroadcaster { fingerprint: fp.clone(), request_id: request_id.clone() }).await;
                let provider_name = broadcaster.provider_name.clone();
                let receiver = broadcaster.subscribe(SubscriberKind::Duplicate);
                RequestOutcome::Stream { provider_name, receiver }
            }
            Decision::Wait(rx) => {
                let wait_secs = self.state.dedup_wait_secs();
                match tokio::time::timeout(Duration::from_secs(wait_secs), rx).await {
                    Ok(Ok(outcome)) => outcome_to_result(outcome, &self.state).await,
                    Ok(Err(_)) | Err(_) => RequestOutcome::Error { error: ProxyError::DeduplicationTimeoutError, exhausted: true },
                }
            }
            Decision::Lead => {
                self.state.events.emit(Event::RequestLeading { fingerprint: fp.clone(), request_id: request_id.clone() }).await;
                let outcome = self.lead(request, incoming_headers, &request_id, explicit_provider.as_deref(), now, wants_stream, &fp).await;
                self.finish_lead(&fp, now, outcome).await
            }
        }
    }

    /// Stores the leader's terminal outcome in the dedup coordinator before
    /// handing it back to the caller. A streaming success has already been
    /// recorded by the pump task by the time this runs (the receiver we hold
    /// here is only the primary subscriber), so this only persists
    /// non-streaming terminal outcomes and errors.
    async fn finish_lead(&self, fp: &str, now: u64, outcome: RequestOutcome) -> RequestOutcome {
        match outcome {
            RequestOutcome::Json { provider_name, body } => {
                self.state.dedup.complete_success(fp, &provider_name, &body.id, Some((*body).clone()), None, now);
                RequestOutcome::Json { provider_name, body }
            }
            RequestOutcome::Error { error, exhausted } => {
                if exhausted {
                    self.state.dedup.complete_failure(fp, error.clone(), now);
                }
                RequestOutcome::Error { error, exhausted }
            }
            other => other,
        }
    }

    /// Walks the ordered candidate list, trying each provider until one
    /// succeeds, a non-failover-eligible error is hit, or the list is
    /// exhausted.
    async fn lead(&self, request: CreateMessageRequest, incoming_headers: Headers, request_id: &str, explicit_provider: Option<&str>, now: u64, wants_stream: bool, fp: &str) -> RequestOutcome {
        let config = self.state.config.load();
        let registry = self.state.registry.load();

        let router = ModelRouter::new(&config, &registry, &self.state.health, &self.state.router_state);
        let candidates = match router.candidates(request.model.as_str(), explicit_provider, now) {
            Ok(candidates) => candidates,
            Err(err) => return RequestOutcome::Error { error: ProxyError::NoProviderError { requested_model: err.requested_model }, exhausted: true },
        };

        let attempts = candidates.len() as u32;
        let mut last_error = None;

        for (attempt, candidate) in candidates.into_iter().enumerate() {
            let Some(provider) = registry.get(&candidate.provider_name) else { continue };

            if attempt > 0 {
                self.state.events.emit(Event::FailoverAttempt { fingerprint: String::new(), provider: provider.name.clone(), attempt: attempt as u32 }).await;
            }

            let headers = match registry.headers_for(&provider, &incoming_headers) {
                Ok(headers) => headers,
                Err(auth_err) => {
                    last_error = Some(ProxyError::UpstreamAuthError { provider: provider.name.clone(), message: auth_err.to_string() });
                    continue;
                }
            };

            let mut scoped_request = request.clone();
            if !candidate.upstream_model.is_empty() {
                scoped_request.model = candidate.upstream_model.clone().into();
            }

            let effective_stream = wants_stream && provider.streaming_mode != StreamingMode::Background;

            let result = if effective_stream {
                self.attempt_streaming(&provider, &scoped_request, &headers, request_id, &config.settings, now, fp).await
            } else {
                self.attempt_non_streaming(&provider, &scoped_request, &headers, wants_stream, &config.settings, now).await
            };

            match result {
                Ok(outcome) => return outcome,
                Err((error, can_failover)) => {
                    last_error = Some(error);
                    if !can_failover {
                        break;
                    }
                }
            }
        }

        self.state.events.emit(Event::RequestExhausted { fingerprint: String::new(), attempts }).await;
        RequestOutcome::Error { error: last_error.unwrap_or(ProxyError::NoProviderError { requested_model: request.model.as_str().to_string() }), exhausted: true }
    }

    /// Non-streaming upstream call. Also used when the client asked to
    /// stream but the provider's `streaming_mode` forces a buffered call
    /// (synthesizing the SSE sequence client-side afterward).
    async fn attempt_non_streaming(&self, provider: &Provider, request: &CreateMessageRequest, headers: &Headers, wants_stream: bool, settings: &gproxy_common::config::Settings, now: u64) -> Result<RequestOutcome, (ProxyError, bool)> {
        let url = provider.messages_url();
        let body = build_request_body(provider, request);

        let (status, response_body) = match self.state.upstream.call_non_streaming(provider, &url, headers, body, &settings.timeouts.non_streaming).await {
            Ok(pair) => pair,
            Err(failure) => return Err(self.handle_transport_failure(provider, settings, failure, false, now)),
        };

        if status >= 400 {
            let failure = UpstreamFailure::Http { status, body: response_body };
            return Err(self.handle_http_failure(provider, settings, failure, false, now));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&response_body).unwrap_or_default();
        if crate::upstream::body_has_embedded_error(&parsed) {
            let failure = UpstreamFailure::Http { status, body: response_body };
            return Err(self.handle_http_failure(provider, settings, failure, false, now));
        }

        let response = decode_response(provider, &response_body);
        self.record_success(provider, now).await;

        if wants_stream {
            // Client wants SSE, upstream gave JSON: synthesize, register a
            // broadcaster so a concurrent duplicate can still join it, then
            // hand back the primary subscriber.
            let broadcaster = Arc::new(Broadcaster::new(String::new(), provider.name.clone()));
            for event in synthesize_stream(&response) {
                broadcaster.push(event);
            }
            broadcaster.finish(true, now);
            let receiver = broadcaster.subscribe(SubscriberKind::Primary);
            Ok(RequestOutcome::Stream { provider_name: provider.name.clone(), receiver })
        } else {
            Ok(RequestOutcome::Json { provider_name: provider.name.clone(), body: Box::new(response) })
        }
    }

    /// Streaming upstream call with the connection-establishment guard: the
    /// broadcaster is only created — and this candidate only counted as a
    /// success — once the first chunk actually arrives. Everything after
    /// that point is pumped by a detached task so `handle` can return the
    /// primary subscriber immediately.
    async fn attempt_streaming(&self, provider: &Provider, request: &CreateMessageRequest, headers: &Headers, request_id: &str, settings: &gproxy_common::config::Settings, now: u64, fp: &str) -> Result<RequestOutcome, (ProxyError, bool)> {
        let url = provider.messages_url();
        let body = build_request_body(provider, request);

        let (status, mut rx) = match self.state.upstream.call_streaming(provider, &url, headers, body, &settings.timeouts.streaming).await {
            Ok(pair) => pair,
            Err(failure) => return Err(self.handle_transport_failure(provider, settings, failure, false, now)),
        };

        let first_byte_timeout = Duration::from_secs(settings.timeouts.streaming.first_byte_secs);
        let first_chunk = match tokio::time::timeout(first_byte_timeout, rx.recv()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(failure))) => return Err(self.handle_transport_failure(provider, settings, failure, false, now)),
            Ok(None) => return Err(self.handle_transport_failure(provider, settings, UpstreamFailure::Transport { kind: crate::upstream::TransportErrorKind::Other, message: "stream closed before any data".to_string() }, false, now)),
            Err(_) => return Err(self.handle_transport_failure(provider, settings, UpstreamFailure::Transport { kind: crate::upstream::TransportErrorKind::ReadTimeout, message: "timed out waiting for first byte".to_string() }, false, now)),
        };

        if status >= 400 {
            // Drain whatever body the error response carries for classification.
            let mut buf = first_chunk.to_vec();
            while let Ok(Some(Ok(chunk))) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                buf.extend_from_slice(&chunk);
            }
            let failure = UpstreamFailure::Http { status, body: Bytes::from(buf) };
            return Err(self.handle_http_failure(provider, settings, failure, false, now));
        }

        self.record_success(provider, now).await;

        let broadcaster = Arc::new(Broadcaster::new(String::new(), provider.name.clone()));
        self.state.dedup.register_broadcaster(&fp.to_string(), broadcaster.clone());
        let primary = broadcaster.subscribe(SubscriberKind::Primary);

        let mut parser = SseParser::new();
        let mut openai_state = (provider.kind == ProviderKind::Openai).then(|| OpenAiToClaudeStreamState::new(mint_message_id()));

        push_parsed_events(&broadcaster, &mut parser, &first_chunk, provider.kind, &mut openai_state);

        let provider_name = provider.name.clone();
        let settings = settings.clone();
        let health = self.state.health.clone();
        let dedup = self.state.dedup.clone();
        let events = self.state.events.clone();
        let fp = fp.to_string();
        let request_id = request_id.to_string();

        tokio::spawn(async move {
            let mut ok = true;
            loop {
                match rx.recv().await {
                    Some(Ok(chunk)) => {
                        push_parsed_events(&broadcaster, &mut parser, &chunk, provider.kind, &mut openai_state);
                        // Every subscriber's channel write is how we learn it disconnected
                        // (§4.6); once none are left, drop `rx` so the upstream call's own
                        // send fails on its next chunk and it stops reading too.
                        if broadcaster.alive_subscriber_count() == 0 {
                            break;
                        }
                    }
                    Some(Err(_failure)) => {
                        ok = false;
                        broadcaster.push_error_sequence(0, "upstream connection failed mid-response");
                        health.record_outcome(&provider_name, false, gproxy_provider_core::health::now_secs());
                        break;
                    }
                    None => break,
                }
            }
            let now = gproxy_provider_core::health::now_secs();
            broadcaster.finish(ok, now);
            let history = broadcaster.history_snapshot();
            if ok {
                dedup.complete_success(&fp, &provider_name, &mint_message_id(), None, Some(history), now);
            } else {
                dedup.complete_failure(&fp, ProxyError::UpstreamPartialStreamError { provider: provider_name.clone(), reason: "connection failed mid-response".to_string() }, now);
            }
            events.emit(Event::BroadcasterClosed { fingerprint: fp, provider: provider_name, ok }).await;
            let _ = settings;
            let _ = request_id;
        });

        Ok(RequestOutcome::Stream { provider_name: provider.name.clone(), receiver: primary })
    }

    /// Records a successful call and refreshes sticky bookkeeping. Emits
    /// `ProviderRecovered` exactly when this success clears a provider that
    /// was previously unhealthy, mirroring the unhealthy-transition logging
    /// `record_outcome` already does for the opposite direction.
    async fn record_success(&self, provider: &Provider, now: u64) {
        let was_unhealthy = self.state.health.snapshot(&provider.name).unhealthy_since != 0;
        self.state.health.record_outcome(&provider.name, true, now);
        self.state.health.mark_success(&provider.name, now);
        if was_unhealthy && self.state.health.snapshot(&provider.name).unhealthy_since == 0 {
            self.state.events.emit(Event::ProviderRecovered { provider: provider.name.clone() }).await;
        }
    }

    fn handle_transport_failure(&self, provider: &Provider, settings: &gproxy_common::config::Settings, failure: UpstreamFailure, headers_committed: bool, now: u64) -> (ProxyError, bool) {
        let verdict = classify(settings, provider.auth_mode == gproxy_provider_core::AuthMode::Oauth, &failure, headers_committed);
        self.apply_verdict(provider, verdict, failure, now)
    }

    fn handle_http_failure(&self, provider: &Provider, settings: &gproxy_common::config::Settings, failure: UpstreamFailure, headers_committed: bool, now: u64) -> (ProxyError, bool) {
        let verdict = classify(settings, provider.auth_mode == gproxy_provider_core::AuthMode::Oauth, &failure, headers_committed);
        self.apply_verdict(provider, verdict, failure, now)
    }

    fn apply_verdict(&self, provider: &Provider, verdict: crate::upstream::FailoverVerdict, failure: UpstreamFailure, now: u64) -> (ProxyError, bool) {
        if verdict.should_mark_unhealthy {
            let became_unhealthy = self.state.health.record_outcome(&provider.name, false, now);
            if became_unhealthy {
                let snapshot = self.state.health.snapshot(&provider.name);
                let events = self.state.events.clone();
                let provider_name = provider.name.clone();
                tokio::spawn(async move {
                    events.emit(Event::ProviderMarkedUnhealthy { provider: provider_name, consecutive_failures: snapshot.consecutive_failures }).await;
                });
            }
        }

        let error = match failure {
            UpstreamFailure::Transport { message, .. } => ProxyError::UpstreamHealthError { provider: provider.name.clone(), reason: message },
            UpstreamFailure::Http { status, body } if (400..500).contains(&status) && !verdict.should_mark_unhealthy => {
                ProxyError::UpstreamClientError { provider: provider.name.clone(), status, message: String::from_utf8_lossy(&body).to_string() }
            }
            UpstreamFailure::Http { status, .. } if status == 401 => {
                ProxyError::UpstreamAuthError { provider: provider.name.clone(), message: "authentication rejected".to_string() }
            }
            UpstreamFailure::Http { .. } => ProxyError::UpstreamHealthError { provider: provider.name.clone(), reason: "upstream returned an unhealthy status".to_string() },
        };

        (error, verdict.can_failover)
    }
}

fn build_request_body(provider: &Provider, request: &CreateMessageRequest) -> Bytes {
    match provider.kind {
        ProviderKind::Anthropic => Bytes::from(serde_json::to_vec(request).unwrap_or_default()),
        ProviderKind::Openai => {
            let mut openai_request = transform_request(request);
            openai_request.stream = request.stream;
            Bytes::from(serde_json::to_vec(&openai_request).unwrap_or_default())
        }
    }
}

fn decode_response(provider: &Provider, body: &Bytes) -> CreateMessageResponse {
    match provider.kind {
        ProviderKind::Anthropic => serde_json::from_slice(body).unwrap_or_else(|_| {
            CreateMessageResponse::new(mint_message_id(), request_model_fallback(), Vec::new(), None, Default::default())
        }),
        ProviderKind::Openai => match serde_json::from_slice(body) {
            Ok(response) => transform_response(&response, mint_message_id()),
            Err(_) => CreateMessageResponse::new(mint_message_id(), request_model_fallback(), Vec::new(), None, Default::default()),
        },
    }
}

fn request_model_fallback() -> gproxy_protocol::anthropic::Model {
    gproxy_protocol::anthropic::Model(String::new())
}

fn mint_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

/// Parses one raw upstream chunk into Anthropic `StreamEvent`s and pushes
/// them onto the broadcaster, dispatching on provider kind.
fn push_parsed_events(broadcaster: &Broadcaster, parser: &mut SseParser, chunk: &Bytes, kind: ProviderKind, openai_state: &mut Option<OpenAiToClaudeStreamState>) {
    for sse_event in parser.push_bytes(chunk) {
        match kind {
            ProviderKind::Anthropic => {
                if let Ok(event) = serde_json::from_str::<StreamEvent>(&sse_event.data) {
                    broadcaster.push(event);
                }
            }
            ProviderKind::Openai => {
                if sse_event.data.trim() == "[DONE]" {
                    continue;
                }
                if let (Ok(chunk), Some(state)) = (serde_json::from_str::<ChatCompletionChunk>(&sse_event.data), openai_state.as_mut()) {
                    for event in state.push_chunk(&chunk) {
                        broadcaster.push(event);
                    }
                }
            }
        }
    }
}

async fn outcome_to_result(outcome: WaiterOutcome, state: &Arc<AppState>) -> RequestOutcome {
    match outcome {
        WaiterOutcome::Json { provider_name, body } => RequestOutcome::Json { provider_name, body: Box::new((*body).clone()) },
        WaiterOutcome::StreamChunks { provider_name, events } => {
            let broadcaster = Arc::new(Broadcaster::new(String::new(), provider_name.clone()));
            for event in events.iter().cloned() {
                broadcaster.push(event);
            }
            broadcaster.finish(true, gproxy_provider_core::health::now_secs());
            let receiver = broadcaster.subscribe(SubscriberKind::Duplicate);
            let _ = state;
            RequestOutcome::Stream { provider_name, receiver }
        }
        WaiterOutcome::Error(error) => RequestOutcome::Error { error, exhausted: true },
        WaiterOutcome::Cancelled => RequestOutcome::Error { error: ProxyError::DeduplicationTimeoutError, exhausted: true },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_common::{Config, GlobalConfig};
    use gproxy_protocol::anthropic::{Message, MessageContent, MessageRole, Model};

    fn request(model: &str) -> CreateMessageRequest {
        CreateMessageRequest {
            model: Model(model.to_string()),
            messages: vec![Message { role: MessageRole::User, content: MessageContent::Text("hi".to_string()) }],
            system: None,
            tools: None,
            tool_choice: None,
            temperature: None,
            max_tokens: 100,
            stream: None,
            stop_sequences: None,
            top_p: None,
            top_k: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn no_matching_route_returns_no_provider_error_without_calling_upstream() {
        let global = GlobalConfig { host: "0.0.0.0".to_string(), port: 8787, config_path: "config.yaml".to_string(), proxy: None };
        let config = Config::default();
        let state = Arc::new(AppState::new(global, config));
        let controller = RequestController::new(state);

        match controller.handle(request("claude-3-5-sonnet-20241022"), Vec::new(), "r1".to_string(), None, None).await {
            RequestOutcome::Error { error: ProxyError::NoProviderError { .. }, exhausted } => assert!(exhausted),
            _ => panic!("expected NoProviderError"),
        }
    }
}

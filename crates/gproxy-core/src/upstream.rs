//! Upstream client (C7): performs the actual HTTP call against a provider,
//! normalizes transport/HTTP failures, and classifies them into the
//! `(should_mark_unhealthy, can_failover, reason)` triple §4.7 asks for.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use gproxy_common::config::{NonStreamingTimeouts, Settings, StreamingTimeouts};
use gproxy_provider_core::{Headers, Provider};
use regex::Regex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    ReadTimeout,
    Dns,
    Tls,
    Other,
}

#[derive(Debug)]
pub enum UpstreamFailure {
    Transport { kind: TransportErrorKind, message: String },
    Http { status: u16, body: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverVerdict {
    pub should_mark_unhealthy: bool,
    pub can_failover: bool,
}

/// §4.7's error classification table. `headers_committed` forces
/// `can_failover = false` regardless of the rest of the table: once bytes
/// have reached the client, failover is never attempted again.
pub fn classify(settings: &Settings, provider_auth_is_oauth: bool, failure: &UpstreamFailure, headers_committed: bool) -> FailoverVerdict {
    if headers_committed {
        return FailoverVerdict { should_mark_unhealthy: true, can_failover: false };
    }

    match failure {
        UpstreamFailure::Transport { .. } => FailoverVerdict { should_mark_unhealthy: true, can_failover: true },
        UpstreamFailure::Http { status, body } => {
            if settings.unhealthy_http_codes.contains(status) {
                return FailoverVerdict { should_mark_unhealthy: true, can_failover: true };
            }
            if *status == 401 && provider_auth_is_oauth {
                return FailoverVerdict { should_mark_unhealthy: false, can_failover: false };
            }
            if body_matches_unhealthy_pattern(settings, body) {
                return FailoverVerdict { should_mark_unhealthy: true, can_failover: true };
            }
            FailoverVerdict { should_mark_unhealthy: false, can_failover: false }
        }
    }
}

fn body_matches_unhealthy_pattern(settings: &Settings, body: &Bytes) -> bool {
    if settings.unhealthy_response_body_patterns.is_empty() {
        return false;
    }
    let text = String::from_utf8_lossy(body);
    settings
        .unhealthy_response_body_patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .any(|regex| regex.is_match(&text))
}

/// "HTTP 200 with an embedded error object" — detected by a top-level
/// `error` key, the same signal a bare status-code check would miss.
pub fn body_has_embedded_error(body: &serde_json::Value) -> bool {
    body.get("error").is_some()
}

pub struct UpstreamClient {
    clients: Mutex<HashMap<Option<String>, wreq::Client>>,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self { clients: Mutex::new(HashMap::new()) }
    }

    fn client_for(&self, proxy_url: Option<&str>, connect_timeout: Duration) -> Result<wreq::Client, String> {
        let mut clients = self.clients.lock().expect("upstream client cache lock poisoned");
        let key = proxy_url.map(str::to_string);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let mut builder = wreq::Client::builder().connect_timeout(connect_timeout);
        if let Some(proxy) = proxy_url {
            let proxy = wreq::Proxy::all(proxy).map_err(|e| format!("invalid proxy url: {e}"))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| format!("failed to build http client: {e}"))?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// §4.7 non-streaming call: returns the parsed status/body, or a
    /// transport-level failure before any HTTP status was observed.
    pub async fn call_non_streaming(&self, provider: &Provider, url: &str, headers: &Headers, body: Bytes, timeouts: &NonStreamingTimeouts) -> Result<(u16, Bytes), UpstreamFailure> {
        let client = self.client_for(provider.proxy_url.as_deref(), Duration::from_secs(timeouts.connect_secs)).map_err(|message| {
            UpstreamFailure::Transport { kind: TransportErrorKind::Connect, message }
        })?;

        let mut request = client.post(url).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = tokio::time::timeout(Duration::from_secs(timeouts.read_secs), request.send())
            .await
            .map_err(|_| UpstreamFailure::Transport { kind: TransportErrorKind::ReadTimeout, message: "read timeout".to_string() })?
            .map_err(|err| classify_wreq_error(&err))?;

        let status = response.status().as_u16();
        let body = tokio::time::timeout(Duration::from_secs(timeouts.read_secs), response.bytes())
            .await
            .map_err(|_| UpstreamFailure::Transport { kind: TransportErrorKind::ReadTimeout, message: "read timeout".to_string() })?
            .map_err(|err| classify_wreq_error(&err))?;

        Ok((status, body))
    }

    /// §4.7 streaming call: establishes the connection and returns the status
    /// plus a channel of raw body chunks. The caller is responsible for the
    /// "connection-establishment guard" — bounding how long it waits on the
    /// first chunk before giving up on this candidate.
    pub async fn call_streaming(&self, provider: &Provider, url: &str, headers: &Headers, body: Bytes, timeouts: &StreamingTimeouts) -> Result<(u16, mpsc::Receiver<Result<Bytes, UpstreamFailure>>), UpstreamFailure> {
        let client = self.client_for(provider.proxy_url.as_deref(), Duration::from_secs(timeouts.connect_secs)).map_err(|message| {
            UpstreamFailure::Transport { kind: TransportErrorKind::Connect, message }
        })?;

        let mut request = client.post(url).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = tokio::time::timeout(Duration::from_secs(timeouts.connect_secs), request.send())
            .await
            .map_err(|_| UpstreamFailure::Transport { kind: TransportErrorKind::Connect, message: "connect timeout".to_string() })?
            .map_err(|err| classify_wreq_error(&err))?;

        let status = response.status().as_u16();
        let (tx, rx) = mpsc::channel(64);
        let idle_timeout = Duration::from_secs(timeouts.read_secs);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle_timeout, stream.next()).await;
                match next {
                    Ok(Some(Ok(chunk))) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Err(err))) => {
                        let _ = tx.send(Err(classify_wreq_error(&err))).await;
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        let _ = tx
                            .send(Err(UpstreamFailure::Transport { kind: TransportErrorKind::ReadTimeout, message: "idle read timeout".to_string() }))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok((status, rx))
    }
}

/// Sniffs a transport-kind out of `wreq`'s error `Display` text — mirrors the
/// string-matching the teacher's HTTP layer already does, since `wreq`'s
/// error type does not expose a structured transport-kind enum.
fn classify_wreq_error(err: &wreq::Error) -> UpstreamFailure {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    let kind = if err.is_timeout() {
        TransportErrorKind::ReadTimeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if lower.contains("dns") {
        TransportErrorKind::Dns
    } else if lower.contains("tls") || lower.contains("certificate") {
        TransportErrorKind::Tls
    } else {
        TransportErrorKind::Other
    };
    UpstreamFailure::Transport { kind, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_codes(codes: &[u16]) -> Settings {
        let mut settings = Settings::default();
        settings.unhealthy_http_codes = codes.to_vec();
        settings
    }

    #[test]
    fn configured_unhealthy_status_marks_and_allows_failover() {
        let settings = settings_with_codes(&[503]);
        let verdict = classify(&settings, false, &UpstreamFailure::Http { status: 503, body: Bytes::new() }, false);
        assert!(verdict.should_mark_unhealthy);
        assert!(verdict.can_failover);
    }

    #[test]
    fn plain_client_error_does_not_mark_unhealthy() {
        let settings = settings_with_codes(&[503]);
        let verdict = classify(&settings, false, &UpstreamFailure::Http { status: 404, body: Bytes::new() }, false);
        assert!(!verdict.should_mark_unhealthy);
        assert!(!verdict.can_failover);
    }

    #[test]
    fn oauth_401_does_not_mark_unhealthy_or_failover() {
        let settings = settings_with_codes(&[503]);
        let verdict = classify(&settings, true, &UpstreamFailure::Http { status: 401, body: Bytes::new() }, false);
        assert!(!verdict.should_mark_unhealthy);
        assert!(!verdict.can_failover);
    }

    #[test]
    fn headers_committed_forbids_failover_even_for_transport_errors() {
        let settings = Settings::default();
        let verdict = classify(&settings, false, &UpstreamFailure::Transport { kind: TransportErrorKind::ReadTimeout, message: "x".into() }, true);
        assert!(verdict.should_mark_unhealthy);
        assert!(!verdict.can_failover);
    }

    #[test]
    fn body_pattern_match_marks_unhealthy() {
        let mut settings = Settings::default();
        settings.unhealthy_response_body_patterns = vec!["overloaded".to_string()];
        let body = Bytes::from_static(b"{\"error\":\"model overloaded, try again\"}");
        let verdict = classify(&settings, false, &UpstreamFailure::Http { status: 200, body }, false);
        assert!(verdict.should_mark_unhealthy);
    }

    #[test]
    fn embedded_error_key_is_detected() {
        let body: serde_json::Value = serde_json::json!({"error": {"message": "boom"}});
        assert!(body_has_embedded_error(&body));
        let ok: serde_json::Value = serde_json::json!({"id": "msg_1"});
        assert!(!body_has_embedded_error(&ok));
    }
}

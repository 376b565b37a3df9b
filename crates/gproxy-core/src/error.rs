//! §7 error taxonomy, decoupled from transport. The request controller is the
//! only place that converts one of these into an HTTP status and an Anthropic
//! error envelope; nothing downstream of it should construct envelopes itself.

use gproxy_protocol::anthropic::{ErrorBody, ErrorKind, ErrorResponse};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    /// Bad JSON, missing fields, or any validation failure. Never touches health.
    #[error("invalid request: {0}")]
    ClientError(String),

    /// 401/403 from a provider. OAuth providers trigger a refresh flow
    /// externally; other auth modes surface the error as-is.
    #[error("upstream authentication error from {provider}")]
    UpstreamAuthError { provider: String, message: String },

    /// 400/404/422 and friends: not marked unhealthy, surfaced with the
    /// upstream's own status.
    #[error("upstream client error from {provider}: {status}")]
    UpstreamClientError { provider: String, status: u16, message: String },

    /// Anything in the configured unhealthy sets: status codes, body
    /// patterns, connection errors, read timeouts. Counts toward the
    /// threshold and triggers failover if headers are not yet sent.
    #[error("upstream health error from {provider}: {reason}")]
    UpstreamHealthError { provider: String, reason: String },

    /// An error observed after the first downstream byte was written.
    /// Unhealthy, but failover is no longer possible for this request.
    #[error("upstream stream failed mid-response from {provider}: {reason}")]
    UpstreamPartialStreamError { provider: String, reason: String },

    /// The requested model matched no eligible route.
    #[error("no eligible provider for model {requested_model}")]
    NoProviderError { requested_model: String },

    /// A waiter exceeded the configured dedup wait window.
    #[error("timed out waiting for an in-flight duplicate request")]
    DeduplicationTimeoutError,
}

impl ProxyError {
    /// HTTP status this error maps to when it is the *first* error
    /// surfaced for a request (i.e. after all failover attempts, or for
    /// errors that never attempt failover).
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::ClientError(_) => 400,
            ProxyError::UpstreamAuthError { .. } => 401,
            ProxyError::UpstreamClientError { status, .. } => *status,
            ProxyError::UpstreamHealthError { .. } => 503,
            ProxyError::UpstreamPartialStreamError { .. } => 500,
            ProxyError::NoProviderError { .. } => 503,
            ProxyError::DeduplicationTimeoutError => 504,
        }
    }

    /// Converts to the client-facing envelope. Provider identity is dropped
    /// whenever more than one candidate was tried — `exhausted` signals that.
    pub fn to_envelope(&self, exhausted: bool) -> ErrorResponse {
        let body = match self {
            ProxyError::ClientError(message) => ErrorBody {
                kind: ErrorKind::InvalidRequestError,
                message: message.clone(),
                provider: None,
                provider_message: None,
                provider_code: None,
            },
            ProxyError::UpstreamAuthError { provider, message } => ErrorBody {
                kind: ErrorKind::AuthenticationError,
                message: message.clone(),
                provider: Some(provider.clone()),
                provider_message: None,
                provider_code: None,
            },
            ProxyError::UpstreamClientError { provider, status, message } => ErrorBody {
                kind: client_error_kind(*status),
                message: message.clone(),
                provider: if exhausted { None } else { Some(provider.clone()) },
                provider_message: None,
                provider_code: Some(status.to_string()),
            },
            ProxyError::UpstreamHealthError { .. } => ErrorBody {
                kind: ErrorKind::OverloadedError,
                message: "no provider available".to_string(),
                provider: None,
                provider_message: None,
                provider_code: None,
            },
            ProxyError::UpstreamPartialStreamError { reason, .. } => ErrorBody {
                kind: ErrorKind::ApiError,
                message: reason.clone(),
                provider: None,
                provider_message: None,
                provider_code: None,
            },
            ProxyError::NoProviderError { requested_model } => ErrorBody {
                kind: ErrorKind::NotFoundError,
                message: format!("no provider configured for model {requested_model}"),
                provider: None,
                provider_message: None,
                provider_code: None,
            },
            ProxyError::DeduplicationTimeoutError => ErrorBody {
                kind: ErrorKind::TimeoutError,
                message: "timed out waiting for an in-flight duplicate request".to_string(),
                provider: None,
                provider_message: None,
                provider_code: None,
            },
        };
        ErrorResponse::new(body)
    }
}

fn client_error_kind(status: u16) -> ErrorKind {
    match status {
        400 | 422 => ErrorKind::InvalidRequestError,
        401 => ErrorKind::AuthenticationError,
        403 => ErrorKind::PermissionError,
        404 => ErrorKind::NotFoundError,
        413 => ErrorKind::RequestTooLargeError,
        429 => ErrorKind::RateLimitError,
        _ => ErrorKind::ApiError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_client_error_drops_provider_identity() {
        let err = ProxyError::UpstreamClientError { provider: "p1".into(), status: 404, message: "nope".into() };
        let envelope = err.to_envelope(true);
        assert!(envelope.error.provider.is_none());
        assert_eq!(envelope.error.kind, ErrorKind::NotFoundError);
    }

    #[test]
    fn single_candidate_client_error_keeps_provider_identity() {
        let err = ProxyError::UpstreamClientError { provider: "p1".into(), status: 429, message: "slow down".into() };
        let envelope = err.to_envelope(false);
        assert_eq!(envelope.error.provider.as_deref(), Some("p1"));
        assert_eq!(envelope.error.kind, ErrorKind::RateLimitError);
    }

    #[test]
    fn no_provider_error_maps_to_not_found() {
        let err = ProxyError::NoProviderError { requested_model: "claude-x".into() };
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.to_envelope(true).error.kind, ErrorKind::NotFoundError);
    }
}

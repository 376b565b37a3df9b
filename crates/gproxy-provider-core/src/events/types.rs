use serde::Serialize;

/// Structured events emitted at the seams the operator actually cares about:
/// health transitions, dedup decisions, and broadcaster lifecycle. Distinct
/// from the `tracing` call sites sprinkled through the request path — this is
/// the subset worth a stable, serializable shape for a sink to consume.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ProviderMarkedUnhealthy { provider: String, consecutive_failures: u32 },
    ProviderRecovered { provider: String },
    RequestLeading { fingerprint: String, request_id: String },
    RequestJoinedBroadcaster { fingerprint: String, request_id: String },
    RequestServedFromCache { fingerprint: String, request_id: String },
    BroadcasterClosed { fingerprint: String, provider: String, ok: bool },
    FailoverAttempt { fingerprint: String, provider: String, attempt: u32 },
    RequestExhausted { fingerprint: String, attempts: u32 },
}

//! Dedup coordinator (C5): maps a fingerprint to an in-flight leader plus its
//! waiters, and to a short-lived cached terminal result. One mutex guards all
//! three maps; no blocking I/O ever happens while it is held — a waiter
//! blocks on a `oneshot` channel taken out of the lock, matching the single
//! `DedupCoordinator` instance the re-architecting notes ask for in place of
//! module-global mutable dicts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use gproxy_protocol::anthropic::{CreateMessageResponse, StreamEvent};
use tokio::sync::oneshot;

use crate::broadcaster::{Broadcaster, SubscriberKind, reassemble_json, synthesize_stream};
use crate::error::ProxyError;
use crate::fingerprint::Fingerprint;

/// What a single terminal outcome looks like to a receiver who may want
/// either representation — shared between waiters blocked during the
/// leader's flight and arrivals that land after completion but within the
/// cached-result TTL.
#[derive(Clone)]
pub enum WaiterOutcome {
    Json { provider_name: String, body: Arc<CreateMessageResponse> },
    StreamChunks { provider_name: String, events: Arc<Vec<StreamEvent>> },
    Error(ProxyError),
    Cancelled,
}

enum CacheOutcome {
    Success { provider_name: String, body: Arc<CreateMessageResponse>, events: Arc<Vec<StreamEvent>> },
    Error(ProxyError),
}

struct CacheEntry {
    outcome: CacheOutcome,
    expires_at: u64,
}

impl CacheEntry {
    fn deliver(&self, wants_stream: bool) -> WaiterOutcome {
        match &self.outcome {
            CacheOutcome::Success { provider_name, body, events } => {
                if wants_stream {
                    WaiterOutcome::StreamChunks { provider_name: provider_name.clone(), events: events.clone() }
                } else {
                    WaiterOutcome::Json { provider_name: provider_name.clone(), body: body.clone() }
                }
            }
            CacheOutcome::Error(err) => WaiterOutcome::Error(err.clone()),
        }
    }
}

struct Waiter {
    arrival_ts: u64,
    wants_stream: bool,
    original_request_id: Option<String>,
    tx: oneshot::Sender<WaiterOutcome>,
}

struct PendingRequest {
    leader_request_id: String,
    waiters: Vec<Waiter>,
}

pub enum Decision {
    ServeCached(WaiterOutcome),
    JoinBroadcaster(Arc<Broadcaster>),
    Wait(oneshot::Receiver<WaiterOutcome>),
    Lead,
}

struct State {
    pending: HashMap<Fingerprint, PendingRequest>,
    broadcasters: HashMap<Fingerprint, Arc<Broadcaster>>,
    cached: HashMap<Fingerprint, CacheEntry>,
}

pub struct DedupCoordinator {
    state: Mutex<State>,
    cached_result_ttl_secs: u64,
    broadcaster_grace_secs: u64,
}

impl DedupCoordinator {
    pub fn new(cached_result_ttl_secs: u64, broadcaster_grace_secs: u64) -> Self {
        Self {
            state: Mutex::new(State { pending: HashMap::new(), broadcasters: HashMap::new(), cached: HashMap::new() }),
            cached_result_ttl_secs,
            broadcaster_grace_secs,
        }
    }

    /// §4.5 `on_arrival`. A streaming arrival always prefers an existing
    /// broadcaster over the cache — including one that already finished but
    /// is still within its teardown grace period, so a duplicate landing
    /// milliseconds after the producer closed still gets the full replay
    /// (history-then-close) rather than becoming a fresh leader.
    pub fn on_arrival(&self, fp: &Fingerprint, request_id: &str, wants_stream: bool, original_request_id: Option<String>, now: u64) -> Decision {
        let mut state = self.state.lock().expect("dedup lock poisoned");

        if wants_stream
            && let Some(broadcaster) = state.broadcasters.get(fp)
        {
            return Decision::JoinBroadcaster(broadcaster.clone());
        }

        if let Some(entry) = state.cached.get(fp)
            && entry.expires_at > now
        {
            return Decision::ServeCached(entry.deliver(wants_stream));
        }

        if let Some(pending) = state.pending.get_mut(fp) {
            let (tx, rx) = oneshot::channel();
            pending.waiters.push(Waiter { arrival_ts: now, wants_stream, original_request_id, tx });
            return Decision::Wait(rx);
        }

        state.pending.insert(fp.clone(), PendingRequest { leader_request_id: request_id.to_string(), waiters: Vec::new() });
        Decision::Lead
    }

    /// Registers the broadcaster for a streaming leader. Must be called
    /// before the producer starts appending chunks, so arrivals during the
    /// stream see `JoinBroadcaster` instead of queuing as waiters.
    pub fn register_broadcaster(&self, fp: &Fingerprint, broadcaster: Arc<Broadcaster>) {
        let mut state = self.state.lock().expect("dedup lock poisoned");
        state.broadcasters.insert(fp.clone(), broadcaster);
    }

    /// Subscribes the leader itself as the broadcaster's primary subscriber.
    pub fn subscribe_primary(&self, fp: &Fingerprint) -> Option<tokio::sync::mpsc::Receiver<Bytes>> {
        let state = self.state.lock().expect("dedup lock poisoned");
        state.broadcasters.get(fp).map(|b| b.subscribe(SubscriberKind::Primary))
    }

    /// §4.5 leader completion: stores a cached result (serving both json and
    /// stream latecomers off the one entry), resolves every waiter
    /// (converting between stream/non-stream representations as needed), and
    /// removes the pending entry. The "newest waiter per upstream marker
    /// wins" rule only applies among waiters that share a `Some`
    /// `original_request_id`; waiters with no marker (the common case absent
    /// an upstream-supplied id) all receive the result, per the explicit
    /// resolution of that open question.
    pub fn complete_success(&self, fp: &Fingerprint, provider_name: &str, fallback_message_id: &str, json: Option<CreateMessageResponse>, stream_history: Option<Vec<StreamEvent>>, now: u64) {
        let (json, stream_history) = match (json, stream_history) {
            (Some(json), None) => {
                let events = Arc::new(synthesize_stream(&json));
                (Arc::new(json), events)
            }
            (None, Some(history)) => {
                let json = reassemble_json(&history, fallback_message_id);
                (Arc::new(json), Arc::new(history))
            }
            (Some(json), Some(history)) => (Arc::new(json), Arc::new(history)),
            (None, None) => return,
        };

        let mut state = self.state.lock().expect("dedup lock poisoned");
        state.cached.insert(
            fp.clone(),
            CacheEntry {
                outcome: CacheOutcome::Success { provider_name: provider_name.to_string(), body: json.clone(), events: stream_history.clone() },
                expires_at: now + self.cached_result_ttl_secs,
            },
        );

        let Some(pending) = state.pending.remove(fp) else { return };
        for waiter in select_winning_waiters(pending.waiters) {
            let outcome = if waiter.wants_stream {
                WaiterOutcome::StreamChunks { provider_name: provider_name.to_string(), events: stream_history.clone() }
            } else {
                WaiterOutcome::Json { provider_name: provider_name.to_string(), body: json.clone() }
            };
            let _ = waiter.tx.send(outcome);
        }
    }

    /// §4.5 leader failure: every waiter receives the same error, wrapped for
    /// its own stream/non-stream preference by the caller at delivery time
    /// (the envelope shape differs, the `ProxyError` does not).
    pub fn complete_failure(&self, fp: &Fingerprint, error: ProxyError, now: u64) {
        let mut state = self.state.lock().expect("dedup lock poisoned");
        state.cached.insert(fp.clone(), CacheEntry { outcome: CacheOutcome::Error(error.clone()), expires_at: now + self.cached_result_ttl_secs });

        let Some(pending) = state.pending.remove(fp) else { return };
        for waiter in select_winning_waiters(pending.waiters) {
            let _ = waiter.tx.send(WaiterOutcome::Error(error.clone()));
        }
    }

    pub fn leader_request_id(&self, fp: &Fingerprint) -> Option<String> {
        self.state.lock().expect("dedup lock poisoned").pending.get(fp).map(|p| p.leader_request_id.clone())
    }

    /// Janitor sweep: drops cached results past their TTL and broadcasters
    /// that finished more than `broadcaster_grace_secs` ago (the grace window
    /// is what lets a duplicate arriving milliseconds after teardown still
    /// see the error/ok replay via `JoinBroadcaster` or `ServeCached`).
    pub fn sweep(&self, now: u64) {
        let mut state = self.state.lock().expect("dedup lock poisoned");
        state.cached.retain(|_, entry| entry.expires_at > now);
        state.broadcasters.retain(|_, broadcaster| {
            broadcaster.state() == crate::broadcaster::BroadcasterState::Streaming
                || now.saturating_sub(broadcaster.closed_at()) <= self.broadcaster_grace_secs
        });
    }

    /// Operational knob for `POST /cleanup?force=bool`.
    pub fn force_expire_all(&self) {
        let mut state = self.state.lock().expect("dedup lock poisoned");
        state.cached.clear();
        state.broadcasters.clear();
        state.pending.clear();
    }
}

/// "Only the newest waiter per original client wins" (§4.5): waiters that
/// share a `Some(original_request_id)` are collapsed to the most recent
/// arrival; everything else (distinct or `None` markers) passes through
/// untouched and is cancelled only by virtue of losing that collapse.
fn select_winning_waiters(waiters: Vec<Waiter>) -> Vec<Waiter> {
    let mut grouped: HashMap<String, Waiter> = HashMap::new();
    let mut ungrouped = Vec::new();
    for waiter in waiters {
        match &waiter.original_request_id {
            Some(marker) => {
                let marker = marker.clone();
                match grouped.remove(&marker) {
                    Some(existing) if existing.arrival_ts > waiter.arrival_ts => {
                        let _ = waiter.tx.send(WaiterOutcome::Cancelled);
                        grouped.insert(marker, existing);
                    }
                    Some(existing) => {
                        let _ = existing.tx.send(WaiterOutcome::Cancelled);
                        grouped.insert(marker, waiter);
                    }
                    None => {
                        grouped.insert(marker, waiter);
                    }
                }
            }
            None => ungrouped.push(waiter),
        }
    }
    ungrouped.extend(grouped.into_values());
    ungrouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::anthropic::{ContentBlock, Model, StopReason, Usage};

    fn response() -> CreateMessageResponse {
        CreateMessageResponse::new(
            "msg_1".to_string(),
            Model("claude-3-5-sonnet".to_string()),
            vec![ContentBlock::Text { text: "hi".to_string(), citations: None }],
            Some(StopReason::EndTurn),
            Usage { input_tokens: 1, output_tokens: 1 },
        )
    }

    #[test]
    fn first_arrival_leads_second_waits() {
        let coordinator = DedupCoordinator::new(30, 5);
        let fp = "fp1".to_string();
        assert!(matches!(coordinator.on_arrival(&fp, "r1", false, None, 100), Decision::Lead));
        assert!(matches!(coordinator.on_arrival(&fp, "r2", false, None, 100), Decision::Wait(_)));
    }

    #[tokio::test]
    async fn waiter_receives_leader_json_result() {
        let coordinator = DedupCoordinator::new(30, 5);
        let fp = "fp1".to_string();
        coordinator.on_arrival(&fp, "r1", false, None, 100);
        let Decision::Wait(rx) = coordinator.on_arrival(&fp, "r2", false, None, 100) else {
            panic!("expected Wait");
        };
        coordinator.complete_success(&fp, "p1", "fallback", Some(response()), None, 100);
        match rx.await.unwrap() {
            WaiterOutcome::Json { body, .. } => assert_eq!(body.id, "msg_1"),
            _ => panic!("expected Json outcome"),
        }
    }

    #[tokio::test]
    async fn stream_waiter_gets_synthesized_events_from_json_leader() {
        let coordinator = DedupCoordinator::new(30, 5);
        let fp = "fp1".to_string();
        coordinator.on_arrival(&fp, "r1", false, None, 100);
        let Decision::Wait(rx) = coordinator.on_arrival(&fp, "r2", true, None, 100) else {
            panic!("expected Wait");
        };
        coordinator.complete_success(&fp, "p1", "fallback", Some(response()), None, 100);
        match rx.await.unwrap() {
            WaiterOutcome::StreamChunks { events, .. } => assert!(!events.is_empty()),
            _ => panic!("expected StreamChunks outcome"),
        }
    }

    #[test]
    fn cached_result_served_within_ttl_window() {
        let coordinator = DedupCoordinator::new(30, 5);
        let fp = "fp1".to_string();
        coordinator.on_arrival(&fp, "r1", false, None, 100);
        coordinator.complete_success(&fp, "p1", "fallback", Some(response()), None, 100);
        assert!(matches!(coordinator.on_arrival(&fp, "r2", false, None, 110), Decision::ServeCached(_)));
    }

    #[test]
    fn cached_result_also_serves_a_late_stream_arrival() {
        let coordinator = DedupCoordinator::new(30, 5);
        let fp = "fp1".to_string();
        coordinator.on_arrival(&fp, "r1", false, None, 100);
        coordinator.complete_success(&fp, "p1", "fallback", Some(response()), None, 100);
        match coordinator.on_arrival(&fp, "r2", true, None, 110) {
            Decision::ServeCached(WaiterOutcome::StreamChunks { events, .. }) => assert!(!events.is_empty()),
            _ => panic!("expected ServeCached(StreamChunks)"),
        }
    }

    #[test]
    fn cached_result_expires_after_ttl() {
        let coordinator = DedupCoordinator::new(30, 5);
        let fp = "fp1".to_string();
        coordinator.on_arrival(&fp, "r1", false, None, 100);
        coordinator.complete_success(&fp, "p1", "fallback", Some(response()), None, 100);
        coordinator.sweep(200);
        assert!(matches!(coordinator.on_arrival(&fp, "r2", false, None, 200), Decision::Lead));
    }

    #[test]
    fn late_duplicate_joins_broadcaster_after_it_closed_within_grace() {
        let coordinator = DedupCoordinator::new(30, 5);
        let fp = "fp1".to_string();
        let broadcaster = Arc::new(Broadcaster::new(fp.clone(), "p1".to_string()));
        broadcaster.push(StreamEvent::Ping);
        broadcaster.finish(true, 100);
        coordinator.register_broadcaster(&fp, broadcaster);

        match coordinator.on_arrival(&fp, "r2", true, None, 102) {
            Decision::JoinBroadcaster(b) => assert_eq!(b.state(), crate::broadcaster::BroadcasterState::ClosedOk),
            _ => panic!("expected JoinBroadcaster even after close, within grace"),
        }
    }

    #[tokio::test]
    async fn newest_waiter_with_shared_marker_wins() {
        let coordinator = DedupCoordinator::new(30, 5);
        let fp = "fp1".to_string();
        coordinator.on_arrival(&fp, "r1", false, None, 100);
        let Decision::Wait(rx_old) = coordinator.on_arrival(&fp, "r2", false, Some("client-a".to_string()), 101) else {
            panic!("expected Wait");
        };
        let Decision::Wait(rx_new) = coordinator.on_arrival(&fp, "r3", false, Some("client-a".to_string()), 105) else {
            panic!("expected Wait");
        };
        coordinator.complete_success(&fp, "p1", "fallback", Some(response()), None, 110);
        assert!(matches!(rx_old.await.unwrap(), WaiterOutcome::Cancelled));
        assert!(matches!(rx_new.await.unwrap(), WaiterOutcome::Json { .. }));
    }
}

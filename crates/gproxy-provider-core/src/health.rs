//! Health store (C1, §4.1). A single mutex over a map keyed by provider
//! name; writes are O(providers), no I/O is ever held under the lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Wall-clock seconds since the epoch. A thin wrapper so call sites read as
/// "a point in time" rather than a bare integer.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default)]
struct ProviderHealthEntry {
    consecutive_failures: u32,
    last_failure_at: u64,
    last_success_at: u64,
    unhealthy_since: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderHealthSnapshot {
    pub consecutive_failures: u32,
    pub last_failure_at: u64,
    pub last_success_at: u64,
    pub unhealthy_since: u64,
}

pub struct HealthStore {
    threshold: u32,
    reset_on_success: bool,
    reset_timeout_secs: u64,
    cooldown_secs: u64,
    entries: Mutex<HashMap<String, ProviderHealthEntry>>,
    sticky_last_provider: Mutex<Option<String>>,
    sticky_last_request_at: Mutex<u64>,
}

impl HealthStore {
    pub fn new(threshold: u32, reset_on_success: bool, reset_timeout_secs: u64, cooldown_secs: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_on_success,
            reset_timeout_secs,
            cooldown_secs,
            entries: Mutex::new(HashMap::new()),
            sticky_last_provider: Mutex::new(None),
            sticky_last_request_at: Mutex::new(0),
        }
    }

    /// Invariant: `unhealthy_since == 0 ⇔ provider eligible`.
    pub fn is_eligible(&self, provider: &str, now: u64) -> bool {
        let entries = self.entries.lock().expect("health lock poisoned");
        match entries.get(provider) {
            None => true,
            Some(entry) => entry.unhealthy_since == 0 || now.saturating_sub(entry.unhealthy_since) > self.cooldown_secs,
        }
    }

    /// Records an outcome. Returns `true` the moment this error crosses the
    /// threshold (i.e. the transition into unhealthy), so the caller can log
    /// it exactly once.
    pub fn record_outcome(&self, provider: &str, ok: bool, now: u64) -> bool {
        let mut entries = self.entries.lock().expect("health lock poisoned");
        let entry = entries.entry(provider.to_string()).or_default();
        if ok {
            entry.last_success_at = now;
            if self.reset_on_success {
                entry.consecutive_failures = 0;
                entry.unhealthy_since = 0;
            }
            return false;
        }
        entry.last_failure_at = now;
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.threshold && entry.unhealthy_since == 0 {
            entry.unhealthy_since = now;
            return true;
        }
        false
    }

    /// Health sweep: clear counters for any provider quiet longer than
    /// `reset_timeout_secs` (0 disables). Called at the top of each request.
    pub fn sweep(&self, now: u64) {
        if self.reset_timeout_secs == 0 {
            return;
        }
        let mut entries = self.entries.lock().expect("health lock poisoned");
        for entry in entries.values_mut() {
            if entry.consecutive_failures > 0 && now.saturating_sub(entry.last_failure_at) > self.reset_timeout_secs {
                entry.consecutive_failures = 0;
                entry.unhealthy_since = 0;
            }
        }
    }

    pub fn snapshot(&self, provider: &str) -> ProviderHealthSnapshot {
        let entries = self.entries.lock().expect("health lock poisoned");
        match entries.get(provider) {
            Some(entry) => ProviderHealthSnapshot {
                consecutive_failures: entry.consecutive_failures,
                last_failure_at: entry.last_failure_at,
                last_success_at: entry.last_success_at,
                unhealthy_since: entry.unhealthy_since,
            },
            None => ProviderHealthSnapshot { consecutive_failures: 0, last_failure_at: 0, last_success_at: 0, unhealthy_since: 0 },
        }
    }

    pub fn snapshot_all(&self) -> Vec<(String, ProviderHealthSnapshot)> {
        let entries = self.entries.lock().expect("health lock poisoned");
        entries
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    ProviderHealthSnapshot {
                        consecutive_failures: entry.consecutive_failures,
                        last_failure_at: entry.last_failure_at,
                        last_success_at: entry.last_success_at,
                        unhealthy_since: entry.unhealthy_since,
                    },
                )
            })
            .collect()
    }

    /// Sticky bookkeeping: the router consults this on every arrival; a
    /// non-failover-worthy error still refreshes the window so sticky stays
    /// with a provider merely returning client errors (§4.8).
    pub fn mark_used(&self, provider: &str, now: u64) {
        *self.sticky_last_provider.lock().expect("sticky lock poisoned") = Some(provider.to_string());
        *self.sticky_last_request_at.lock().expect("sticky lock poisoned") = now;
    }

    pub fn mark_success(&self, provider: &str, now: u64) {
        self.mark_used(provider, now);
    }

    pub fn sticky_hint(&self, now: u64, sticky_duration_secs: u64) -> Option<String> {
        if sticky_duration_secs == 0 {
            return None;
        }
        let last_at = *self.sticky_last_request_at.lock().expect("sticky lock poisoned");
        if now.saturating_sub(last_at) > sticky_duration_secs {
            return None;
        }
        self.sticky_last_provider.lock().expect("sticky lock poisoned").clone()
    }

    /// Force-expire all health state, for the `/cleanup` operational knob.
    pub fn reset_all(&self) {
        self.entries.lock().expect("health lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_stays_eligible() {
        let store = HealthStore::new(2, true, 0, 60);
        assert!(!store.record_outcome("p1", false, 100));
        assert!(store.is_eligible("p1", 100));
    }

    #[test]
    fn threshold_crossing_marks_unhealthy_exactly_once() {
        let store = HealthStore::new(2, true, 0, 60);
        assert!(!store.record_outcome("p1", false, 100));
        assert!(store.record_outcome("p1", false, 101));
        assert!(!store.is_eligible("p1", 101));
        // A third failure does not re-report the transition.
        assert!(!store.record_outcome("p1", false, 102));
    }

    #[test]
    fn success_clears_counters() {
        let store = HealthStore::new(2, true, 0, 60);
        store.record_outcome("p1", false, 100);
        store.record_outcome("p1", false, 101);
        assert!(!store.is_eligible("p1", 101));
        store.record_outcome("p1", true, 102);
        assert!(store.is_eligible("p1", 102));
        let snap = store.snapshot("p1");
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.unhealthy_since, 0);
    }

    #[test]
    fn cooldown_recovers_eligibility_without_success() {
        let store = HealthStore::new(2, true, 0, 10);
        store.record_outcome("p1", false, 100);
        store.record_outcome("p1", false, 101);
        assert!(!store.is_eligible("p1", 105));
        assert!(store.is_eligible("p1", 200));
    }

    #[test]
    fn sweep_clears_quiet_counters_without_crossing_threshold() {
        let store = HealthStore::new(5, true, 30, 60);
        store.record_outcome("p1", false, 100);
        store.sweep(100);
        assert_eq!(store.snapshot("p1").consecutive_failures, 1);
        store.sweep(200);
        assert_eq!(store.snapshot("p1").consecutive_failures, 0);
    }

    #[test]
    fn sticky_hint_expires_after_window() {
        let store = HealthStore::new(2, true, 0, 60);
        store.mark_success("p1", 100);
        assert_eq!(store.sticky_hint(150, 100), Some("p1".to_string()));
        assert_eq!(store.sticky_hint(300, 100), None);
    }
}

//! Model router (C3): turns a requested model name into an ordered list of
//! candidate providers to try in sequence.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use gproxy_common::config::{Config, ModelRouteConfig, SelectionStrategy};

use crate::health::HealthStore;
use crate::model::PASSTHROUGH_MODEL;
use crate::registry::ProviderRegistry;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_name: String,
    pub upstream_model: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("no eligible provider for model {requested_model}")]
pub struct NoProviderError {
    pub requested_model: String,
}

/// Per-pattern round-robin cursors. Kept separate from `HealthStore` because
/// it has nothing to do with health, only with strategy bookkeeping.
#[derive(Default)]
pub struct RouterState {
    cursors: Mutex<HashMap<String, usize>>,
    rng_state: AtomicU64,
}

impl RouterState {
    pub fn new() -> Self {
        Self { cursors: Mutex::new(HashMap::new()), rng_state: AtomicU64::new(0x9E3779B97F4A7C15) }
    }

    fn next_round_robin(&self, pattern: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let mut cursors = self.cursors.lock().expect("router cursor lock poisoned");
        let cursor = cursors.entry(pattern.to_string()).or_insert(0);
        let chosen = *cursor % len;
        *cursor = (*cursor + 1) % len;
        chosen
    }

    /// xorshift64*, good enough for "pick a top-3 candidate", not a crypto need.
    fn next_random(&self, bound: usize) -> usize {
        if bound <= 1 {
            return 0;
        }
        let mut x = self.rng_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state.store(x, Ordering::Relaxed);
        (x as usize) % bound
    }
}

pub struct ModelRouter<'a> {
    config: &'a Config,
    registry: &'a ProviderRegistry,
    health: &'a HealthStore,
    state: &'a RouterState,
}

impl<'a> ModelRouter<'a> {
    pub fn new(config: &'a Config, registry: &'a ProviderRegistry, health: &'a HealthStore, state: &'a RouterState) -> Self {
        Self { config, registry, health, state }
    }

    /// Resolves a client-requested model (optionally pinned to an explicit
    /// provider via `explicit_provider`) into an ordered candidate list.
    ///
    /// Order of decisions: an explicit provider short-circuits route
    /// matching entirely. Otherwise routes are matched exact-pattern first,
    /// then wildcard, within the first matching key in `model_routes`.
    /// Disabled routes and disabled/ineligible providers are dropped before
    /// the selection strategy reorders what's left. A sticky hint, when
    /// still within its window, is moved to the front of the list.
    pub fn candidates(&self, requested_model: &str, explicit_provider: Option<&str>, now: u64) -> Result<Vec<Candidate>, NoProviderError> {
        let mut routes: Vec<&ModelRouteConfig> = if let Some(provider_name) = explicit_provider {
            self.config
                .model_routes
                .values()
                .flatten()
                .filter(|route| route.provider == provider_name)
                .collect()
        } else {
            self.matching_routes(requested_model)
        };

        routes.retain(|route| {
            route.enabled
                && self
                    .registry
                    .get(&route.provider)
                    .map(|provider| provider.enabled)
                    .unwrap_or(false)
                && self.health.is_eligible(&route.provider, now)
        });

        if explicit_provider.is_none() {
            routes.sort_by_key(|route| route.priority);
        }

        if routes.is_empty() {
            return Err(NoProviderError { requested_model: requested_model.to_string() });
        }

        let ordered = self.apply_strategy(&routes);

        Ok(self.reorder_with_sticky(ordered, requested_model, now))
    }

    fn matching_routes(&self, requested_model: &str) -> Vec<&ModelRouteConfig> {
        if let Some(routes) = self.config.model_routes.get(requested_model) {
            return routes.iter().collect();
        }
        for (pattern, routes) in &self.config.model_routes {
            if pattern_matches(pattern, requested_model) {
                return routes.iter().collect();
            }
        }
        Vec::new()
    }

    fn apply_strategy(&self, routes: &[&ModelRouteConfig]) -> Vec<Candidate> {
        let to_candidate = |route: &&ModelRouteConfig| Candidate {
            provider_name: route.provider.clone(),
            upstream_model: if route.model == PASSTHROUGH_MODEL { String::new() } else { route.model.clone() },
        };

        match self.config.settings.selection_strategy {
            SelectionStrategy::Priority => routes.iter().map(to_candidate).collect(),
            SelectionStrategy::RoundRobin => {
                let key = routes.iter().map(|r| r.provider.as_str()).collect::<Vec<_>>().join(",");
                let start = self.state.next_round_robin(&key, routes.len());
                (0..routes.len()).map(|i| to_candidate(&routes[(start + i) % routes.len()])).collect()
            }
            SelectionStrategy::Random => {
                let top = routes.len().min(3);
                let mut pool: Vec<&ModelRouteConfig> = routes[..top].to_vec();
                let mut rest: Vec<&ModelRouteConfig> = routes[top..].to_vec();
                let mut ordered = Vec::with_capacity(routes.len());
                while !pool.is_empty() {
                    let idx = self.state.next_random(pool.len());
                    ordered.push(pool.remove(idx));
                }
                ordered.append(&mut rest);
                ordered.iter().map(to_candidate).collect()
            }
        }
    }

    fn reorder_with_sticky(&self, mut ordered: Vec<Candidate>, requested_model: &str, now: u64) -> Vec<Candidate> {
        let _ = requested_model;
        let Some(sticky) = self.health.sticky_hint(now, self.config.settings.sticky_provider_duration) else {
            return ordered;
        };
        if let Some(pos) = ordered.iter().position(|c| c.provider_name == sticky) {
            let candidate = ordered.remove(pos);
            ordered.insert(0, candidate);
        }
        ordered
    }
}

/// `*` matches any run of characters; anything else must match literally.
/// Sufficient for the glob-style model patterns used in route keys (e.g.
/// `"claude-3-5-sonnet*"`); no `?`/character-class support is needed.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut segments = pattern.split('*').peekable();
    let mut rest = value;

    if let Some(first) = segments.peek()
        && !first.is_empty()
    {
        if !rest.starts_with(first.as_str()) {
            return false;
        }
        rest = &rest[first.len()..];
    }
    segments.next();

    let last = pattern.ends_with('*');
    let segment_list: Vec<&str> = segments.collect();
    for (i, segment) in segment_list.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
        if i == segment_list.len() - 1 && !last && !rest.is_empty() {
            return false;
        }
    }
    true
}

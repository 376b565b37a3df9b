//! Process-wide runtime state. `global` (bind address, config path, outbound
//! proxy) and `config`/`registry` (providers, routes, settings) are each
//! behind an `ArcSwap` so `POST /providers/reload` can replace them
//! atomically without pausing in-flight requests. Health, dedup, and router
//! state survive a reload — only the provider/route definitions themselves
//! are replaced.

use std::sync::Arc;

use arc_swap::ArcSwap;
use gproxy_common::{Config, GlobalConfig};
use gproxy_provider_core::{EventHub, HealthStore, Provider, ProviderRegistry, RouterState};

use crate::dedup::DedupCoordinator;
use crate::upstream::UpstreamClient;

/// How long a just-finished broadcaster is kept around so a duplicate
/// arriving milliseconds after teardown still sees the replay instead of
/// becoming a fresh leader. Not config-exposed; the cached-result TTL is the
/// knob operators actually tune.
const BROADCASTER_GRACE_SECS: u64 = 5;

pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub config: ArcSwap<Config>,
    pub registry: ArcSwap<ProviderRegistry>,
    pub health: Arc<HealthStore>,
    pub router_state: Arc<RouterState>,
    pub dedup: Arc<DedupCoordinator>,
    pub upstream: Arc<UpstreamClient>,
    pub events: EventHub,
}

impl AppState {
    pub fn new(global: GlobalConfig, config: Config) -> Self {
        let settings = &config.settings;
        let health = Arc::new(HealthStore::new(
            settings.unhealthy_threshold,
            settings.unhealthy_reset_on_success,
            settings.unhealthy_reset_timeout,
            settings.failure_cooldown,
        ));
        let registry = build_registry(&config);
        Self {
            global: ArcSwap::from_pointee(global),
            config: ArcSwap::from_pointee(config),
            registry: ArcSwap::from_pointee(registry),
            health,
            router_state: Arc::new(RouterState::new()),
            dedup: Arc::new(DedupCoordinator::new(
                settings.timeouts.caching.cached_result_ttl_secs,
                BROADCASTER_GRACE_SECS,
            )),
            upstream: Arc::new(UpstreamClient::new()),
            events: EventHub::new(1024),
        }
    }

    /// `POST /providers/reload`: re-read the config file and replace
    /// `config`/`registry` atomically. Health, dedup, and router state are
    /// untouched — a reload is not a restart.
    pub fn reload_from_path(&self) -> Result<(), gproxy_common::ConfigLoadError> {
        let path = self.global.load().config_path.clone();
        let config = gproxy_common::config::load(std::path::Path::new(&path))?;
        let registry = build_registry(&config);
        self.registry.store(Arc::new(registry));
        self.config.store(Arc::new(config));
        Ok(())
    }

    pub fn dedup_wait_secs(&self) -> u64 {
        self.config.load().settings.timeouts.caching.dedup_wait_secs
    }

    pub fn include_max_tokens_in_fingerprint(&self) -> bool {
        self.config.load().settings.deduplication.include_max_tokens_in_signature
    }
}

fn build_registry(config: &Config) -> ProviderRegistry {
    let providers: Vec<Provider> = config.providers.iter().map(Provider::from_config).collect();
    ProviderRegistry::new(providers)
}

//! §3 data model: `Provider` and `ModelRoute`. Loaded once at startup (and
//! again on `POST /providers/reload`), then treated as immutable except for
//! `auth_material`, which an OAuth refresh swaps in place.

use std::sync::RwLock;

use gproxy_common::config::{AuthMode as ConfigAuthMode, ProviderConfig, ProviderKind as ConfigProviderKind, StreamingMode as ConfigStreamingMode};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    Openai,
}

impl From<ConfigProviderKind> for ProviderKind {
    fn from(value: ConfigProviderKind) -> Self {
        match value {
            ConfigProviderKind::Anthropic => ProviderKind::Anthropic,
            ConfigProviderKind::Openai => ProviderKind::Openai,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    Bearer,
    Oauth,
    Passthrough,
}

impl From<ConfigAuthMode> for AuthMode {
    fn from(value: ConfigAuthMode) -> Self {
        match value {
            ConfigAuthMode::ApiKey => AuthMode::ApiKey,
            ConfigAuthMode::Bearer => AuthMode::Bearer,
            ConfigAuthMode::Oauth => AuthMode::Oauth,
            ConfigAuthMode::Passthrough => AuthMode::Passthrough,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    Auto,
    Direct,
    Background,
}

impl From<ConfigStreamingMode> for StreamingMode {
    fn from(value: ConfigStreamingMode) -> Self {
        match value {
            ConfigStreamingMode::Auto => StreamingMode::Auto,
            ConfigStreamingMode::Direct => StreamingMode::Direct,
            ConfigStreamingMode::Background => StreamingMode::Background,
        }
    }
}

/// Opaque auth material: an API key, a bearer token, or nothing (passthrough
/// forwards the client's own credential; oauth fetches one from a collaborator).
/// Held behind a lock since an OAuth refresh replaces it in place (§3).
#[derive(Debug, Default)]
pub struct AuthMaterial(RwLock<Option<String>>);

impl AuthMaterial {
    pub fn new(value: Option<String>) -> Self {
        Self(RwLock::new(value))
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().expect("auth material lock poisoned").clone()
    }

    pub fn replace(&self, value: Option<String>) {
        *self.0.write().expect("auth material lock poisoned") = value;
    }
}

/// Identity record (§3). Immutable for the process lifetime except for
/// `auth_material`; reload replaces the whole registry rather than mutating
/// providers in place.
#[derive(Debug)]
pub struct Provider {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub auth_mode: AuthMode,
    pub auth_material: AuthMaterial,
    pub proxy_url: Option<String>,
    pub streaming_mode: StreamingMode,
    pub enabled: bool,
}

impl Provider {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind.into(),
            base_url: config.base_url.clone(),
            auth_mode: config.auth_type.into(),
            auth_material: AuthMaterial::new(config.auth_value.clone()),
            proxy_url: config.proxy.clone(),
            streaming_mode: config.streaming_mode.into(),
            enabled: config.enabled,
        }
    }

    /// The fixed upstream path for this provider's kind, joined with
    /// `base_url` trimming exactly one slash at the seam (SPEC_FULL §4.2).
    pub fn messages_url(&self) -> String {
        let suffix = match self.kind {
            ProviderKind::Anthropic => "/v1/messages",
            ProviderKind::Openai => "/v1/chat/completions",
        };
        join_url(&self.base_url, suffix)
    }
}

fn join_url(base: &str, suffix: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), suffix.trim_start_matches('/'))
}

/// A resolved routing entry (§3). `pattern` may contain `*` wildcards;
/// `upstream_model == "passthrough"` forwards the client's requested model.
#[derive(Debug, Clone)]
pub struct ModelRoute {
    pub pattern: String,
    pub upstream_model: String,
    pub provider_name: String,
    pub priority: u32,
    pub enabled: bool,
}

pub const PASSTHROUGH_MODEL: &str = "passthrough";

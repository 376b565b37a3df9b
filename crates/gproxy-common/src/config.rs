//! The YAML configuration file described in §6: provider pool, model routing
//! table, and the tunables the health store / dedup coordinator / upstream
//! client read at construction time. Parsing mechanics are `serde_yaml`'s
//! concern; this module only defines the shape and its defaults.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Pattern precedence follows document order (§4.3 step 2: "first
    /// pattern in config order whose wildcard matches"), so this preserves
    /// insertion order instead of sorting keys the way a `BTreeMap` would.
    #[serde(default)]
    pub model_routes: IndexMap<String, Vec<ModelRouteConfig>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Priority,
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub selection_strategy: SelectionStrategy,
    pub sticky_provider_duration: u64,
    pub unhealthy_threshold: u32,
    pub unhealthy_reset_on_success: bool,
    /// Seconds of inactivity after which a provider's failure counters are
    /// swept back to zero even without a success; 0 disables the sweep.
    pub unhealthy_reset_timeout: u64,
    pub failure_cooldown: u64,
    pub unhealthy_http_codes: Vec<u16>,
    pub unhealthy_exception_patterns: Vec<String>,
    pub unhealthy_response_body_patterns: Vec<String>,
    pub timeouts: TimeoutsConfig,
    pub deduplication: DeduplicationConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            selection_strategy: SelectionStrategy::default(),
            sticky_provider_duration: 300,
            unhealthy_threshold: 2,
            unhealthy_reset_on_success: true,
            unhealthy_reset_timeout: 0,
            failure_cooldown: 60,
            unhealthy_http_codes: vec![429, 500, 502, 503, 504],
            unhealthy_exception_patterns: Vec::new(),
            unhealthy_response_body_patterns: Vec::new(),
            timeouts: TimeoutsConfig::default(),
            deduplication: DeduplicationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub streaming: StreamingTimeouts,
    pub non_streaming: NonStreamingTimeouts,
    pub caching: CachingTimeouts,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            streaming: StreamingTimeouts::default(),
            non_streaming: NonStreamingTimeouts::default(),
            caching: CachingTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamingTimeouts {
    pub connect_secs: u64,
    pub read_secs: u64,
    /// Connection-establishment guard: first chunk must arrive within this
    /// bound or failover is still attempted (§4.7).
    pub first_byte_secs: u64,
}

impl Default for StreamingTimeouts {
    fn default() -> Self {
        Self { connect_secs: 30, read_secs: 120, first_byte_secs: 120 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NonStreamingTimeouts {
    pub connect_secs: u64,
    pub read_secs: u64,
}

impl Default for NonStreamingTimeouts {
    fn default() -> Self {
        Self { connect_secs: 30, read_secs: 60 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CachingTimeouts {
    pub cached_result_ttl_secs: u64,
    pub dedup_wait_secs: u64,
}

impl Default for CachingTimeouts {
    fn default() -> Self {
        Self { cached_result_ttl_secs: 30, dedup_wait_secs: 180 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeduplicationConfig {
    pub enabled: bool,
    pub include_max_tokens_in_signature: bool,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self { enabled: true, include_max_tokens_in_signature: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    Openai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    Bearer,
    Oauth,
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    #[default]
    Auto,
    Direct,
    Background,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub base_url: String,
    pub auth_type: AuthMode,
    #[serde(default)]
    pub auth_value: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub streaming_mode: StreamingMode,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelRouteConfig {
    pub provider: String,
    /// `"passthrough"` means forward the client's requested model verbatim.
    pub model: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Loads and parses the YAML configuration file. Parsing mechanics are
/// `serde_yaml`'s job; this is just the one call site plus error context.
pub fn load(path: &std::path::Path) -> Result<Config, ConfigLoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigLoadError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("failed to parse config file {path}")]
    Parse { path: String, #[source] source: serde_yaml::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_match_spec_table() {
        let settings = Settings::default();
        assert_eq!(settings.selection_strategy, SelectionStrategy::Priority);
        assert_eq!(settings.sticky_provider_duration, 300);
        assert_eq!(settings.unhealthy_threshold, 2);
        assert_eq!(settings.failure_cooldown, 60);
        assert!(settings.deduplication.enabled);
        assert!(!settings.deduplication.include_max_tokens_in_signature);
    }

    #[test]
    fn parses_minimal_yaml_document() {
        let yaml = r#"
providers:
  - name: primary
    type: anthropic
    base_url: https://api.anthropic.com
    auth_type: api_key
    auth_value: sk-test
model_routes:
  "claude-3-5-sonnet*":
    - provider: primary
      model: passthrough
      priority: 1
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("valid config");
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].kind, ProviderKind::Anthropic);
        assert!(config.model_routes.contains_key("claude-3-5-sonnet*"));
    }
}

//! Shared, dependency-light types: the YAML configuration shape (§6) and the
//! merged process-level settings every other crate is constructed from.

pub mod config;

pub use config::{Config, ConfigLoadError};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Process-level settings, merged CLI > ENV > defaults at startup. Distinct
/// from [`Config`], which is the reloadable provider/routing document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    pub config_path: String,
    pub proxy: Option<String>,
}

/// Optional layer used while merging CLI/ENV onto defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config_path: Option<String>,
    pub proxy: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.config_path.is_some() {
            self.config_path = other.config_path;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            config_path: self
                .config_path
                .ok_or(GlobalConfigError::MissingField("config_path"))?,
            proxy: self.proxy,
        })
    }
}

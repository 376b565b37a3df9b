//! Process bootstrap: CLI/env parsing and the merge into `GlobalConfig`
//! (`gproxy-common`'s patch/overlay shape), then YAML config load and
//! `AppState` construction. The only entry point `apps/gproxy`'s `main`
//! needs to call.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use gproxy_common::GlobalConfigPatch;
use gproxy_provider_core::TerminalEventSink;

use crate::state::AppState;

/// Process-level knobs. `clap`'s `env` attribute already gives CLI > ENV >
/// `default_value` precedence per field, so no manual overlay is needed here
/// beyond handing the parsed values to [`GlobalConfigPatch`].
#[derive(Debug, Parser)]
#[command(name = "gproxy", about = "Reverse proxy for the Anthropic Messages API with provider failover")]
pub struct CliArgs {
    /// Bind address.
    #[arg(long, env = "GPROXY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port.
    #[arg(long, env = "GPROXY_PORT", default_value_t = 8787)]
    pub port: u16,

    /// Path to the provider/routing YAML document (reloadable via `POST /providers/reload`).
    #[arg(long = "config", env = "GPROXY_CONFIG", default_value = "config.yaml")]
    pub config_path: String,

    /// Outbound proxy applied to every upstream call unless a provider overrides it.
    #[arg(long, env = "GPROXY_PROXY")]
    pub proxy: Option<String>,
}

impl CliArgs {
    fn into_patch(self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: Some(self.host),
            port: Some(self.port),
            config_path: Some(self.config_path),
            proxy: self.proxy,
        }
    }
}

/// Parses `std::env::args`, loads the YAML config it points at, and
/// constructs the process [`AppState`]. Fails loudly (no partial startup)
/// if the config path is missing or malformed.
pub fn bootstrap_from_env() -> anyhow::Result<Arc<AppState>> {
    let args = CliArgs::parse();
    let global = args.into_patch().into_config()?;
    let config = gproxy_common::config::load(Path::new(&global.config_path))?;
    let state = AppState::new(global, config);
    // `add_sink` is async; the event hub itself is ready to `emit` into before
    // this resolves, so it's fire-and-forget from a sync bootstrap.
    let events = state.events.clone();
    tokio::spawn(async move { events.add_sink(Arc::new(TerminalEventSink::new())).await });
    Ok(Arc::new(state))
}

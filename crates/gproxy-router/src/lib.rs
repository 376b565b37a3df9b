//! HTTP surface (§6): mounts the Messages proxy and the small operational
//! surface (`/providers`, `/providers/reload`, `/cleanup`, `/`) over
//! `gproxy-core`'s [`AppState`].

mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use gproxy_core::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(handlers::create_message))
        .route("/v1/messages/count_tokens", post(handlers::count_tokens))
        .route("/providers", get(handlers::list_providers))
        .route("/providers/reload", post(handlers::reload_providers))
        .route("/cleanup", post(handlers::cleanup))
        .route("/", get(handlers::liveness))
        .with_state(state)
}

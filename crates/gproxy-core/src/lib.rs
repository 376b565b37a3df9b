//! Request-handling core: fingerprinting (C4), the dedup coordinator (C5),
//! the streaming broadcaster (C6), the upstream HTTP client (C7), and the
//! request controller (C8) that ties them together with the provider pool
//! in `gproxy-provider-core`.

pub mod bootstrap;
pub mod broadcaster;
pub mod controller;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod state;
pub mod token_estimate;
pub mod upstream;

pub use bootstrap::{CliArgs, bootstrap_from_env};
pub use broadcaster::{Broadcaster, BroadcasterState, SubscriberKind};
pub use controller::{RequestController, RequestOutcome};
pub use dedup::{Decision, DedupCoordinator, WaiterOutcome};
pub use error::ProxyError;
pub use fingerprint::{Fingerprint, fingerprint};
pub use state::AppState;
pub use token_estimate::estimate_input_tokens;
pub use upstream::{FailoverVerdict, TransportErrorKind, UpstreamClient, UpstreamFailure};

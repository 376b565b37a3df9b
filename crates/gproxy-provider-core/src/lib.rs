//! Provider pool abstractions: the data model, the health store (C1), the
//! provider registry and auth-header assembly (C2), and the model router
//! (C3). No network IO lives here and this crate does not depend on axum;
//! `gproxy-core` performs the actual upstream calls against the types
//! defined here.

pub mod events;
pub mod headers;
pub mod health;
pub mod model;
pub mod registry;
pub mod router;

pub use events::{Event, EventHub, EventSink, TerminalEventSink, TestEventSink};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use health::{HealthStore, ProviderHealthSnapshot};
pub use model::{AuthMaterial, AuthMode, ModelRoute, Provider, ProviderKind, StreamingMode};
pub use registry::{AuthorizationRequired, OAuthCollaborator, ProviderRegistry};
pub use router::{Candidate, ModelRouter, NoProviderError, RouterState};

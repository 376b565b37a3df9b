//! Provider registry (C2, §4.2): loaded provider definitions plus the
//! `headers_for` auth-header assembly contract.

use std::collections::HashMap;
use std::sync::Arc;

use crate::headers::{Headers, header_get, header_remove, header_set};
use crate::model::{AuthMode, Provider, ProviderKind};

/// Raised when `auth_mode == oauth` and no token is obtainable. The caller
/// (the request controller) converts this into a 401 and triggers the
/// interactive flow externally (§4.2, out of core scope).
#[derive(Debug, Clone, thiserror::Error)]
#[error("oauth token unavailable for provider {provider}")]
pub struct AuthorizationRequired {
    pub provider: String,
}

/// Collaborator that mints a current bearer token for an `oauth` provider.
/// The interactive login flow itself is out of scope (§1); by default no
/// token is ever obtainable, matching the distilled spec's "out of scope"
/// framing for OAuth while still implementing the interface.
pub trait OAuthCollaborator: Send + Sync {
    fn current_token(&self, provider: &str) -> Option<String>;
}

pub struct NoOAuthCollaborator;

impl OAuthCollaborator for NoOAuthCollaborator {
    fn current_token(&self, _provider: &str) -> Option<String> {
        None
    }
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<Provider>>,
    order: Vec<String>,
    oauth: Arc<dyn OAuthCollaborator>,
}

const STRIPPED_HEADERS: &[&str] = &["authorization", "x-api-key", "host", "content-length"];

impl ProviderRegistry {
    pub fn new(providers: Vec<Provider>) -> Self {
        Self::with_oauth(providers, Arc::new(NoOAuthCollaborator))
    }

    pub fn with_oauth(providers: Vec<Provider>, oauth: Arc<dyn OAuthCollaborator>) -> Self {
        let mut order = Vec::with_capacity(providers.len());
        let mut map = HashMap::with_capacity(providers.len());
        for provider in providers {
            order.push(provider.name.clone());
            map.insert(provider.name.clone(), Arc::new(provider));
        }
        Self { providers: map, order, oauth }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names_in_order(&self) -> &[String] {
        &self.order
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.order.iter().filter_map(move |name| self.providers.get(name))
    }

    /// §4.2 header assembly. Starts from the incoming client headers minus
    /// the strip list, then layers the provider's own auth.
    pub fn headers_for(&self, provider: &Provider, incoming: &Headers) -> Result<Headers, AuthorizationRequired> {
        let mut headers: Headers = incoming
            .iter()
            .filter(|(name, _)| !STRIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
            .cloned()
            .collect();

        match provider.auth_mode {
            AuthMode::Passthrough => {
                if let Some(value) = header_get(incoming, "authorization") {
                    header_set(&mut headers, "authorization", value.to_string());
                } else if let Some(value) = header_get(incoming, "x-api-key") {
                    header_set(&mut headers, "x-api-key", value.to_string());
                }
            }
            AuthMode::Oauth => {
                let token = provider
                    .auth_material
                    .get()
                    .or_else(|| self.oauth.current_token(&provider.name))
                    .ok_or_else(|| AuthorizationRequired { provider: provider.name.clone() })?;
                header_set(&mut headers, "authorization", format!("Bearer {token}"));
            }
            AuthMode::ApiKey => {
                let value = provider.auth_material.get().unwrap_or_default();
                match provider.kind {
                    ProviderKind::Anthropic => header_set(&mut headers, "x-api-key", value),
                    ProviderKind::Openai => header_set(&mut headers, "authorization", format!("Bearer {value}")),
                }
            }
            AuthMode::Bearer => {
                let value = provider.auth_material.get().unwrap_or_default();
                header_set(&mut headers, "authorization", format!("Bearer {value}"));
            }
        }

        if matches!(provider.kind, ProviderKind::Anthropic) {
            header_set(&mut headers, "anthropic-version", "2023-06-01".to_string());
        }

        // host/content-length are recomputed by the HTTP client for the new target.
        header_remove(&mut headers, "content-type");
        header_set(&mut headers, "content-type", "application/json".to_string());

        Ok(headers)
    }
}

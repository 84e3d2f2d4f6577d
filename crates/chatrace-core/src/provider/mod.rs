pub mod stream;

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::config::Config;

pub use stream::{HttpStreamOpener, StreamOpener};

/// Upper bound on providers raced per request.
pub const MAX_PROVIDERS: usize = 4;

/// An upstream OpenAI-compatible chat endpoint. Immutable once loaded.
#[derive(Clone)]
pub struct ProviderDescriptor {
    pub id: String,
    pub display_name: String,
    pub base_endpoint: String,
    credential: SecretString,
    pub model: String,
}

impl ProviderDescriptor {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        base_endpoint: impl Into<String>,
        credential: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let base: String = base_endpoint.into();
        Self {
            id: id.into(),
            display_name: display_name.into(),
            base_endpoint: base.trim_end_matches('/').to_string(),
            credential: SecretString::from(credential.into()),
            model: model.into(),
        }
    }

    /// Chat completions URL. Bases already ending in a version segment
    /// (`.../v1`, `.../openai/v1`) only get the resource path appended;
    /// a full completions URL is used as-is.
    pub fn completions_url(&self) -> String {
        let base = &self.base_endpoint;
        if base.ends_with("/chat/completions") {
            base.clone()
        } else if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    pub(crate) fn bearer(&self) -> String {
        format!("Bearer {}", self.credential.expose_secret())
    }
}

impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("base_endpoint", &self.base_endpoint)
            .field("credential", &"[REDACTED]")
            .field("model", &self.model)
            .finish()
    }
}

/// Build the provider list from configuration.
///
/// Slots missing an endpoint, credential or model are skipped entirely;
/// partial configuration is normal. At most [`MAX_PROVIDERS`] are returned,
/// in configuration order.
pub fn load_providers(config: &Config) -> Vec<ProviderDescriptor> {
    let mut providers = Vec::new();
    for (i, p) in config.providers.iter().enumerate() {
        let slot = i + 1;
        if p.api_base.trim().is_empty() || p.api_key.trim().is_empty() || p.model.trim().is_empty() {
            debug!("Skipping provider slot {}: incomplete configuration", slot);
            continue;
        }
        if providers.len() == MAX_PROVIDERS {
            debug!("Ignoring provider slot {}: limit of {} reached", slot, MAX_PROVIDERS);
            continue;
        }
        let id = if p.id.trim().is_empty() {
            format!("provider-{slot}")
        } else {
            p.id.trim().to_string()
        };
        let name = if p.name.trim().is_empty() {
            id.clone()
        } else {
            p.name.trim().to_string()
        };
        providers.push(ProviderDescriptor::new(
            id,
            name,
            p.api_base.trim(),
            p.api_key.trim(),
            p.model.trim(),
        ));
    }
    providers
}

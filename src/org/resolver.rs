//! Organization-scoped provider configuration resolution.
//!
//! Maps `assistant owner email → organization → provider sub-config`. The
//! environment fallback applies **only** when no owner is given: a request
//! that carries an owner whose organization lookup fails must never see
//! process-level credentials.

use tracing::{info, warn};

use crate::config::EnvProviderDefaults;

use super::store::OrgStore;
use super::Setup;

/// Where a resolved provider configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// Resolved from the owner's organization record.
    Organization,
    /// Resolved from process environment variables (ownerless request).
    EnvVars,
}

impl ConfigSource {
    /// String form used in logs and observability fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::EnvVars => "env_vars",
        }
    }
}

/// A fully resolved provider configuration for one request.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    /// Whether the provider may be used.
    pub enabled: bool,
    /// API key, if the provider needs one.
    pub api_key: Option<String>,
    /// Base URL, if overridden.
    pub base_url: Option<String>,
    /// Default model for fallback.
    pub default_model: Option<String>,
    /// Models enabled for the tenant.
    pub models: Vec<String>,
    /// Organization display name (`env` for ownerless requests).
    pub org_name: String,
    /// Configuration origin.
    pub source: ConfigSource,
    /// Global default model, when its provider matches the requested one.
    pub global_default_model: Option<String>,
    /// Small-fast model override, when its provider matches.
    pub small_fast_model: Option<String>,
}

impl ResolvedProvider {
    /// A disabled placeholder used when the tenant has no usable config.
    fn disabled(org_name: String, source: ConfigSource) -> Self {
        Self {
            enabled: false,
            api_key: None,
            base_url: None,
            default_model: None,
            models: Vec::new(),
            org_name,
            source,
            global_default_model: None,
            small_fast_model: None,
        }
    }
}

/// Resolver over the organization store.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    store: OrgStore,
    env_defaults: EnvProviderDefaults,
}

impl ConfigResolver {
    /// Build a resolver.
    pub fn new(store: OrgStore, env_defaults: EnvProviderDefaults) -> Self {
        Self {
            store,
            env_defaults,
        }
    }

    /// Resolve the provider configuration for a request.
    ///
    /// `owner` is the assistant owner's email, absent for ownerless calls.
    /// `provider` is one of `openai`, `ollama`, `google`.
    pub async fn resolve(&self, owner: Option<&str>, provider: &str) -> ResolvedProvider {
        let Some(owner_email) = owner else {
            return self.from_env(provider);
        };

        let org = match self.store.organization_for_owner(owner_email).await {
            Ok(org) => org,
            Err(e) => {
                // Do not leak env credentials into a tenant's session.
                warn!(owner = owner_email, error = %e, "organization lookup failed");
                return ResolvedProvider::disabled("Unknown".to_owned(), ConfigSource::Organization);
            }
        };

        let Some(setup) = org.config.default_setup() else {
            warn!(org = %org.name, "organization has no default setup");
            return ResolvedProvider::disabled(org.name, ConfigSource::Organization);
        };

        let Some(provider_setup) = setup.providers.get(provider) else {
            return ResolvedProvider::disabled(org.name, ConfigSource::Organization);
        };

        if !provider_setup.enabled {
            info!(org = %org.name, provider, "provider disabled for organization");
            return ResolvedProvider::disabled(org.name, ConfigSource::Organization);
        }

        ResolvedProvider {
            enabled: true,
            api_key: provider_setup.api_key.clone(),
            base_url: provider_setup.base_url.clone(),
            default_model: provider_setup.default_model.clone(),
            models: provider_setup.models.clone(),
            org_name: org.name,
            source: ConfigSource::Organization,
            global_default_model: matching_model(setup, provider, |s| {
                s.global_default_model.as_ref()
            }),
            small_fast_model: matching_model(setup, provider, |s| s.small_fast_model.as_ref()),
        }
    }

    /// Environment-variable configuration for ownerless requests.
    fn from_env(&self, provider: &str) -> ResolvedProvider {
        let env = &self.env_defaults;
        let (enabled, api_key, base_url, default_model) = match provider {
            "openai" => (
                env.openai_api_key.is_some(),
                env.openai_api_key.clone(),
                Some(env.openai_base_url.clone()),
                Some(env.openai_model.clone()),
            ),
            "ollama" => (
                true,
                None,
                Some(env.ollama_base_url.clone()),
                Some(env.ollama_model.clone()),
            ),
            "google" => (
                env.google_api_key.is_some(),
                env.google_api_key.clone(),
                None,
                None,
            ),
            _ => (false, None, None, None),
        };

        ResolvedProvider {
            enabled,
            api_key,
            base_url,
            default_model,
            models: Vec::new(),
            org_name: "env".to_owned(),
            source: ConfigSource::EnvVars,
            global_default_model: None,
            small_fast_model: None,
        }
    }
}

/// Extract a model reference when its provider matches.
fn matching_model<'a>(
    setup: &'a Setup,
    provider: &str,
    get: impl Fn(&'a Setup) -> Option<&'a super::ModelRef>,
) -> Option<String> {
    get(setup)
        .filter(|r| r.provider == provider && !r.model.is_empty())
        .map(|r| r.model.clone())
}

// ---------------------------------------------------------------------------
// Model resolution policy
// ---------------------------------------------------------------------------

/// Outcome of model resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    /// Model to send upstream.
    pub model: String,
    /// Whether resolution substituted the requested model.
    pub fallback_used: bool,
}

/// Errors from model resolution.
#[derive(Debug, thiserror::Error)]
pub enum ModelResolutionError {
    /// The tenant has no models enabled for the provider.
    #[error("no models are enabled for organization '{org}'")]
    NoModels {
        /// Organization display name.
        org: String,
    },
}

/// Apply the model-resolution policy to a requested model.
///
/// Order: requested model if enabled → organization default → global default
/// (when its provider matches) → first enabled model → error. With an empty
/// model list the requested model passes through untouched unless `strict`
/// is set (providers that cannot probe for models at call time, like the
/// OpenAI connector, pass `strict = true`; Ollama does not, because models
/// may exist server-side without being listed in the tenant config).
///
/// # Errors
///
/// Returns [`ModelResolutionError::NoModels`] when `strict` is set and an
/// organization-sourced config has no enabled models.
pub fn resolve_model(
    requested: &str,
    config: &ResolvedProvider,
    strict: bool,
) -> Result<ResolvedModel, ModelResolutionError> {
    if config.models.is_empty() {
        if strict && config.source == ConfigSource::Organization {
            return Err(ModelResolutionError::NoModels {
                org: config.org_name.clone(),
            });
        }
        // No tenant-level allow-list: trust the requested model.
        return Ok(ResolvedModel {
            model: requested.to_owned(),
            fallback_used: false,
        });
    }

    if config.models.iter().any(|m| m == requested) {
        return Ok(ResolvedModel {
            model: requested.to_owned(),
            fallback_used: false,
        });
    }

    let in_list = |candidate: &Option<String>| {
        candidate
            .as_deref()
            .filter(|m| config.models.iter().any(|have| have == m))
            .map(ToOwned::to_owned)
    };

    if let Some(model) = in_list(&config.default_model) {
        warn!(requested, fallback = %model, org = %config.org_name, "model not enabled, using organization default");
        return Ok(ResolvedModel {
            model,
            fallback_used: true,
        });
    }

    if let Some(model) = in_list(&config.global_default_model) {
        warn!(requested, fallback = %model, org = %config.org_name, "model not enabled, using global default");
        return Ok(ResolvedModel {
            model,
            fallback_used: true,
        });
    }

    // The list is non-empty here, so the first entry is the final fallback.
    let first = config.models[0].clone();
    warn!(requested, fallback = %first, org = %config.org_name, "model not enabled, using first available");
    Ok(ResolvedModel {
        model: first,
        fallback_used: true,
    })
}

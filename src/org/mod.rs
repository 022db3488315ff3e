//! Organization and creator-user domain model.
//!
//! An organization is the tenant boundary: it owns users, provider API keys,
//! model lists, and feature policies. Its `config` column is a nested JSON
//! document with named *setups*; only the `default` setup is consulted at
//! completion time.

pub mod resolver;
pub mod store;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel slug of the system organization. The system row cannot be deleted.
pub const SYSTEM_ORG_SLUG: &str = "system";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from organization and user operations.
#[derive(Debug, thiserror::Error)]
pub enum OrgError {
    /// Database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Lookup target does not exist.
    #[error("{entity} not found")]
    NotFound {
        /// Entity kind (for the message).
        entity: &'static str,
    },
    /// Attempted to delete the system organization.
    #[error("the system organization cannot be deleted")]
    SystemOrgProtected,
    /// Stored JSON column failed to parse.
    #[error("invalid stored config: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// Organization
// ---------------------------------------------------------------------------

/// A tenant record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    /// Database row id.
    pub id: i64,
    /// URL-friendly unique identifier.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Lifecycle status (`active`, `suspended`, …).
    pub status: String,
    /// Whether this is the protected system organization.
    pub is_system: bool,
    /// Nested configuration document.
    pub config: OrgConfig,
}

/// Parsed organization configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgConfig {
    /// Named setups; completion resolution reads `setups.default`.
    pub setups: HashMap<String, Setup>,
    /// Defaults applied to newly created assistants.
    pub assistant_defaults: serde_json::Value,
    /// Feature switches.
    pub features: Features,
}

impl OrgConfig {
    /// The `default` setup, if configured.
    pub fn default_setup(&self) -> Option<&Setup> {
        self.setups.get("default")
    }
}

/// One provider setup bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Setup {
    /// Per-provider connection configuration, keyed by provider name.
    pub providers: HashMap<String, ProviderSetup>,
    /// Cheap model used for title generation and similar auxiliary calls.
    pub small_fast_model: Option<ModelRef>,
    /// Organization-wide preferred model across providers.
    pub global_default_model: Option<ModelRef>,
}

/// Connection configuration for one provider inside a setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSetup {
    /// Whether this provider may be used at all.
    pub enabled: bool,
    /// Tenant API key.
    pub api_key: Option<String>,
    /// Provider base URL override.
    pub base_url: Option<String>,
    /// Model used when the requested one is unavailable.
    pub default_model: Option<String>,
    /// Models enabled for this tenant.
    pub models: Vec<String>,
}

/// A `{provider, model}` reference used by small-fast and global defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRef {
    /// Provider name (`openai`, `ollama`, `google`).
    pub provider: String,
    /// Model identifier.
    pub model: String,
}

/// Organization feature switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    /// Whether assistants may be shared inside this organization.
    pub sharing_enabled: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            sharing_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Creator user
// ---------------------------------------------------------------------------

/// Account type of a creator user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    /// Builds and owns assistants.
    Creator,
    /// Consumes published assistants only.
    EndUser,
}

impl UserType {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creator => "creator",
            Self::EndUser => "end_user",
        }
    }

    /// Parse from a SQLite text value; unknown values default to `creator`.
    pub fn parse(s: &str) -> Self {
        match s {
            "end_user" => Self::EndUser,
            _ => Self::Creator,
        }
    }
}

/// A creator-user record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatorUser {
    /// Database row id.
    pub id: i64,
    /// Login email, unique.
    pub email: String,
    /// Display name.
    pub name: String,
    /// Owning organization.
    pub organization_id: i64,
    /// Account type.
    pub user_type: UserType,
    /// Whether the account may log in.
    pub enabled: bool,
    /// Whether the account has administrative rights.
    pub is_admin: bool,
    /// Per-user settings document.
    pub user_config: UserConfig,
}

/// Per-user settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Whether the user may share assistants (org policy must also allow).
    pub can_share: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self { can_share: true }
    }
}

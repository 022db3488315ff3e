//! Configuration loading and management.
//!
//! All runtime configuration comes from the process environment (optionally
//! seeded from a `.env` file via `dotenvy`). Values are resolved once at
//! startup into a [`Settings`] struct that is shared behind an `Arc`.

use std::path::PathBuf;
use std::time::Duration;

/// Default listen port for the gateway.
const DEFAULT_PORT: u16 = 9099;

/// Default per-request completion timeout in seconds.
const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 120;

/// Default per-probe timeout in seconds.
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Default bound on pooled connections per outbound host.
const DEFAULT_MAX_CONNECTIONS: usize = 10;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Process-wide settings resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind address for the HTTP server.
    pub host: String,
    /// Bind port for the HTTP server.
    pub port: u16,
    /// The single process-level bearer key protecting the chat API.
    pub api_key: String,
    /// Path to the core SQLite database (orgs, users, assistants, chats).
    pub database_path: PathBuf,
    /// Path to the knowledge-base SQLite database (collections, jobs).
    pub kb_database_path: PathBuf,
    /// Path to the external identity provider's chat database (read-only).
    pub owi_database_path: Option<PathBuf>,
    /// Root directory for uploaded files and generated images.
    pub static_root: PathBuf,
    /// Public base URL used when building file and image URLs.
    pub public_base_url: String,
    /// Directory for rotated JSON log files.
    pub logs_dir: PathBuf,
    /// Environment-level provider defaults (used only for ownerless requests).
    pub env_providers: EnvProviderDefaults,
    /// Base URL of the vector store (Chroma-compatible HTTP API).
    pub chroma_base_url: String,
    /// Base URL of the external user/group directory.
    pub owi_base_url: String,
    /// API key for the external user/group directory.
    pub owi_api_key: Option<String>,
    /// Moodle LMS endpoint for the reference tools.
    pub moodle_url: Option<String>,
    /// Moodle web-service token.
    pub moodle_token: Option<String>,
    /// Per-request completion timeout.
    pub completion_timeout: Duration,
    /// Status-probe timeout.
    pub probe_timeout: Duration,
    /// Bound on pooled connections per outbound host.
    pub max_connections: usize,
    /// Background database maintenance configuration.
    pub maintenance: MaintenanceSettings,
}

/// Environment-variable provider defaults.
///
/// Used by connectors only when a request has no assistant owner; a present
/// owner whose organization lookup fails must never fall through to these.
#[derive(Debug, Clone, Default)]
pub struct EnvProviderDefaults {
    /// `OPENAI_API_KEY`.
    pub openai_api_key: Option<String>,
    /// `OPENAI_BASE_URL` (default `https://api.openai.com/v1`).
    pub openai_base_url: String,
    /// `OPENAI_MODEL` (default `gpt-4o-mini`).
    pub openai_model: String,
    /// `OLLAMA_BASE_URL` (default `http://localhost:11434`).
    pub ollama_base_url: String,
    /// `OLLAMA_MODEL` (default `llama3.1`).
    pub ollama_model: String,
    /// `OLLAMA_REQUEST_TIMEOUT` in seconds (default 120).
    pub ollama_timeout: Duration,
    /// `GOOGLE_API_KEY` for the image connector.
    pub google_api_key: Option<String>,
}

/// Background database maintenance loops (disabled by default to avoid
/// duplication under dev reload).
#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    /// Master switch, `DB_MAINTENANCE_ENABLED`.
    pub enabled: bool,
    /// Cron schedule for WAL checkpoints, `DB_CHECKPOINT_CRON`.
    pub checkpoint_cron: String,
    /// Cron schedule for `ANALYZE` + `PRAGMA optimize`, `DB_ANALYZE_CRON`.
    pub analyze_cron: String,
    /// Cron schedule for `VACUUM`, `DB_VACUUM_CRON`.
    pub vacuum_cron: String,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            // Every 30 minutes / daily at 04:00 / weekly Sunday 05:00.
            checkpoint_cron: "0 */30 * * * *".to_owned(),
            analyze_cron: "0 0 4 * * *".to_owned(),
            vacuum_cron: "0 0 5 * * Sun".to_owned(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `API_KEY` is missing or a numeric variable fails
    /// to parse.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load settings using a custom env resolver (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if `API_KEY` is missing or a numeric variable fails
    /// to parse.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let api_key = env("API_KEY")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("API_KEY must be set"))?;

        let port = parse_or("PORT", &env, DEFAULT_PORT)?;
        let completion_timeout = Duration::from_secs(parse_or(
            "LLM_REQUEST_TIMEOUT",
            &env,
            DEFAULT_COMPLETION_TIMEOUT_SECS,
        )?);
        let probe_timeout =
            Duration::from_secs(parse_or("PROBE_TIMEOUT", &env, DEFAULT_PROBE_TIMEOUT_SECS)?);
        let max_connections = parse_or("LLM_MAX_CONNECTIONS", &env, DEFAULT_MAX_CONNECTIONS)?;
        let ollama_timeout = Duration::from_secs(parse_or(
            "OLLAMA_REQUEST_TIMEOUT",
            &env,
            DEFAULT_COMPLETION_TIMEOUT_SECS,
        )?);

        let public_base_url = env("PUBLIC_BASE_URL")
            .or_else(|| env("HOME_URL"))
            .unwrap_or_else(|| "http://localhost:9099".to_owned());

        Ok(Self {
            host: env("HOST").unwrap_or_else(|| "0.0.0.0".to_owned()),
            port,
            api_key,
            database_path: env("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/lectern.db")),
            kb_database_path: env("KB_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/lectern-kb.db")),
            owi_database_path: env("OWI_DATABASE_PATH").map(PathBuf::from),
            static_root: env("STATIC_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("static")),
            public_base_url,
            logs_dir: env("LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
            env_providers: EnvProviderDefaults {
                openai_api_key: env("OPENAI_API_KEY").filter(|v| !v.is_empty()),
                openai_base_url: env("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_owned()),
                openai_model: env("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_owned()),
                ollama_base_url: env("OLLAMA_BASE_URL")
                    .unwrap_or_else(|| "http://localhost:11434".to_owned()),
                ollama_model: env("OLLAMA_MODEL").unwrap_or_else(|| "llama3.1".to_owned()),
                ollama_timeout,
                google_api_key: env("GOOGLE_API_KEY").filter(|v| !v.is_empty()),
            },
            chroma_base_url: env("CHROMA_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8000".to_owned()),
            owi_base_url: env("OWI_BASE_URL").unwrap_or_else(|| "http://localhost:8080".to_owned()),
            owi_api_key: env("OWI_API_KEY").filter(|v| !v.is_empty()),
            moodle_url: env("MOODLE_URL").filter(|v| !v.is_empty()),
            moodle_token: env("MOODLE_TOKEN").filter(|v| !v.is_empty()),
            completion_timeout,
            probe_timeout,
            max_connections,
            maintenance: MaintenanceSettings {
                enabled: env("DB_MAINTENANCE_ENABLED")
                    .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                    .unwrap_or(false),
                checkpoint_cron: env("DB_CHECKPOINT_CRON")
                    .unwrap_or_else(|| MaintenanceSettings::default().checkpoint_cron),
                analyze_cron: env("DB_ANALYZE_CRON")
                    .unwrap_or_else(|| MaintenanceSettings::default().analyze_cron),
                vacuum_cron: env("DB_VACUUM_CRON")
                    .unwrap_or_else(|| MaintenanceSettings::default().vacuum_cron),
            },
        })
    }
}

/// Parse an env var with a default, failing on malformed values.
fn parse_or<T: std::str::FromStr>(
    key: &str,
    env: &impl Fn(&str) -> Option<String>,
    default: T,
) -> anyhow::Result<T> {
    match env(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

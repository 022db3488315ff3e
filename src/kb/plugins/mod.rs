//! Ingestion and query plugin registry.
//!
//! Plugins are an open set behind string keys; ingestion and query plugins
//! live in separate tables. Each plugin's mode is taken from the process
//! environment at registration (`PLUGIN_<NAME>=DISABLE|SIMPLIFIED|ADVANCED`,
//! `ENABLE` accepted as an alias of `ADVANCED`):
//!
//! - `DISABLE` — not registered at all.
//! - `SIMPLIFIED` — parameters with a non-null default are hidden from the
//!   public catalog and stripped from incoming requests, except a per-kind
//!   essentials whitelist.
//! - `ADVANCED` — pass through (default).

pub mod markdown;
pub mod query;
pub mod url;
pub mod youtube;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::models::{Collection, DocumentChunk, ProcessingStats};

/// Essential parameters kept in SIMPLIFIED mode for ingestion plugins.
const INGEST_ESSENTIALS: [&str; 4] = ["url", "urls", "video_url", "language"];

/// Essential parameters kept in SIMPLIFIED mode for query plugins.
const QUERY_ESSENTIALS: [&str; 2] = ["top_k", "threshold"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failure inside a plugin, tagged with the processing stage.
#[derive(Debug, thiserror::Error)]
#[error("{kind} at {stage}: {message}")]
pub struct IngestError {
    /// Error class (for `error_details.exception_type`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Stage the failure occurred in.
    pub stage: String,
}

impl IngestError {
    /// Build an error at a stage.
    pub fn at(stage: &str, kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_owned(),
            message: message.into(),
            stage: stage.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter specs
// ---------------------------------------------------------------------------

/// Declared parameter of a plugin.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    /// JSON type name.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Human description.
    pub description: &'static str,
    /// Default value; `null` means the parameter requires input.
    pub default: Value,
    /// Whether the parameter must be supplied.
    pub required: bool,
    /// Enumerated choices, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<&'static str>>,
}

impl ParamSpec {
    /// Whether the spec declares a non-null default.
    pub fn has_non_null_default(&self) -> bool {
        !self.default.is_null()
    }
}

// ---------------------------------------------------------------------------
// Plugin traits
// ---------------------------------------------------------------------------

/// What an ingestion plugin consumes.
#[derive(Debug, Clone)]
pub enum IngestSource {
    /// A stored file on local disk.
    File {
        /// Stored path.
        path: PathBuf,
    },
    /// A list of remote inputs (URLs, video links).
    Urls(Vec<String>),
}

/// Async progress callback: `(current, total, message)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Async statistics callback, invoked with a full snapshot on every report
/// so the UI sees stages as they complete.
pub type StatsCallback = Arc<dyn Fn(ProcessingStats) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-job context handed to an ingestion plugin.
#[derive(Clone)]
pub struct IngestContext {
    /// Owner of the target collection.
    pub collection_owner: String,
    /// Name of the target collection.
    pub collection_name: String,
    /// The collection's OpenAI key — present **only** when the collection's
    /// embedding vendor is OpenAI, per the privacy contract.
    pub openai_api_key: Option<String>,
    /// Root of the static file tree for derivatives.
    pub static_root: PathBuf,
    /// Public base URL for derivative links.
    pub public_base_url: String,
    /// Progress reporter.
    pub progress: ProgressCallback,
    /// Statistics reporter.
    pub stats: StatsCallback,
}

impl IngestContext {
    /// A context with no-op callbacks (tests, dry runs).
    pub fn noop(static_root: PathBuf, owner: &str, collection: &str) -> Self {
        Self {
            collection_owner: owner.to_owned(),
            collection_name: collection.to_owned(),
            openai_api_key: None,
            static_root,
            public_base_url: "http://localhost".to_owned(),
            progress: Arc::new(|_, _, _| Box::pin(async {})),
            stats: Arc::new(|_| Box::pin(async {})),
        }
    }

    /// Report progress.
    pub async fn report_progress(&self, current: u64, total: u64, message: impl Into<String>) {
        (self.progress)(current, total, message.into()).await;
    }

    /// Report a statistics snapshot.
    pub async fn report_stats(&self, stats: ProcessingStats) {
        (self.stats)(stats).await;
    }
}

impl std::fmt::Debug for IngestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestContext")
            .field("collection_owner", &self.collection_owner)
            .field("collection_name", &self.collection_name)
            .field("has_openai_key", &self.openai_api_key.is_some())
            .finish_non_exhaustive()
    }
}

/// An ingestion plugin.
#[async_trait::async_trait]
pub trait IngestPlugin: Send + Sync {
    /// Registry key.
    fn name(&self) -> &'static str;
    /// Plugin kind (`file-ingest`, `url-ingest`, `base-ingest`).
    fn kind(&self) -> &'static str;
    /// Human description for the catalog.
    fn description(&self) -> &'static str;
    /// File extensions this plugin accepts (empty for URL plugins).
    fn supported_file_types(&self) -> &'static [&'static str];
    /// Declared parameters.
    fn parameters(&self) -> BTreeMap<&'static str, ParamSpec>;

    /// Process a source into document chunks.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] tagged with the failing stage; the worker
    /// captures it into the job row.
    async fn ingest(
        &self,
        source: &IngestSource,
        params: &Value,
        ctx: &IngestContext,
    ) -> Result<Vec<DocumentChunk>, IngestError>;
}

/// One query result.
#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    /// Similarity in `[0, 1]`.
    pub similarity: f64,
    /// Chunk text.
    pub data: String,
    /// Chunk metadata.
    pub metadata: Value,
}

/// A query plugin.
#[async_trait::async_trait]
pub trait QueryPlugin: Send + Sync {
    /// Registry key.
    fn name(&self) -> &'static str;
    /// Human description for the catalog.
    fn description(&self) -> &'static str;
    /// Declared parameters (`top_k` and `threshold` always accepted).
    fn parameters(&self) -> BTreeMap<&'static str, ParamSpec>;

    /// Run a similarity query against a collection.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::kb::KbError`] on embedding or store failure.
    async fn query(
        &self,
        collection: &Collection,
        query_text: &str,
        params: &Value,
    ) -> Result<Vec<QueryHit>, crate::kb::KbError>;
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Per-plugin operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PluginMode {
    /// Not registered.
    Disable,
    /// Advanced parameters hidden and stripped.
    Simplified,
    /// Full parameter surface (default).
    Advanced,
}

impl PluginMode {
    /// String form for the catalog.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "DISABLE",
            Self::Simplified => "SIMPLIFIED",
            Self::Advanced => "ADVANCED",
        }
    }
}

/// Resolve a plugin's mode from an environment lookup.
///
/// Invalid values warn and fall back to `ADVANCED`; `ENABLE` is accepted as
/// an alias of `ADVANCED`.
pub fn mode_from_env(plugin_name: &str, env: impl Fn(&str) -> Option<String>) -> PluginMode {
    let var = format!("PLUGIN_{}", plugin_name.to_uppercase());
    let Some(raw) = env(&var) else {
        return PluginMode::Advanced;
    };

    match raw.trim().to_uppercase().as_str() {
        "DISABLE" => PluginMode::Disable,
        "SIMPLIFIED" => PluginMode::Simplified,
        "ADVANCED" | "ENABLE" => PluginMode::Advanced,
        other => {
            warn!(
                var,
                value = other,
                "invalid plugin mode (supported: DISABLE, SIMPLIFIED, ADVANCED), using ADVANCED"
            );
            PluginMode::Advanced
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide plugin registry.
#[derive(Default)]
pub struct PluginRegistry {
    ingest: HashMap<String, Arc<dyn IngestPlugin>>,
    ingest_modes: HashMap<String, PluginMode>,
    query: HashMap<String, Arc<dyn QueryPlugin>>,
    query_modes: HashMap<String, PluginMode>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("ingest", &self.ingest.keys().collect::<Vec<_>>())
            .field("query", &self.query.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an ingestion plugin with the mode from the environment.
    pub fn register_ingest(&mut self, plugin: Arc<dyn IngestPlugin>) {
        let mode = mode_from_env(plugin.name(), |key| std::env::var(key).ok());
        self.register_ingest_with_mode(plugin, mode);
    }

    /// Register an ingestion plugin with an explicit mode (tests).
    pub fn register_ingest_with_mode(&mut self, plugin: Arc<dyn IngestPlugin>, mode: PluginMode) {
        let name = plugin.name().to_owned();
        if mode == PluginMode::Disable {
            info!(plugin = %name, "ingestion plugin disabled via environment");
            return;
        }
        debug!(plugin = %name, mode = mode.as_str(), "ingestion plugin registered");
        self.ingest.insert(name.clone(), plugin);
        self.ingest_modes.insert(name, mode);
    }

    /// Register a query plugin with the mode from the environment.
    pub fn register_query(&mut self, plugin: Arc<dyn QueryPlugin>) {
        let mode = mode_from_env(plugin.name(), |key| std::env::var(key).ok());
        self.register_query_with_mode(plugin, mode);
    }

    /// Register a query plugin with an explicit mode (tests).
    pub fn register_query_with_mode(&mut self, plugin: Arc<dyn QueryPlugin>, mode: PluginMode) {
        let name = plugin.name().to_owned();
        if mode == PluginMode::Disable {
            info!(plugin = %name, "query plugin disabled via environment");
            return;
        }
        debug!(plugin = %name, mode = mode.as_str(), "query plugin registered");
        self.query.insert(name.clone(), plugin);
        self.query_modes.insert(name, mode);
    }

    /// Look up an ingestion plugin.
    pub fn ingest_plugin(&self, name: &str) -> Option<Arc<dyn IngestPlugin>> {
        self.ingest.get(name).cloned()
    }

    /// Look up a query plugin.
    pub fn query_plugin(&self, name: &str) -> Option<Arc<dyn QueryPlugin>> {
        self.query.get(name).cloned()
    }

    /// Mode of an ingestion plugin (`ADVANCED` when unregistered).
    pub fn ingest_mode(&self, name: &str) -> PluginMode {
        self.ingest_modes
            .get(name)
            .copied()
            .unwrap_or(PluginMode::Advanced)
    }

    /// Mode of a query plugin (`ADVANCED` when unregistered).
    pub fn query_mode(&self, name: &str) -> PluginMode {
        self.query_modes
            .get(name)
            .copied()
            .unwrap_or(PluginMode::Advanced)
    }

    // -- catalogs -----------------------------------------------------------

    /// Public catalog of ingestion plugins, with mode-gated parameters.
    pub fn ingest_catalog(&self) -> Vec<Value> {
        let mut names: Vec<&String> = self.ingest.keys().collect();
        names.sort();

        names
            .into_iter()
            .filter_map(|name| {
                let plugin = self.ingest.get(name)?;
                let mode = self.ingest_mode(name);
                let params = visible_params(plugin.parameters(), mode);
                Some(json!({
                    "name": plugin.name(),
                    "description": plugin.description(),
                    "kind": plugin.kind(),
                    "mode": mode.as_str(),
                    "supported_file_types": plugin.supported_file_types(),
                    "parameters": params,
                }))
            })
            .collect()
    }

    /// Public catalog of query plugins, with mode-gated parameters.
    pub fn query_catalog(&self) -> Vec<Value> {
        let mut names: Vec<&String> = self.query.keys().collect();
        names.sort();

        names
            .into_iter()
            .filter_map(|name| {
                let plugin = self.query.get(name)?;
                let mode = self.query_mode(name);
                let params = visible_params(plugin.parameters(), mode);
                Some(json!({
                    "name": plugin.name(),
                    "description": plugin.description(),
                    "mode": mode.as_str(),
                    "parameters": params,
                }))
            })
            .collect()
    }

    // -- sanitization -------------------------------------------------------

    /// Strip advanced parameters from an ingestion request according to the
    /// plugin's mode. Applied before the plugin ever sees the request.
    pub fn sanitize_ingest_params(&self, plugin_name: &str, params: Value) -> Value {
        let Some(plugin) = self.ingest.get(plugin_name) else {
            return params;
        };
        if self.ingest_mode(plugin_name) != PluginMode::Simplified {
            return params;
        }
        sanitize(params, plugin.parameters(), &INGEST_ESSENTIALS, plugin_name)
    }

    /// Strip advanced parameters from a query request according to the
    /// plugin's mode.
    pub fn sanitize_query_params(&self, plugin_name: &str, params: Value) -> Value {
        let Some(plugin) = self.query.get(plugin_name) else {
            return params;
        };
        if self.query_mode(plugin_name) != PluginMode::Simplified {
            return params;
        }
        sanitize(params, plugin.parameters(), &QUERY_ESSENTIALS, plugin_name)
    }
}

/// Parameters visible in the public catalog for a mode.
fn visible_params(
    params: BTreeMap<&'static str, ParamSpec>,
    mode: PluginMode,
) -> Map<String, Value> {
    params
        .into_iter()
        .filter(|(_, spec)| mode != PluginMode::Simplified || !spec.has_non_null_default())
        .map(|(name, spec)| {
            (
                name.to_owned(),
                serde_json::to_value(spec).unwrap_or(Value::Null),
            )
        })
        .collect()
}

/// SIMPLIFIED-mode request sanitization: keep required parameters,
/// parameters without a default, and the per-kind essentials.
fn sanitize(
    params: Value,
    schema: BTreeMap<&'static str, ParamSpec>,
    essentials: &[&str],
    plugin_name: &str,
) -> Value {
    let Value::Object(map) = params else {
        return params;
    };

    let allowed: std::collections::HashSet<&str> = schema
        .iter()
        .filter(|(_, spec)| spec.required || !spec.has_non_null_default())
        .map(|(name, _)| *name)
        .chain(essentials.iter().copied())
        .collect();

    let (kept, removed): (Vec<_>, Vec<_>) = map
        .into_iter()
        .partition(|(key, _)| allowed.contains(key.as_str()));

    if !removed.is_empty() {
        let names: Vec<String> = removed.into_iter().map(|(key, _)| key).collect();
        info!(
            plugin = plugin_name,
            removed = names.join(", "),
            "simplified mode removed advanced params"
        );
    }

    Value::Object(kept.into_iter().collect())
}

//! Tool registry and execution.
//!
//! Tools are registered once at startup; each entry pairs an OpenAI
//! function-calling spec with an async handler. Errors inside a tool are
//! captured into the tool's reply payload as `{"error": "..."}` rather than
//! aborting the completion loop, and malformed tool-call argument JSON is
//! tolerated by passing `{}` to the handler.

pub mod moodle;
pub mod weather;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::providers::ToolDefinition;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by tool handlers.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// A required input field is missing or malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The tool ran but failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    /// The tool is not usable with the current configuration.
    #[error("not configured: {0}")]
    NotConfigured(String),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Boxed async tool handler.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync>;

/// One registered tool.
#[derive(Clone)]
pub struct ToolEntry {
    /// Spec advertised to the model.
    pub definition: ToolDefinition,
    /// UI grouping label.
    pub category: &'static str,
    handler: ToolHandler,
}

impl std::fmt::Debug for ToolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEntry")
            .field("name", &self.definition.name)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

/// Process-wide tool registry.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry with the reference tools wired to settings.
    pub fn with_reference_tools(settings: &Settings) -> Self {
        let mut registry = Self::new();

        registry.register(
            weather::definition(),
            "utilities",
            Arc::new(|input| Box::pin(weather::get_weather(input))),
        );

        let moodle_config = moodle::MoodleConfig::from_settings(settings);
        let courses_config = moodle_config.clone();
        registry.register(
            moodle::courses_definition(),
            "lms",
            Arc::new(move |input| {
                let config = courses_config.clone();
                Box::pin(async move { moodle::get_moodle_courses(&config, input).await })
            }),
        );

        let assignments_config = moodle_config;
        registry.register(
            moodle::assignments_definition(),
            "lms",
            Arc::new(move |input| {
                let config = assignments_config.clone();
                Box::pin(async move { moodle::get_moodle_assignments_status(&config, input).await })
            }),
        );

        info!(count = registry.len(), "tool registry initialised");
        registry
    }

    /// Register a tool under its definition name.
    pub fn register(&mut self, definition: ToolDefinition, category: &'static str, handler: ToolHandler) {
        let name = definition.name.clone();
        self.tools.insert(
            name,
            ToolEntry {
                definition,
                category,
                handler,
            },
        );
    }

    /// Specs for a named subset of tools, in request order. Unknown names
    /// are skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|entry| entry.definition.clone())
            .collect()
    }

    /// All registered tools with metadata, for the catalog endpoint.
    pub fn catalog(&self) -> Vec<Value> {
        let mut entries: Vec<&ToolEntry> = self.tools.values().collect();
        entries.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        entries
            .iter()
            .map(|entry| {
                json!({
                    "name": entry.definition.name,
                    "description": entry.definition.description,
                    "category": entry.category,
                })
            })
            .collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool call, returning the reply payload for the `tool` role.
    ///
    /// This never fails: unknown tools, bad arguments, and handler errors
    /// are all captured into a JSON error payload so the completion loop
    /// continues.
    pub async fn execute(&self, name: &str, raw_arguments: &str) -> String {
        let Some(entry) = self.tools.get(name) else {
            warn!(tool = name, "unknown tool requested");
            return json!({"error": format!("unknown tool: {name}")}).to_string();
        };

        // Tolerate malformed argument JSON by handing the tool an empty map.
        let arguments: Value = serde_json::from_str(raw_arguments).unwrap_or_else(|e| {
            warn!(tool = name, error = %e, "malformed tool arguments, using empty object");
            json!({})
        });

        debug!(tool = name, "executing tool");
        match (entry.handler)(arguments).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = name, error = %e, "tool execution failed");
                json!({"error": e.to_string()}).to_string()
            }
        }
    }
}

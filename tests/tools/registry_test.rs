//! Tool registry behavior tests.

use std::sync::Arc;

use serde_json::{json, Value};

use lectern::providers::ToolDefinition;
use lectern::tools::{ToolError, ToolRegistry};

fn echo_tool() -> ToolDefinition {
    ToolDefinition {
        name: "echo".to_owned(),
        description: "echo input".to_owned(),
        parameters: json!({"type": "object"}),
    }
}

fn registry_with_echo() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(
        echo_tool(),
        "test",
        Arc::new(|input| Box::pin(async move { Ok::<_, ToolError>(input.to_string()) })),
    );
    registry.register(
        ToolDefinition {
            name: "broken".to_owned(),
            description: "always fails".to_owned(),
            parameters: json!({"type": "object"}),
        },
        "test",
        Arc::new(|_| {
            Box::pin(async { Err::<String, _>(ToolError::ExecutionFailed("kaput".to_owned())) })
        }),
    );
    registry
}

#[tokio::test]
async fn executes_registered_tool() {
    let registry = registry_with_echo();
    let reply = registry.execute("echo", "{\"a\": 1}").await;
    let parsed: Value = serde_json::from_str(&reply).expect("json reply");
    assert_eq!(parsed["a"], 1);
}

#[tokio::test]
async fn unknown_tool_yields_error_payload() {
    let registry = registry_with_echo();
    let reply = registry.execute("nope", "{}").await;
    let parsed: Value = serde_json::from_str(&reply).expect("json reply");
    assert!(parsed["error"].as_str().expect("error").contains("nope"));
}

#[tokio::test]
async fn malformed_arguments_become_empty_object() {
    let registry = registry_with_echo();
    let reply = registry.execute("echo", "{not json").await;
    let parsed: Value = serde_json::from_str(&reply).expect("json reply");
    assert_eq!(parsed, json!({}), "handler receives {{}} for bad arguments");
}

#[tokio::test]
async fn handler_errors_are_captured_not_raised() {
    let registry = registry_with_echo();
    let reply = registry.execute("broken", "{}").await;
    let parsed: Value = serde_json::from_str(&reply).expect("json reply");
    assert!(parsed["error"].as_str().expect("error").contains("kaput"));
}

#[test]
fn definitions_for_returns_requested_subset() {
    let registry = registry_with_echo();
    let defs = registry.definitions_for(&["echo".to_owned(), "missing".to_owned()]);
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].name, "echo");
}

#[test]
fn catalog_is_sorted_by_name() {
    let registry = registry_with_echo();
    let catalog = registry.catalog();
    assert_eq!(catalog.len(), 2);
    assert_eq!(catalog[0]["name"], "broken");
    assert_eq!(catalog[1]["name"], "echo");
}

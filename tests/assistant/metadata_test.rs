//! Assistant metadata parsing and validation tests.

use lectern::assistant::{parse_model_id, validate_name, AssistantMetadata, MODEL_ID_PREFIX};
use lectern::providers::ConnectorKind;

#[test]
fn full_metadata_parses() {
    let metadata = AssistantMetadata::parse(
        r#"{
            "connector": "ollama",
            "llm": "llama3.1",
            "rag_processor": "simple_rag",
            "rag_collections": ["3", "7"],
            "rag_top_k": 8,
            "tools": ["get_weather"],
            "capabilities": {"vision": true, "image_generation": false}
        }"#,
    );
    assert_eq!(metadata.connector, "ollama");
    assert_eq!(metadata.llm.as_deref(), Some("llama3.1"));
    assert_eq!(metadata.rag_collections, vec!["3", "7"]);
    assert_eq!(metadata.rag_top_k, 8);
    assert_eq!(metadata.tools, vec!["get_weather"]);
    assert!(metadata.capabilities.vision);
    assert!(!metadata.capabilities.image_generation);
}

#[test]
fn broken_metadata_degrades_to_defaults() {
    let metadata = AssistantMetadata::parse("{not json at all");
    assert_eq!(metadata.connector, "openai");
    assert_eq!(metadata.rag_top_k, 5);
    assert!(metadata.tools.is_empty());

    let empty = AssistantMetadata::parse("");
    assert_eq!(empty.connector, "openai");
}

#[test]
fn unknown_metadata_keys_ignored() {
    let metadata = AssistantMetadata::parse(r#"{"connector": "openai", "mystery": 42}"#);
    assert_eq!(metadata.connector, "openai");
}

#[test]
fn connector_names_map_to_kinds() {
    assert_eq!(ConnectorKind::parse("openai"), ConnectorKind::OpenAi);
    assert_eq!(ConnectorKind::parse("ollama"), ConnectorKind::Ollama);
    assert_eq!(ConnectorKind::parse("banana"), ConnectorKind::Banana);
    assert_eq!(ConnectorKind::parse("banana_img"), ConnectorKind::Banana);
    assert_eq!(ConnectorKind::parse("google"), ConnectorKind::Banana);
    // Unknown connectors fall back to the OpenAI-compatible one.
    assert_eq!(ConnectorKind::parse("whatever"), ConnectorKind::OpenAi);
}

#[test]
fn names_follow_the_rule() {
    assert!(validate_name("my-assistant_2").is_ok());
    assert!(validate_name("Study_Helper").is_ok());
    assert!(validate_name("").is_err());
    assert!(validate_name("has space").is_err());
    assert!(validate_name("émile").is_err());
    assert!(validate_name("dot.name").is_err());
}

#[test]
fn model_ids_round_trip() {
    assert_eq!(parse_model_id(&format!("{MODEL_ID_PREFIX}42")), Some(42));
    assert_eq!(parse_model_id("lectern_assistant.7"), Some(7));
    assert_eq!(parse_model_id("gpt-4o"), None);
    assert_eq!(parse_model_id("lectern_assistant.x"), None);
}

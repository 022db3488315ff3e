//! Plugin registry and mode-gating tests.

use std::sync::Arc;

use serde_json::json;

use lectern::kb::plugins::markdown::MarkdownPlusIngest;
use lectern::kb::plugins::url::UrlIngest;
use lectern::kb::plugins::youtube::{extract_video_id, parse_timedtext, YoutubeTranscriptIngest};
use lectern::kb::plugins::{mode_from_env, PluginMode, PluginRegistry};

fn env_none(_: &str) -> Option<String> {
    None
}

// -- mode resolution -------------------------------------------------------

#[test]
fn default_mode_is_advanced() {
    assert_eq!(mode_from_env("markitdown_plus_ingest", env_none), PluginMode::Advanced);
}

#[test]
fn modes_parse_from_env() {
    let env = |val: &'static str| move |_: &str| Some(val.to_owned());
    assert_eq!(mode_from_env("p", env("DISABLE")), PluginMode::Disable);
    assert_eq!(mode_from_env("p", env("simplified")), PluginMode::Simplified);
    assert_eq!(mode_from_env("p", env("ADVANCED")), PluginMode::Advanced);
    // Legacy alias.
    assert_eq!(mode_from_env("p", env("ENABLE")), PluginMode::Advanced);
    // Invalid values warn and fall back.
    assert_eq!(mode_from_env("p", env("banana")), PluginMode::Advanced);
}

// -- registration ----------------------------------------------------------

#[test]
fn disabled_plugins_are_not_registered() {
    let mut registry = PluginRegistry::new();
    registry.register_ingest_with_mode(Arc::new(MarkdownPlusIngest::new()), PluginMode::Disable);
    assert!(registry.ingest_plugin("markitdown_plus_ingest").is_none());
    assert!(registry.ingest_catalog().is_empty());
}

#[test]
fn registered_plugins_appear_in_catalog_sorted() {
    let mut registry = PluginRegistry::new();
    registry.register_ingest_with_mode(Arc::new(UrlIngest::new()), PluginMode::Advanced);
    registry.register_ingest_with_mode(Arc::new(MarkdownPlusIngest::new()), PluginMode::Advanced);
    registry
        .register_ingest_with_mode(Arc::new(YoutubeTranscriptIngest::new()), PluginMode::Advanced);

    let catalog = registry.ingest_catalog();
    let names: Vec<&str> = catalog.iter().filter_map(|p| p["name"].as_str()).collect();
    assert_eq!(
        names,
        vec!["markitdown_plus_ingest", "url_ingest", "youtube_transcript_ingest"]
    );
}

// -- simplified gating -----------------------------------------------------

#[test]
fn simplified_catalog_hides_defaulted_params() {
    let mut registry = PluginRegistry::new();
    registry
        .register_ingest_with_mode(Arc::new(MarkdownPlusIngest::new()), PluginMode::Simplified);

    let catalog = registry.ingest_catalog();
    let params = catalog[0]["parameters"].as_object().expect("params object");
    // Everything with a non-null default disappears from the public surface.
    assert!(!params.contains_key("chunk_size"));
    assert!(!params.contains_key("chunking_mode"));
    // Parameters requiring input stay.
    assert!(params.contains_key("description"));
    assert!(params.contains_key("citation"));
}

#[test]
fn simplified_request_params_are_stripped() {
    let mut registry = PluginRegistry::new();
    registry
        .register_ingest_with_mode(Arc::new(MarkdownPlusIngest::new()), PluginMode::Simplified);

    let sanitized = registry.sanitize_ingest_params(
        "markitdown_plus_ingest",
        json!({
            "chunking_mode": "hierarchical",
            "chunk_size": 5000,
            "description": "kept",
        }),
    );
    let map = sanitized.as_object().expect("object");
    assert!(!map.contains_key("chunking_mode"));
    assert!(!map.contains_key("chunk_size"));
    assert_eq!(map["description"], "kept");
}

#[test]
fn simplified_keeps_ingest_essentials() {
    let mut registry = PluginRegistry::new();
    registry.register_ingest_with_mode(Arc::new(UrlIngest::new()), PluginMode::Simplified);

    let sanitized = registry.sanitize_ingest_params(
        "url_ingest",
        json!({
            "urls": ["https://example.test"],
            "chunk_size": 5000,
        }),
    );
    let map = sanitized.as_object().expect("object");
    assert!(map.contains_key("urls"), "essentials always pass");
    assert!(!map.contains_key("chunk_size"));
}

#[test]
fn advanced_mode_passes_everything_through() {
    let mut registry = PluginRegistry::new();
    registry
        .register_ingest_with_mode(Arc::new(MarkdownPlusIngest::new()), PluginMode::Advanced);

    let params = json!({"chunking_mode": "by_page", "chunk_size": 900});
    let sanitized = registry.sanitize_ingest_params("markitdown_plus_ingest", params.clone());
    assert_eq!(sanitized, params);
}

#[test]
fn unknown_plugin_params_pass_unchanged() {
    let registry = PluginRegistry::new();
    let params = json!({"anything": 1});
    assert_eq!(registry.sanitize_ingest_params("ghost", params.clone()), params);
}

// -- youtube helpers -------------------------------------------------------

#[test]
fn video_ids_extracted_from_common_shapes() {
    for url in [
        "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
        "https://youtu.be/dQw4w9WgXcQ",
        "https://www.youtube.com/embed/dQw4w9WgXcQ",
        "dQw4w9WgXcQ",
    ] {
        assert_eq!(extract_video_id(url).as_deref(), Some("dQw4w9WgXcQ"), "url: {url}");
    }
    assert!(extract_video_id("https://example.test/clip").is_none());
}

#[test]
fn timedtext_flattens_to_plain_text() {
    let xml = r#"<transcript>
        <text start="0" dur="2">Hello &amp; welcome</text>
        <text start="2" dur="2">to the &lt;course&gt;</text>
    </transcript>"#;
    assert_eq!(parse_timedtext(xml), "Hello & welcome to the <course>");
    assert_eq!(parse_timedtext("<transcript/>"), "");
}

//! Knowledge-base domain type tests.

use lectern::kb::models::{
    ChunkStats, EmbeddingsConfig, FileStatus, LlmCallStat, StatsTracker,
};

// -- status machine --------------------------------------------------------

#[test]
fn legal_transitions() {
    assert!(FileStatus::Pending.can_transition_to(FileStatus::Processing));
    assert!(FileStatus::Pending.can_transition_to(FileStatus::Cancelled));
    assert!(FileStatus::Processing.can_transition_to(FileStatus::Completed));
    assert!(FileStatus::Processing.can_transition_to(FileStatus::Failed));
    assert!(FileStatus::Processing.can_transition_to(FileStatus::Cancelled));
}

#[test]
fn any_status_may_soft_delete() {
    for status in [
        FileStatus::Pending,
        FileStatus::Processing,
        FileStatus::Completed,
        FileStatus::Failed,
        FileStatus::Cancelled,
    ] {
        assert!(status.can_transition_to(FileStatus::Deleted));
    }
}

#[test]
fn terminal_states_do_not_resume() {
    assert!(!FileStatus::Completed.can_transition_to(FileStatus::Processing));
    assert!(!FileStatus::Failed.can_transition_to(FileStatus::Completed));
    assert!(!FileStatus::Cancelled.can_transition_to(FileStatus::Processing));
    assert!(!FileStatus::Pending.can_transition_to(FileStatus::Completed));
}

#[test]
fn status_round_trips_through_text() {
    for status in [
        FileStatus::Pending,
        FileStatus::Processing,
        FileStatus::Completed,
        FileStatus::Failed,
        FileStatus::Cancelled,
        FileStatus::Deleted,
    ] {
        assert_eq!(FileStatus::parse(status.as_str()), Some(status));
    }
    assert_eq!(FileStatus::parse("bogus"), None);
}

// -- embeddings config -----------------------------------------------------

#[test]
fn legacy_inline_aliases_are_readable() {
    // Old rows used `apikey` / `endpoint` field names.
    let legacy: EmbeddingsConfig = serde_json::from_str(
        r#"{"vendor": "openai", "model": "text-embedding-3-small",
            "apikey": "sk-1", "endpoint": "https://api.openai.com/v1"}"#,
    )
    .expect("legacy config parses");
    assert_eq!(legacy.api_key.as_deref(), Some("sk-1"));
    assert_eq!(legacy.api_endpoint.as_deref(), Some("https://api.openai.com/v1"));
    assert!(legacy.is_openai());
}

#[test]
fn vendor_check_is_case_insensitive() {
    let config = EmbeddingsConfig {
        vendor: "OpenAI".to_owned(),
        ..EmbeddingsConfig::default()
    };
    assert!(config.is_openai());
}

// -- statistics ------------------------------------------------------------

#[test]
fn chunk_stats_aggregate() {
    let stats = ChunkStats::from_chunks(["aa", "bbbb", "cccccc"]);
    assert_eq!(stats.count, 3);
    assert_eq!(stats.min_size, 2);
    assert_eq!(stats.max_size, 6);
    assert!((stats.avg_size - 4.0).abs() < 1e-9);

    let empty = ChunkStats::from_chunks([]);
    assert_eq!(empty.count, 0);
}

#[test]
fn tracker_times_stages_in_order() {
    let mut tracker = StatsTracker::new();
    tracker.start_stage("conversion");
    tracker.end_stage("PDF → Markdown");
    tracker.start_stage("chunking");
    tracker.end_stage("12 chunks");
    tracker.note_stage("warning", "something advisory");

    let stats = tracker.into_stats();
    let stages: Vec<&str> = stats.stage_timings.iter().map(|s| s.stage.as_str()).collect();
    assert_eq!(stages, vec!["conversion", "chunking", "warning"]);
    assert_eq!(stats.stage_timings[2].duration_ms, 0);
    assert!(!stats.stage_timings[0].timestamp.is_empty());
}

#[test]
fn end_stage_without_start_is_ignored() {
    let mut tracker = StatsTracker::new();
    tracker.end_stage("orphan");
    assert!(tracker.into_stats().stage_timings.is_empty());
}

#[test]
fn llm_calls_accumulate_totals() {
    let mut tracker = StatsTracker::new();
    tracker.record_llm_call(LlmCallStat {
        image: "image_001.jpg".to_owned(),
        duration_ms: 1200,
        tokens_used: Some(150),
        success: true,
        error: None,
    });
    tracker.record_llm_call(LlmCallStat {
        image: "image_002.jpg".to_owned(),
        duration_ms: 800,
        tokens_used: None,
        success: false,
        error: Some("timeout".to_owned()),
    });

    let stats = tracker.into_stats();
    assert_eq!(stats.llm_calls.len(), 2);
    assert_eq!(stats.total_llm_duration_ms, 2000);
    assert_eq!(stats.images_with_llm_descriptions, 1, "failures do not count");
}

#[test]
fn markdown_preview_capped_at_2000_chars() {
    let mut tracker = StatsTracker::new();
    tracker.set_markdown_preview(&"x".repeat(5000));
    assert_eq!(tracker.into_stats().markdown_preview.chars().count(), 2000);
}

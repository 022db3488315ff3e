//! Knowledge-base store tests: collections (dual mode), the file registry
//! state machine, and failure capture.

use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;

use lectern::kb::models::{EmbeddingsConfig, EmbeddingsSetup, FileStatus, ProcessingStats, Visibility};
use lectern::kb::store::{EmbeddingsChoice, KbStore};
use lectern::kb::KbError;

async fn store() -> KbStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    lectern::db::init_kb_schema(&pool).await.expect("schema");
    KbStore::new(pool)
}

fn inline_config() -> EmbeddingsConfig {
    EmbeddingsConfig {
        vendor: "ollama".to_owned(),
        model: "nomic-embed-text".to_owned(),
        api_key: None,
        api_endpoint: None,
    }
}

async fn seed_collection(store: &KbStore) -> i64 {
    store
        .create_collection(
            "docs",
            Some("test collection"),
            "amy@acme.test",
            Visibility::Private,
            &EmbeddingsChoice::Inline(inline_config()),
            768,
            "uuid-docs",
        )
        .await
        .expect("create collection")
}

async fn seed_file(store: &KbStore, collection: i64) -> i64 {
    store
        .insert_file(
            collection,
            "amy@acme.test",
            "notes.md",
            "/static/amy/docs/abc.md",
            "http://localhost/static/amy/docs/abc.md",
            42,
            Some("text/markdown"),
            "markitdown_plus_ingest",
            &json!({"chunking_mode": "standard"}),
        )
        .await
        .expect("insert file")
}

// -- collections -----------------------------------------------------------

#[tokio::test]
async fn collection_name_unique_per_owner() {
    let store = store().await;
    seed_collection(&store).await;

    let duplicate = store
        .create_collection(
            "docs",
            None,
            "amy@acme.test",
            Visibility::Private,
            &EmbeddingsChoice::Inline(inline_config()),
            768,
            "uuid-other",
        )
        .await;
    assert!(matches!(duplicate, Err(KbError::Validation(_))));
}

#[tokio::test]
async fn setup_reference_wins_over_inline() {
    let store = store().await;
    let setup_id = store
        .create_setup(&EmbeddingsSetup {
            id: 0,
            name: "default-openai".to_owned(),
            vendor: "openai".to_owned(),
            model: "text-embedding-3-small".to_owned(),
            api_key: Some("sk-setup".to_owned()),
            api_endpoint: None,
            dimensions: 1536,
        })
        .await
        .expect("create setup");

    let id = store
        .create_collection(
            "current",
            None,
            "amy@acme.test",
            Visibility::Private,
            &EmbeddingsChoice::Setup(setup_id),
            1536,
            "uuid-current",
        )
        .await
        .expect("create");

    let collection = store.collection_by_id(id).await.expect("fetch");
    let effective = store.effective_embeddings(&collection).await.expect("resolve");
    assert_eq!(effective.vendor, "openai");
    assert_eq!(effective.api_key.as_deref(), Some("sk-setup"));
}

#[tokio::test]
async fn legacy_inline_collections_stay_readable() {
    let store = store().await;
    let id = seed_collection(&store).await;

    let collection = store.collection_by_id(id).await.expect("fetch");
    assert!(collection.embeddings_setup_id.is_none());
    let effective = store.effective_embeddings(&collection).await.expect("resolve");
    assert_eq!(effective.vendor, "ollama");
    assert_eq!(effective.model, "nomic-embed-text");
}

#[tokio::test]
async fn bulk_rekey_touches_matching_vendor_only() {
    let store = store().await;
    let openai_inline = EmbeddingsConfig {
        vendor: "openai".to_owned(),
        model: "text-embedding-3-small".to_owned(),
        api_key: Some("sk-old".to_owned()),
        api_endpoint: None,
    };
    store
        .create_collection(
            "a",
            None,
            "amy@acme.test",
            Visibility::Private,
            &EmbeddingsChoice::Inline(openai_inline),
            1536,
            "uuid-a",
        )
        .await
        .expect("openai collection");
    let ollama_id = seed_collection(&store).await;

    let touched = store
        .bulk_update_embeddings_api_key("amy@acme.test", "openai", "sk-new")
        .await
        .expect("rekey");
    assert_eq!(touched, 1);

    let ollama = store.collection_by_id(ollama_id).await.expect("fetch");
    let effective = store.effective_embeddings(&ollama).await.expect("resolve");
    assert!(effective.api_key.is_none(), "other vendors untouched");
}

// -- file registry ---------------------------------------------------------

#[tokio::test]
async fn job_rows_start_processing() {
    let store = store().await;
    let collection = seed_collection(&store).await;
    let file = seed_file(&store, collection).await;

    let entry = store.file_by_id(file).await.expect("fetch");
    assert_eq!(entry.status, FileStatus::Processing);
    assert_eq!(entry.document_count, 0);
    assert!(entry.processing_started_at.is_none());

    let job = entry.to_job_json();
    assert_eq!(job["job_id"], job["id"]);
    assert_eq!(job["progress"]["percentage"], 0.0);
}

#[tokio::test]
async fn lifecycle_timestamps_are_monotonic() {
    let store = store().await;
    let collection = seed_collection(&store).await;
    let file = seed_file(&store, collection).await;

    store.mark_processing_started(file).await.expect("start");
    store
        .mark_completed(file, 7, "Completed: 7 chunks")
        .await
        .expect("complete");

    let entry = store.file_by_id(file).await.expect("fetch");
    assert_eq!(entry.status, FileStatus::Completed);
    assert_eq!(entry.document_count, 7);

    let created = entry.created_at.clone();
    let started = entry.processing_started_at.expect("started");
    let completed = entry.processing_completed_at.expect("completed");
    assert!(created <= started, "created_at ≤ processing_started_at");
    assert!(started <= completed, "processing_started_at ≤ processing_completed_at");
}

#[tokio::test]
async fn illegal_transitions_rejected() {
    let store = store().await;
    let collection = seed_collection(&store).await;
    let file = seed_file(&store, collection).await;

    store
        .set_status(file, FileStatus::Cancelled)
        .await
        .expect("processing → cancelled is legal");

    let resume = store.set_status(file, FileStatus::Processing).await;
    assert!(matches!(resume, Err(KbError::Validation(_))));

    // Soft delete is reachable from anywhere.
    store
        .set_status(file, FileStatus::Deleted)
        .await
        .expect("any → deleted");
}

#[tokio::test]
async fn cancelled_jobs_reject_progress_and_stats_writes() {
    let store = store().await;
    let collection = seed_collection(&store).await;
    let file = seed_file(&store, collection).await;

    store.update_progress(file, 1, 5, "working").await.expect("progress");
    store.set_status(file, FileStatus::Cancelled).await.expect("cancel");

    // Writes after cancellation are silently dropped.
    store.update_progress(file, 4, 5, "late").await.expect("no-op");
    store
        .update_stats(file, &ProcessingStats::default())
        .await
        .expect("no-op");

    let entry = store.file_by_id(file).await.expect("fetch");
    assert_eq!(entry.progress_current, 1);
    assert_eq!(entry.progress_message.as_deref(), Some("working"));
    assert!(entry.processing_stats.is_none());
}

#[tokio::test]
async fn failure_capture_truncates_and_tags() {
    let store = store().await;
    let collection = seed_collection(&store).await;
    let file = seed_file(&store, collection).await;

    let long_message = "E".repeat(800);
    let long_trace = "T".repeat(5000);
    store
        .mark_failed(
            file,
            &long_message,
            "PdfError",
            &long_trace,
            "/static/amy/docs/abc.md",
            "markitdown_plus_ingest",
            "conversion",
        )
        .await
        .expect("capture");

    let entry = store.file_by_id(file).await.expect("fetch");
    assert_eq!(entry.status, FileStatus::Failed);
    assert_eq!(entry.error_message.as_deref().map(str::len), Some(500));

    let details = entry.error_details.expect("details");
    assert_eq!(details["exception_type"], "PdfError");
    assert_eq!(details["stage"], "conversion");
    assert_eq!(details["plugin_name"], "markitdown_plus_ingest");
    assert_eq!(details["traceback"].as_str().map(str::len), Some(2000));

    let progress = entry.progress_message.expect("progress message");
    assert!(progress.starts_with("Failed: "));
    assert_eq!(progress.len(), "Failed: ".len() + 100);
    assert!(entry.processing_completed_at.is_some());
}

#[tokio::test]
async fn progress_snapshots_accumulate() {
    let store = store().await;
    let collection = seed_collection(&store).await;
    let file = seed_file(&store, collection).await;

    store.update_progress(file, 2, 5, "chunking…").await.expect("write");
    let entry = store.file_by_id(file).await.expect("fetch");
    assert_eq!(entry.progress_current, 2);
    assert_eq!(entry.progress_total, 5);
    assert!((entry.progress_percentage() - 40.0).abs() < f64::EPSILON);
}

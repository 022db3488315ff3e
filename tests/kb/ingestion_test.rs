//! Ingestion engine tests: job creation and cooperative cancellation.
//!
//! The vector store points at an unroutable address, so any attempted
//! upsert would mark the job failed — a job that stays `cancelled` after
//! the worker ran proves no vector-store write happened.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

use lectern::kb::ingestion::IngestionService;
use lectern::kb::models::{DocumentChunk, EmbeddingsConfig, FileStatus, Visibility};
use lectern::kb::plugins::{
    IngestContext, IngestError, IngestPlugin, IngestSource, ParamSpec, PluginMode, PluginRegistry,
};
use lectern::kb::store::{EmbeddingsChoice, KbStore};
use lectern::kb::vector::VectorStore;
use lectern::kb::KbError;
use lectern::providers::pool::ClientPool;

/// Test plugin producing two fixed chunks, optionally cancelling its own
/// job mid-flight to exercise the worker checkpoints.
struct FixedChunks {
    cancel_during_run: Option<(KbStore, i64)>,
}

#[async_trait::async_trait]
impl IngestPlugin for FixedChunks {
    fn name(&self) -> &'static str {
        "fixed_chunks"
    }
    fn kind(&self) -> &'static str {
        "file-ingest"
    }
    fn description(&self) -> &'static str {
        "test plugin"
    }
    fn supported_file_types(&self) -> &'static [&'static str] {
        &["txt"]
    }
    fn parameters(&self) -> BTreeMap<&'static str, ParamSpec> {
        BTreeMap::new()
    }

    async fn ingest(
        &self,
        _source: &IngestSource,
        _params: &Value,
        ctx: &IngestContext,
    ) -> Result<Vec<DocumentChunk>, IngestError> {
        ctx.report_progress(1, 2, "halfway").await;
        if let Some((store, file_id)) = &self.cancel_during_run {
            store
                .set_status(*file_id, FileStatus::Cancelled)
                .await
                .expect("cancel from plugin");
        }
        Ok(vec![
            DocumentChunk {
                text: "alpha".to_owned(),
                metadata: json!({"chunk_index": 0, "chunk_count": 2}),
            },
            DocumentChunk {
                text: "beta".to_owned(),
                metadata: json!({"chunk_index": 1, "chunk_count": 2}),
            },
        ])
    }
}

struct Fixture {
    service: IngestionService,
    store: KbStore,
    _tmp: TempDir,
}

async fn fixture(plugin: Arc<dyn IngestPlugin>) -> Fixture {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("pool");
    lectern::db::init_kb_schema(&pool).await.expect("schema");
    let store = KbStore::new(pool);

    let mut registry = PluginRegistry::new();
    registry.register_ingest_with_mode(plugin, PluginMode::Advanced);

    let clients = Arc::new(ClientPool::new(2, std::time::Duration::from_secs(1)));
    // Unroutable: any vector-store call fails fast.
    let vector = VectorStore::new(Arc::clone(&clients), "http://127.0.0.1:1".to_owned());
    let tmp = TempDir::new().expect("tempdir");

    let service = IngestionService::new(
        store.clone(),
        Arc::new(registry),
        vector,
        clients,
        tmp.path().to_path_buf(),
        "http://localhost:9099".to_owned(),
    );
    Fixture {
        service,
        store,
        _tmp: tmp,
    }
}

async fn seed_collection(store: &KbStore) -> i64 {
    store
        .create_collection(
            "docs",
            None,
            "amy@acme.test",
            Visibility::Private,
            &EmbeddingsChoice::Inline(EmbeddingsConfig {
                vendor: "ollama".to_owned(),
                model: "nomic-embed-text".to_owned(),
                api_key: None,
                api_endpoint: Some("http://127.0.0.1:1".to_owned()),
            }),
            768,
            "uuid-docs",
        )
        .await
        .expect("collection")
}

#[tokio::test]
async fn unknown_plugin_rejected_synchronously() {
    let fx = fixture(Arc::new(FixedChunks {
        cancel_during_run: None,
    }))
    .await;
    let collection = seed_collection(&fx.store).await;

    let result = fx
        .service
        .create_url_job(collection, vec!["https://x.test".to_owned()], "ghost", json!({}))
        .await;
    assert!(matches!(result, Err(KbError::UnknownPlugin(_))));
}

#[tokio::test]
async fn missing_collection_rejected_synchronously() {
    let fx = fixture(Arc::new(FixedChunks {
        cancel_during_run: None,
    }))
    .await;
    let result = fx
        .service
        .create_file_job(999, "a.txt", b"x", None, "fixed_chunks", json!({}))
        .await;
    assert!(matches!(result, Err(KbError::NotFound { .. })));
}

#[tokio::test]
async fn file_job_persists_upload_and_returns_processing() {
    let fx = fixture(Arc::new(FixedChunks {
        cancel_during_run: None,
    }))
    .await;
    let collection = seed_collection(&fx.store).await;

    let file_id = fx
        .service
        .create_file_job(
            collection,
            "notes.txt",
            b"some text",
            Some("text/plain"),
            "fixed_chunks",
            json!({}),
        )
        .await
        .expect("job created");

    let entry = fx.store.file_by_id(file_id).await.expect("row");
    assert_eq!(entry.original_filename, "notes.txt");
    assert_eq!(entry.plugin_name, "fixed_chunks");
    assert!(entry.file_path.ends_with(".txt"));
    assert!(
        std::path::Path::new(&entry.file_path).exists(),
        "upload persisted under the static tree"
    );
    assert!(entry.file_path.contains("amy@acme.test"));
    assert!(entry.file_path.contains("docs"));
}

#[tokio::test]
async fn cancellation_before_worker_start_is_honoured() {
    let fx = fixture(Arc::new(FixedChunks {
        cancel_during_run: None,
    }))
    .await;
    let collection_id = seed_collection(&fx.store).await;
    let collection = fx.store.collection_by_id(collection_id).await.expect("fetch");

    // Insert the row directly (no spawned worker), cancel it, then drive
    // the worker by hand.
    let file_id = fx
        .store
        .insert_file(
            collection_id,
            "amy@acme.test",
            "a.txt",
            "/tmp/a.txt",
            "",
            1,
            None,
            "fixed_chunks",
            &json!({}),
        )
        .await
        .expect("insert");
    fx.store
        .set_status(file_id, FileStatus::Cancelled)
        .await
        .expect("cancel");

    fx.service
        .run_worker(
            file_id,
            IngestSource::File {
                path: "/tmp/a.txt".into(),
            },
            "fixed_chunks".to_owned(),
            json!({}),
            collection,
        )
        .await;

    let entry = fx.store.file_by_id(file_id).await.expect("row");
    assert_eq!(entry.status, FileStatus::Cancelled, "worker must not resurrect the job");
    assert!(entry.error_message.is_none(), "no vector write was attempted");
    assert_eq!(entry.document_count, 0);
    assert!(entry.processing_started_at.is_none());
}

#[tokio::test]
async fn cancellation_mid_processing_discards_output() {
    // The plugin cancels its own job, simulating a user cancelling while
    // the plugin runs; the worker's post-plugin checkpoint must discard
    // the chunks without touching the vector store.
    let pool_fixture = fixture(Arc::new(FixedChunks {
        cancel_during_run: None,
    }))
    .await;
    let collection_id = seed_collection(&pool_fixture.store).await;
    let collection = pool_fixture
        .store
        .collection_by_id(collection_id)
        .await
        .expect("fetch");

    let file_id = pool_fixture
        .store
        .insert_file(
            collection_id,
            "amy@acme.test",
            "a.txt",
            "/tmp/a.txt",
            "",
            1,
            None,
            "fixed_chunks",
            &json!({}),
        )
        .await
        .expect("insert");

    // Rebuild the service with a plugin that cancels this specific job.
    let mut registry = PluginRegistry::new();
    registry.register_ingest_with_mode(
        Arc::new(FixedChunks {
            cancel_during_run: Some((pool_fixture.store.clone(), file_id)),
        }),
        PluginMode::Advanced,
    );
    let clients = Arc::new(ClientPool::new(2, std::time::Duration::from_secs(1)));
    let service = IngestionService::new(
        pool_fixture.store.clone(),
        Arc::new(registry),
        VectorStore::new(Arc::clone(&clients), "http://127.0.0.1:1".to_owned()),
        clients,
        std::env::temp_dir(),
        "http://localhost:9099".to_owned(),
    );

    service
        .run_worker(
            file_id,
            IngestSource::File {
                path: "/tmp/a.txt".into(),
            },
            "fixed_chunks".to_owned(),
            json!({}),
            collection,
        )
        .await;

    let entry = pool_fixture.store.file_by_id(file_id).await.expect("row");
    assert_eq!(entry.status, FileStatus::Cancelled);
    assert_eq!(entry.document_count, 0, "plugin output discarded");
    assert!(entry.error_message.is_none(), "no failed vector write recorded");
}

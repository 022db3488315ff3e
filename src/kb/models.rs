//! Knowledge-base domain types.
//!
//! Collections are DUAL MODE: a collection either references a shared
//! embeddings setup (current mode) or carries an inline embeddings config
//! (legacy mode). The effective configuration resolver prefers the setup
//! reference so legacy rows stay readable without migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// Collection visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Visible to the owner only.
    Private,
    /// Visible to every tenant user.
    Public,
}

impl Visibility {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Public => "public",
        }
    }

    /// Parse from a SQLite text value; unknown values default to private.
    pub fn parse(s: &str) -> Self {
        match s {
            "public" => Self::Public,
            _ => Self::Private,
        }
    }
}

/// A shared embeddings setup row (current mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsSetup {
    /// Row id.
    pub id: i64,
    /// Unique setup name.
    pub name: String,
    /// Embedding vendor (`openai`, `ollama`).
    pub vendor: String,
    /// Model identifier.
    pub model: String,
    /// API key, when the vendor needs one.
    pub api_key: Option<String>,
    /// Endpoint override.
    pub api_endpoint: Option<String>,
    /// Vector dimensionality.
    pub dimensions: i64,
}

/// Effective embeddings configuration for a collection.
///
/// Either resolved from a setup reference or parsed from the legacy inline
/// JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// Embedding vendor (`openai`, `ollama`).
    pub vendor: String,
    /// Model identifier.
    pub model: String,
    /// API key, when the vendor needs one.
    #[serde(alias = "apikey")]
    pub api_key: Option<String>,
    /// Endpoint override.
    #[serde(alias = "endpoint")]
    pub api_endpoint: Option<String>,
}

impl EmbeddingsConfig {
    /// Whether the vendor is OpenAI (controls the ingestion privacy gate).
    pub fn is_openai(&self) -> bool {
        self.vendor.eq_ignore_ascii_case("openai")
    }
}

impl From<&EmbeddingsSetup> for EmbeddingsConfig {
    fn from(setup: &EmbeddingsSetup) -> Self {
        Self {
            vendor: setup.vendor.clone(),
            model: setup.model.clone(),
            api_key: setup.api_key.clone(),
            api_endpoint: setup.api_endpoint.clone(),
        }
    }
}

/// A knowledge-base collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    /// Row id.
    pub id: i64,
    /// Name, unique per owner.
    pub name: String,
    /// Human description.
    pub description: Option<String>,
    /// Owner identifier.
    pub owner: String,
    /// Visibility.
    pub visibility: Visibility,
    /// Setup reference (current mode).
    pub embeddings_setup_id: Option<i64>,
    /// Inline config (legacy mode).
    pub inline_embeddings: Option<EmbeddingsConfig>,
    /// Dimensionality locked at creation. Upserts with a different
    /// dimension are rejected.
    pub embedding_dimensions: i64,
    /// Vector-store collection UUID.
    pub vector_store_uuid: Option<String>,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// File registry / ingestion jobs
// ---------------------------------------------------------------------------

/// Status of a file registry entry / ingestion job.
///
/// Transitions: `pending → processing → {completed|failed|cancelled}`;
/// any status may move to `deleted` (soft delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Job created, not yet started.
    Pending,
    /// Worker is running.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with a captured error.
    Failed,
    /// Cancelled cooperatively.
    Cancelled,
    /// Soft-deleted.
    Deleted,
}

impl FileStatus {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Deleted => "deleted",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `next` respects the state
    /// machine.
    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        if next == Self::Deleted {
            return true;
        }
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Cancelled)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Cancelled)
        )
    }
}

/// A file registry entry, serving dually as file record and job tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Row id, also the job id.
    pub id: i64,
    /// Parent collection.
    pub collection_id: i64,
    /// Owner identifier.
    pub owner: String,
    /// Original upload filename.
    pub original_filename: String,
    /// Server-side stored path.
    pub file_path: String,
    /// Public URL of the stored file.
    pub file_url: String,
    /// Size in bytes.
    pub file_size: i64,
    /// MIME type, when known.
    pub content_type: Option<String>,
    /// Ingestion plugin name.
    pub plugin_name: String,
    /// Plugin parameters (opaque map).
    pub plugin_params: Value,
    /// Job status.
    pub status: FileStatus,
    /// Chunks produced by the last successful run.
    pub document_count: i64,
    /// Creation timestamp.
    pub created_at: String,
    /// Last modification timestamp.
    pub updated_at: String,
    /// When processing began.
    pub processing_started_at: Option<String>,
    /// When processing finished (success or failure).
    pub processing_completed_at: Option<String>,
    /// Progress numerator.
    pub progress_current: i64,
    /// Progress denominator.
    pub progress_total: i64,
    /// Human-readable progress message.
    pub progress_message: Option<String>,
    /// Short error message (≤ 500 chars).
    pub error_message: Option<String>,
    /// Structured error details.
    pub error_details: Option<Value>,
    /// Per-stage processing statistics.
    pub processing_stats: Option<Value>,
}

impl FileEntry {
    /// Progress percentage in `[0, 100]`.
    pub fn progress_percentage(&self) -> f64 {
        if self.progress_total > 0 {
            ((self.progress_current as f64 / self.progress_total as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        }
    }

    /// Job-shaped JSON representation (`job_id` alias + nested progress).
    pub fn to_job_json(&self) -> Value {
        json!({
            "id": self.id,
            "job_id": self.id,
            "collection_id": self.collection_id,
            "owner": self.owner,
            "original_filename": self.original_filename,
            "file_path": self.file_path,
            "file_url": self.file_url,
            "file_size": self.file_size,
            "content_type": self.content_type,
            "plugin_name": self.plugin_name,
            "plugin_params": self.plugin_params,
            "status": self.status.as_str(),
            "document_count": self.document_count,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
            "processing_started_at": self.processing_started_at,
            "processing_completed_at": self.processing_completed_at,
            "progress": {
                "current": self.progress_current,
                "total": self.progress_total,
                "percentage": self.progress_percentage(),
                "message": self.progress_message,
            },
            "error_message": self.error_message,
            "error_details": self.error_details,
            "processing_stats": self.processing_stats,
        })
    }
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// One document chunk produced by an ingestion plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// Chunk text (this is what gets embedded).
    pub text: String,
    /// Chunk metadata (`chunk_index`, `chunk_count`, `source`, `filename`,
    /// plugin-specific fields).
    pub metadata: Value,
}

// ---------------------------------------------------------------------------
// Processing statistics
// ---------------------------------------------------------------------------

/// One tracked LLM call during ingestion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmCallStat {
    /// Image the call described.
    pub image: String,
    /// Wall-clock duration.
    pub duration_ms: i64,
    /// Tokens consumed, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<i64>,
    /// Whether the call succeeded.
    pub success: bool,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate chunk statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkStats {
    /// Number of chunks.
    pub count: usize,
    /// Mean chunk size in characters.
    pub avg_size: f64,
    /// Smallest chunk.
    pub min_size: usize,
    /// Largest chunk.
    pub max_size: usize,
}

impl ChunkStats {
    /// Compute stats over chunk texts.
    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a str>) -> Self {
        let sizes: Vec<usize> = chunks.into_iter().map(str::len).collect();
        if sizes.is_empty() {
            return Self::default();
        }
        let total: usize = sizes.iter().sum();
        Self {
            count: sizes.len(),
            avg_size: (total as f64 / sizes.len() as f64 * 100.0).round() / 100.0,
            min_size: sizes.iter().copied().min().unwrap_or(0),
            max_size: sizes.iter().copied().max().unwrap_or(0),
        }
    }
}

/// One timed processing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    /// Stage label (`conversion`, `chunking`, `embedding`, `warning`, …).
    pub stage: String,
    /// Wall-clock duration.
    pub duration_ms: i64,
    /// Human-readable outcome.
    pub message: String,
    /// When the stage ended (RFC 3339).
    pub timestamp: String,
}

/// URLs of per-document derivatives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputFiles {
    /// Converted markdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown_url: Option<String>,
    /// Extracted-images folder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images_folder_url: Option<String>,
    /// Original upload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_file_url: Option<String>,
}

/// Plugin-agnostic processing statistics persisted on the job row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingStats {
    /// Total characters processed.
    pub content_length: usize,
    /// Images extracted from the document.
    pub images_extracted: usize,
    /// Images that received LLM descriptions.
    pub images_with_llm_descriptions: usize,
    /// Individual LLM calls.
    pub llm_calls: Vec<LlmCallStat>,
    /// Total LLM time.
    pub total_llm_duration_ms: i64,
    /// Chunking strategy applied.
    pub chunking_strategy: String,
    /// Aggregate chunk statistics.
    pub chunk_stats: ChunkStats,
    /// Per-stage timings, in completion order.
    pub stage_timings: Vec<StageTiming>,
    /// Derivative file URLs.
    pub output_files: OutputFiles,
    /// First ~2000 characters of the converted markdown.
    pub markdown_preview: String,
}

/// Maximum length of the markdown preview.
const MARKDOWN_PREVIEW_CHARS: usize = 2000;

/// Incrementally builds [`ProcessingStats`] while a plugin runs.
#[derive(Debug, Default)]
pub struct StatsTracker {
    stats: ProcessingStats,
    stage_started: Option<(String, DateTime<Utc>)>,
}

impl StatsTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin timing a stage.
    pub fn start_stage(&mut self, name: &str) {
        self.stage_started = Some((name.to_owned(), Utc::now()));
    }

    /// Finish the current stage with an outcome message.
    pub fn end_stage(&mut self, message: &str) {
        let Some((stage, started)) = self.stage_started.take() else {
            return;
        };
        let now = Utc::now();
        self.stats.stage_timings.push(StageTiming {
            stage,
            duration_ms: (now - started).num_milliseconds(),
            message: message.to_owned(),
            timestamp: now.to_rfc3339(),
        });
    }

    /// Record an untimed informational stage (warnings, privacy notices).
    pub fn note_stage(&mut self, stage: &str, message: &str) {
        self.stats.stage_timings.push(StageTiming {
            stage: stage.to_owned(),
            duration_ms: 0,
            message: message.to_owned(),
            timestamp: Utc::now().to_rfc3339(),
        });
    }

    /// Record one LLM description call.
    pub fn record_llm_call(&mut self, call: LlmCallStat) {
        self.stats.total_llm_duration_ms += call.duration_ms;
        if call.success {
            self.stats.images_with_llm_descriptions += 1;
        }
        self.stats.llm_calls.push(call);
    }

    /// Compute and store chunk statistics.
    pub fn set_chunk_stats<'a>(&mut self, chunks: impl IntoIterator<Item = &'a str>) {
        self.stats.chunk_stats = ChunkStats::from_chunks(chunks);
    }

    /// Store the markdown preview, truncated to the cap.
    pub fn set_markdown_preview(&mut self, content: &str) {
        self.stats.markdown_preview = content.chars().take(MARKDOWN_PREVIEW_CHARS).collect();
    }

    /// Mutable access to the stats under construction.
    pub fn stats_mut(&mut self) -> &mut ProcessingStats {
        &mut self.stats
    }

    /// Snapshot of the current stats (for interim callback reports).
    pub fn snapshot(&self) -> ProcessingStats {
        self.stats.clone()
    }

    /// Finish and take the stats.
    pub fn into_stats(self) -> ProcessingStats {
        self.stats
    }
}

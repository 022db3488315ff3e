//! Document ingestion plugin with markdown conversion, image handling, and
//! all four chunking strategies.
//!
//! Handles PDFs natively (per-page text extraction plus embedded JPEG
//! images, skipping decorative images under ~1 KB), converts HTML to
//! markdown, and passes markdown/plain text through. Image descriptions may
//! be produced by a vision LLM only under the privacy contract: the request
//! asked for `llm` mode *and* the collection's embedding vendor is OpenAI
//! *and* a key is present; anything else downgrades to `basic` with a
//! visible stage note.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::kb::chunking::{
    split_by_page, split_by_section, split_hierarchical, split_standard, HierarchicalParams,
    SplitterKind, StandardParams,
};
use crate::kb::models::{DocumentChunk, LlmCallStat, StatsTracker};

use super::{IngestContext, IngestError, IngestPlugin, IngestSource, ParamSpec};

/// Images smaller than this are treated as decorative noise.
const MIN_IMAGE_BYTES: usize = 1024;

/// Vision model used for LLM image descriptions.
const DESCRIPTION_MODEL: &str = "gpt-4o-mini";

/// Markdown/document ingestion plugin.
#[derive(Debug, Default)]
pub struct MarkdownPlusIngest;

impl MarkdownPlusIngest {
    /// Create the plugin.
    pub fn new() -> Self {
        Self
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Validated parameter bundle.
#[derive(Debug, Clone)]
struct Params {
    image_descriptions: String,
    chunking_mode: String,
    standard: StandardParams,
    pages_per_chunk: usize,
    split_on_heading: usize,
    headings_per_chunk: usize,
    hierarchical: HierarchicalParams,
    description: Option<String>,
    citation: Option<String>,
    file_url: String,
}

fn parse_params(params: &Value) -> Params {
    let get_usize = |key: &str, default: usize| {
        params
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(default)
    };
    let get_bool = |key: &str, default: bool| {
        params.get(key).and_then(Value::as_bool).unwrap_or(default)
    };
    let get_str = |key: &str| {
        params
            .get(key)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    };

    Params {
        image_descriptions: get_str("image_descriptions").unwrap_or_else(|| "none".to_owned()),
        chunking_mode: get_str("chunking_mode").unwrap_or_else(|| "standard".to_owned()),
        standard: StandardParams {
            chunk_size: get_usize("chunk_size", 1000),
            chunk_overlap: get_usize("chunk_overlap", 200),
            splitter: SplitterKind::parse(&get_str("splitter_type").unwrap_or_default()),
        },
        pages_per_chunk: get_usize("pages_per_chunk", 1),
        split_on_heading: get_usize("split_on_heading", 2).clamp(1, 6),
        headings_per_chunk: get_usize("headings_per_chunk", 1),
        hierarchical: HierarchicalParams {
            parent_chunk_size: get_usize("parent_chunk_size", 2000),
            child_chunk_size: get_usize("child_chunk_size", 400),
            child_chunk_overlap: get_usize("child_chunk_overlap", 50),
            split_by_headers: get_bool("split_by_headers", true),
            include_outline: get_bool("include_outline", false),
        },
        description: get_str("description"),
        citation: get_str("citation"),
        file_url: get_str("file_url").unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Plugin impl
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl IngestPlugin for MarkdownPlusIngest {
    fn name(&self) -> &'static str {
        "markitdown_plus_ingest"
    }

    fn kind(&self) -> &'static str {
        "file-ingest"
    }

    fn description(&self) -> &'static str {
        "Convert documents to markdown with image extraction, optional LLM image \
         descriptions, and selectable chunking strategies"
    }

    fn supported_file_types(&self) -> &'static [&'static str] {
        &["pdf", "md", "markdown", "txt", "html", "htm"]
    }

    fn parameters(&self) -> BTreeMap<&'static str, ParamSpec> {
        BTreeMap::from([
            (
                "image_descriptions",
                ParamSpec {
                    kind: "string",
                    description: "Image handling: none, basic (filename-derived), or llm (vision model)",
                    default: json!("none"),
                    required: false,
                    options: Some(vec!["none", "basic", "llm"]),
                },
            ),
            (
                "chunking_mode",
                ParamSpec {
                    kind: "string",
                    description: "Chunking strategy",
                    default: json!("standard"),
                    required: false,
                    options: Some(vec!["standard", "by_page", "by_section", "hierarchical"]),
                },
            ),
            (
                "chunk_size",
                ParamSpec {
                    kind: "integer",
                    description: "Standard mode: target chunk size in characters",
                    default: json!(1000),
                    required: false,
                    options: None,
                },
            ),
            (
                "chunk_overlap",
                ParamSpec {
                    kind: "integer",
                    description: "Standard mode: overlap between chunks",
                    default: json!(200),
                    required: false,
                    options: None,
                },
            ),
            (
                "splitter_type",
                ParamSpec {
                    kind: "string",
                    description: "Standard mode: splitter family",
                    default: json!("recursive"),
                    required: false,
                    options: Some(vec!["recursive", "character", "token"]),
                },
            ),
            (
                "pages_per_chunk",
                ParamSpec {
                    kind: "integer",
                    description: "By-page mode: pages grouped per chunk",
                    default: json!(1),
                    required: false,
                    options: None,
                },
            ),
            (
                "split_on_heading",
                ParamSpec {
                    kind: "integer",
                    description: "By-section mode: heading level to split on (1-6)",
                    default: json!(2),
                    required: false,
                    options: None,
                },
            ),
            (
                "headings_per_chunk",
                ParamSpec {
                    kind: "integer",
                    description: "By-section mode: sections grouped per chunk",
                    default: json!(1),
                    required: false,
                    options: None,
                },
            ),
            (
                "parent_chunk_size",
                ParamSpec {
                    kind: "integer",
                    description: "Hierarchical mode: parent chunk size",
                    default: json!(2000),
                    required: false,
                    options: None,
                },
            ),
            (
                "child_chunk_size",
                ParamSpec {
                    kind: "integer",
                    description: "Hierarchical mode: child chunk size",
                    default: json!(400),
                    required: false,
                    options: None,
                },
            ),
            (
                "child_chunk_overlap",
                ParamSpec {
                    kind: "integer",
                    description: "Hierarchical mode: overlap between sibling children",
                    default: json!(50),
                    required: false,
                    options: None,
                },
            ),
            (
                "split_by_headers",
                ParamSpec {
                    kind: "boolean",
                    description: "Hierarchical mode: split parents at markdown headers",
                    default: json!(true),
                    required: false,
                    options: None,
                },
            ),
            (
                "include_outline",
                ParamSpec {
                    kind: "boolean",
                    description: "Hierarchical mode: append a document outline",
                    default: json!(false),
                    required: false,
                    options: None,
                },
            ),
            (
                "description",
                ParamSpec {
                    kind: "string",
                    description: "Free-form document description stored in chunk metadata",
                    default: Value::Null,
                    required: false,
                    options: None,
                },
            ),
            (
                "citation",
                ParamSpec {
                    kind: "string",
                    description: "Citation stored in chunk metadata",
                    default: Value::Null,
                    required: false,
                    options: None,
                },
            ),
        ])
    }

    async fn ingest(
        &self,
        source: &IngestSource,
        raw_params: &Value,
        ctx: &IngestContext,
    ) -> Result<Vec<DocumentChunk>, IngestError> {
        let IngestSource::File { path } = source else {
            return Err(IngestError::at(
                "validation",
                "ValueError",
                "this plugin ingests stored files",
            ));
        };

        let mut params = parse_params(raw_params);
        let tracker = Arc::new(Mutex::new(StatsTracker::new()));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        // Privacy downgrade: llm mode without a usable key becomes basic.
        if params.image_descriptions == "llm" && ctx.openai_api_key.is_none() {
            warn!("llm image descriptions requested without an OpenAI collection, downgrading to basic");
            params.image_descriptions = "basic".to_owned();
            tracker.lock().await.note_stage(
                "warning",
                "⚠️ Collection does not use OpenAI - using basic image descriptions \
                 (images still extracted)",
            );
        }

        // === Stage 1+2: conversion & image extraction ===
        ctx.report_progress(0, 5, format!("Converting {file_name}…")).await;
        let (content, image_files) = {
            let mut guard = tracker.lock().await;
            guard.start_stage(if extension == "pdf" {
                "pdf_extraction"
            } else {
                "conversion"
            });
            drop(guard);

            let converted = convert_document(path, &extension, ctx, &params, &tracker).await?;

            let mut guard = tracker.lock().await;
            guard.stats_mut().content_length = converted.0.len();
            guard.stats_mut().images_extracted = converted.1.len();
            let message = if converted.1.is_empty() {
                format!("{} → Markdown ({} chars)", extension.to_uppercase(), converted.0.len())
            } else {
                format!(
                    "{} → Markdown ({} chars, {} images)",
                    extension.to_uppercase(),
                    converted.0.len(),
                    converted.1.len()
                )
            };
            guard.end_stage(&message);
            drop(guard);

            ctx.report_stats(tracker.lock().await.snapshot()).await;
            converted
        };

        ctx.report_progress(2, 5, "Processing images…").await;

        // === Stage 3: chunking ===
        ctx.report_progress(3, 5, format!("Applying {} chunking…", params.chunking_mode))
            .await;
        tracker.lock().await.start_stage("chunking");

        let (chunks, chunk_metadata, strategy_label, strategy_metadata) =
            apply_chunking(&content, &params);

        {
            let mut guard = tracker.lock().await;
            guard.stats_mut().chunking_strategy = strategy_label.clone();
            guard.set_chunk_stats(chunks.iter().map(String::as_str));
            guard.end_stage(&format!("{} chunks ({strategy_label})", chunks.len()));
        }
        ctx.report_stats(tracker.lock().await.snapshot()).await;
        info!(count = chunks.len(), strategy = %strategy_label, "document chunked");

        // === Stage 4: finalize ===
        ctx.report_progress(4, 5, format!("Finalizing {} chunks…", chunks.len()))
            .await;
        tracker.lock().await.start_stage("finalization");

        let markdown_url = save_markdown(path, &content, ctx).await;
        let images_folder_url = (!image_files.is_empty()).then(|| {
            derivative_url(
                ctx,
                &path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
            )
        });

        {
            let mut guard = tracker.lock().await;
            guard.stats_mut().output_files.markdown_url = markdown_url.clone();
            guard.stats_mut().output_files.images_folder_url = images_folder_url.clone();
            guard.stats_mut().output_files.original_file_url =
                (!params.file_url.is_empty()).then(|| params.file_url.clone());
            guard.set_markdown_preview(&content);
            guard.end_stage(&format!("Saved markdown and prepared {} chunks", chunks.len()));
        }

        // Base metadata shared by every chunk.
        let mut base_metadata = json!({
            "source": path.to_string_lossy(),
            "filename": file_name,
            "extension": extension,
            "file_size": file_size,
            "image_description_mode": params.image_descriptions,
            "images_extracted": image_files.len(),
        });
        if let Some(map) = base_metadata.as_object_mut() {
            if !params.file_url.is_empty() {
                map.insert("file_url".to_owned(), json!(params.file_url));
            }
            if let Some(url) = &markdown_url {
                map.insert("markdown_file_url".to_owned(), json!(url));
            }
            if let Some(url) = &images_folder_url {
                map.insert("images_folder_url".to_owned(), json!(url));
            }
            if let Some(description) = &params.description {
                map.insert("description".to_owned(), json!(description));
            }
            if let Some(citation) = &params.citation {
                map.insert("citation".to_owned(), json!(citation));
            }
            if let Some(strategy) = strategy_metadata.as_object() {
                for (key, value) in strategy {
                    map.insert(key.clone(), value.clone());
                }
            }
        }

        let total = chunks.len();
        let documents = chunks
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                let mut metadata = base_metadata.clone();
                if let Some(map) = metadata.as_object_mut() {
                    // Hierarchical metadata carries its own global indexes;
                    // entries here are overwritten by the per-chunk values.
                    map.insert("chunk_index".to_owned(), json!(index));
                    map.insert("chunk_count".to_owned(), json!(total));
                    if let Some(extra) = chunk_metadata.get(index).and_then(Value::as_object) {
                        for (key, value) in extra {
                            map.insert(key.clone(), value.clone());
                        }
                    }
                }
                DocumentChunk { text, metadata }
            })
            .collect();

        // === Stage 5: complete ===
        ctx.report_progress(5, 5, format!("Completed: {total} chunks from {}", path.display()))
            .await;
        let final_stats = tracker.lock().await.snapshot();
        ctx.report_stats(final_stats).await;

        Ok(documents)
    }
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// Convert the stored file to markdown, extracting images where supported.
/// Returns the markdown content and the list of extracted image paths.
async fn convert_document(
    path: &Path,
    extension: &str,
    ctx: &IngestContext,
    params: &Params,
    tracker: &Arc<Mutex<StatsTracker>>,
) -> Result<(String, Vec<PathBuf>), IngestError> {
    match extension {
        "pdf" => convert_pdf(path, ctx, params, tracker).await,
        "html" | "htm" => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| IngestError::at("conversion", "IoError", e.to_string()))?;
            let markdown = htmd::HtmlToMarkdown::builder()
                .skip_tags(vec!["script", "style", "video", "audio", "embed"])
                .build()
                .convert(&raw)
                .unwrap_or(raw);
            Ok((markdown, Vec::new()))
        }
        "md" | "markdown" | "txt" => {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| IngestError::at("conversion", "IoError", e.to_string()))?;
            Ok((content, Vec::new()))
        }
        other => Err(IngestError::at(
            "conversion",
            "ValueError",
            format!("unsupported file type '{other}'"),
        )),
    }
}

/// Native PDF path: per-page text with page markers, plus embedded JPEG
/// images above the decorative-noise threshold.
async fn convert_pdf(
    path: &Path,
    ctx: &IngestContext,
    params: &Params,
    tracker: &Arc<Mutex<StatsTracker>>,
) -> Result<(String, Vec<PathBuf>), IngestError> {
    let path_owned = path.to_path_buf();

    // Parsing is CPU-bound: keep it off the async scheduler.
    let (pages, images) = tokio::task::spawn_blocking(move || extract_pdf(&path_owned))
        .await
        .map_err(|e| IngestError::at("pdf_extraction", "JoinError", e.to_string()))?
        .map_err(|e| IngestError::at("pdf_extraction", "PdfError", e))?;

    let mut content = String::new();
    for (number, text) in &pages {
        content.push_str(&format!("<!-- Page {number} -->\n"));
        content.push_str(text.trim());
        content.push_str("\n\n");
    }

    // Persist extracted images and append their references.
    let mut image_files = Vec::new();
    if params.image_descriptions != "none" && !images.is_empty() {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let images_dir = ctx
            .static_root
            .join(&ctx.collection_owner)
            .join(&ctx.collection_name)
            .join(&stem);
        tokio::fs::create_dir_all(&images_dir)
            .await
            .map_err(|e| IngestError::at("image_extraction", "IoError", e.to_string()))?;

        let mut references = Vec::new();
        for (index, bytes) in images.iter().enumerate() {
            let file = images_dir.join(format!("image_{:03}.jpg", index + 1));
            tokio::fs::write(&file, bytes)
                .await
                .map_err(|e| IngestError::at("image_extraction", "IoError", e.to_string()))?;

            let description = if params.image_descriptions == "llm" {
                describe_image(&file, bytes, ctx, tracker).await
            } else {
                basic_description(&file)
            };
            references.push(format!("![{description}]({}/image_{:03}.jpg)", derivative_url(ctx, &stem), index + 1));
            image_files.push(file);
        }

        if !references.is_empty() {
            content.push_str("\n## Extracted Images\n\n");
            content.push_str(&references.join("\n\n"));
            content.push('\n');
        }
    }

    Ok((content, image_files))
}

/// Parse a PDF: per-page text plus embedded JPEG streams of at least 1 KB.
fn extract_pdf(path: &Path) -> Result<(Vec<(u32, String)>, Vec<Vec<u8>>), String> {
    let document = lopdf::Document::load(path).map_err(|e| e.to_string())?;

    let mut pages = Vec::new();
    for (number, _object_id) in document.get_pages() {
        let text = document.extract_text(&[number]).unwrap_or_default();
        pages.push((number, text));
    }

    let mut images = Vec::new();
    for (_id, object) in document.objects.iter() {
        let lopdf::Object::Stream(stream) = object else {
            continue;
        };
        let is_image = stream
            .dict
            .get(b"Subtype")
            .ok()
            .and_then(|s| s.as_name().ok())
            .map(|name| name == &b"Image"[..])
            .unwrap_or(false);
        if !is_image {
            continue;
        }
        // Only DCTDecode streams are standalone JPEG payloads; other
        // filters need raster reconstruction and are skipped.
        let is_jpeg = stream
            .dict
            .get(b"Filter")
            .ok()
            .and_then(|f| f.as_name().ok())
            .map(|name| name == &b"DCTDecode"[..])
            .unwrap_or(false);
        if !is_jpeg {
            debug!("skipping non-JPEG embedded image");
            continue;
        }
        if stream.content.len() < MIN_IMAGE_BYTES {
            debug!(bytes = stream.content.len(), "skipping decorative image");
            continue;
        }
        images.push(stream.content.clone());
    }

    Ok((pages, images))
}

// ---------------------------------------------------------------------------
// Image descriptions
// ---------------------------------------------------------------------------

/// Filename-derived description used in `basic` mode.
fn basic_description(file: &Path) -> String {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("Image: {}", stem.replace(['_', '-'], " "))
}

/// Vision-LLM description. Only reachable when the privacy contract holds;
/// failures fall back to the basic description and are recorded in stats.
async fn describe_image(
    file: &Path,
    bytes: &[u8],
    ctx: &IngestContext,
    tracker: &Arc<Mutex<StatsTracker>>,
) -> String {
    let Some(api_key) = &ctx.openai_api_key else {
        return basic_description(file);
    };
    let image_label = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let body = json!({
        "model": DESCRIPTION_MODEL,
        "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": "Describe this image concisely for a document index."},
                {"type": "image_url", "image_url": {"url": format!("data:image/jpeg;base64,{encoded}")}}
            ]
        }],
        "max_tokens": 300,
    });

    let started = Instant::now();
    let result = async {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        let response = client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        response.error_for_status()?.json::<Value>().await
    }
    .await;
    let duration_ms = started.elapsed().as_millis() as i64;

    match result {
        Ok(payload) => {
            let description = payload
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_owned();
            let tokens = payload.pointer("/usage/total_tokens").and_then(Value::as_i64);

            tracker.lock().await.record_llm_call(LlmCallStat {
                image: image_label,
                duration_ms,
                tokens_used: tokens,
                success: !description.is_empty(),
                error: None,
            });

            if description.is_empty() {
                basic_description(file)
            } else {
                description
            }
        }
        Err(e) => {
            warn!(error = %e, "image description call failed");
            tracker.lock().await.record_llm_call(LlmCallStat {
                image: image_label,
                duration_ms,
                tokens_used: None,
                success: false,
                error: Some(e.to_string()),
            });
            basic_description(file)
        }
    }
}

// ---------------------------------------------------------------------------
// Chunking dispatch
// ---------------------------------------------------------------------------

/// Apply the selected chunking mode with the documented fallbacks.
/// Returns chunks, per-chunk metadata, the strategy label, and the
/// strategy-level metadata merged into every chunk.
fn apply_chunking(content: &str, params: &Params) -> (Vec<String>, Vec<Value>, String, Value) {
    match params.chunking_mode.as_str() {
        "by_page" => {
            if let Some((chunks, metadata)) = split_by_page(content, params.pages_per_chunk) {
                let strategy = json!({
                    "chunking_strategy": "by_page",
                    "pages_per_chunk": params.pages_per_chunk,
                });
                return (chunks, metadata, "by_page".to_owned(), strategy);
            }
            warn!("no page markers found, falling back to standard chunking");
            standard_chunks(content, params)
        }
        "by_section" => {
            if let Some((chunks, metadata)) =
                split_by_section(content, params.split_on_heading, params.headings_per_chunk)
            {
                let strategy = json!({
                    "chunking_strategy": "by_section",
                    "split_on_heading": params.split_on_heading,
                    "headings_per_chunk": params.headings_per_chunk,
                });
                return (chunks, metadata, "by_section".to_owned(), strategy);
            }
            warn!("no headings found, falling back to standard chunking");
            standard_chunks(content, params)
        }
        "hierarchical" => {
            let (chunks, metadata) = split_hierarchical(content, &params.hierarchical);
            if chunks.is_empty() {
                warn!("hierarchical chunking produced nothing, falling back to standard");
                return standard_chunks(content, params);
            }
            let strategy = json!({
                "chunking_strategy": "hierarchical_parent_child",
                "parent_chunk_size": params.hierarchical.parent_chunk_size,
                "child_chunk_size": params.hierarchical.child_chunk_size,
                "child_chunk_overlap": params.hierarchical.child_chunk_overlap,
                "split_by_headers": params.hierarchical.split_by_headers,
                "include_outline": params.hierarchical.include_outline,
            });
            (chunks, metadata, "hierarchical_parent_child".to_owned(), strategy)
        }
        _ => standard_chunks(content, params),
    }
}

fn standard_chunks(content: &str, params: &Params) -> (Vec<String>, Vec<Value>, String, Value) {
    let chunks = split_standard(content, &params.standard);
    let metadata = vec![json!({}); chunks.len()];
    let label = params.standard.splitter.label().to_owned();
    let strategy = json!({
        "chunking_strategy": label,
        "chunk_size": params.standard.chunk_size,
        "chunk_overlap": params.standard.chunk_overlap,
    });
    (chunks, metadata, label, strategy)
}

// ---------------------------------------------------------------------------
// Derivatives
// ---------------------------------------------------------------------------

/// Save the converted markdown next to the stored file; best-effort.
async fn save_markdown(path: &Path, content: &str, ctx: &IngestContext) -> Option<String> {
    let md_path = path.with_extension("md");
    if let Err(e) = tokio::fs::write(&md_path, content).await {
        warn!(error = %e, "failed to save markdown derivative");
        return None;
    }
    let name = md_path.file_name()?.to_string_lossy().into_owned();
    Some(format!(
        "{}/static/{}/{}/{name}",
        ctx.public_base_url.trim_end_matches('/'),
        ctx.collection_owner,
        ctx.collection_name,
    ))
}

/// Public URL of a document's derivative folder.
fn derivative_url(ctx: &IngestContext, stem: &str) -> String {
    format!(
        "{}/static/{}/{}/{stem}",
        ctx.public_base_url.trim_end_matches('/'),
        ctx.collection_owner,
        ctx.collection_name,
    )
}

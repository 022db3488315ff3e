//! URL ingestion plugin.
//!
//! Stateful over a list of URLs: fetches each page, converts HTML to
//! markdown, and chunks it. Progress is reported once per URL boundary and
//! a single failing URL does not abort the batch.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::kb::chunking::{split_standard, SplitterKind, StandardParams};
use crate::kb::models::{DocumentChunk, StatsTracker};

use super::{IngestContext, IngestError, IngestPlugin, IngestSource, ParamSpec};

/// URL ingestion plugin.
#[derive(Debug, Default)]
pub struct UrlIngest;

impl UrlIngest {
    /// Create the plugin.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl IngestPlugin for UrlIngest {
    fn name(&self) -> &'static str {
        "url_ingest"
    }

    fn kind(&self) -> &'static str {
        "url-ingest"
    }

    fn description(&self) -> &'static str {
        "Fetch web pages, convert them to markdown, and chunk the result"
    }

    fn supported_file_types(&self) -> &'static [&'static str] {
        &[]
    }

    fn parameters(&self) -> BTreeMap<&'static str, ParamSpec> {
        BTreeMap::from([
            (
                "urls",
                ParamSpec {
                    kind: "array",
                    description: "URLs to ingest",
                    default: Value::Null,
                    required: true,
                    options: None,
                },
            ),
            (
                "chunk_size",
                ParamSpec {
                    kind: "integer",
                    description: "Target chunk size in characters",
                    default: json!(1000),
                    required: false,
                    options: None,
                },
            ),
            (
                "chunk_overlap",
                ParamSpec {
                    kind: "integer",
                    description: "Overlap between chunks",
                    default: json!(200),
                    required: false,
                    options: None,
                },
            ),
        ])
    }

    async fn ingest(
        &self,
        source: &IngestSource,
        params: &Value,
        ctx: &IngestContext,
    ) -> Result<Vec<DocumentChunk>, IngestError> {
        let urls = match source {
            IngestSource::Urls(urls) if !urls.is_empty() => urls.clone(),
            IngestSource::Urls(_) => {
                return Err(IngestError::at("validation", "ValueError", "no URLs given"))
            }
            IngestSource::File { .. } => {
                return Err(IngestError::at(
                    "validation",
                    "ValueError",
                    "this plugin ingests URLs, not files",
                ))
            }
        };

        let standard = StandardParams {
            chunk_size: params
                .get("chunk_size")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(1000),
            chunk_overlap: params
                .get("chunk_overlap")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(200),
            splitter: SplitterKind::Recursive,
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| IngestError::at("fetch", "ClientError", e.to_string()))?;

        let mut tracker = StatsTracker::new();
        let mut documents: Vec<DocumentChunk> = Vec::new();
        let total = urls.len() as u64;
        let mut total_content = 0usize;

        for (index, url) in urls.iter().enumerate() {
            // One progress report per URL boundary.
            ctx.report_progress(index as u64, total, format!("Fetching {url}…")).await;
            tracker.start_stage("fetch");

            let markdown = match fetch_as_markdown(&client, url).await {
                Ok(markdown) => markdown,
                Err(e) => {
                    // Per-URL failures are tolerated; the batch continues.
                    warn!(url = %url, error = %e, "url fetch failed, skipping");
                    tracker.end_stage(&format!("{url}: failed ({e})"));
                    tracker.note_stage("warning", &format!("⚠️ Skipped {url}: {e}"));
                    ctx.report_stats(tracker.snapshot()).await;
                    continue;
                }
            };

            total_content += markdown.len();
            tracker.end_stage(&format!("{url}: {} chars", markdown.len()));

            let chunks = split_standard(&markdown, &standard);
            let count = chunks.len();
            for (chunk_index, text) in chunks.into_iter().enumerate() {
                documents.push(DocumentChunk {
                    text,
                    metadata: json!({
                        "source": url,
                        "filename": url,
                        "url_index": index,
                        "chunk_index": chunk_index,
                        "chunk_count": count,
                        "chunking_strategy": "standard_recursive",
                    }),
                });
            }

            ctx.report_stats(tracker.snapshot()).await;
        }

        ctx.report_progress(total, total, format!("Fetched {} URLs", urls.len())).await;

        tracker.stats_mut().content_length = total_content;
        tracker.stats_mut().chunking_strategy = "standard_recursive".to_owned();
        tracker.set_chunk_stats(documents.iter().map(|d| d.text.as_str()));
        ctx.report_stats(tracker.snapshot()).await;

        // Re-index across the whole batch so chunk ids are stable per job.
        let total_chunks = documents.len();
        for (global_index, document) in documents.iter_mut().enumerate() {
            if let Some(map) = document.metadata.as_object_mut() {
                map.insert("chunk_index".to_owned(), json!(global_index));
                map.insert("chunk_count".to_owned(), json!(total_chunks));
            }
        }

        info!(urls = urls.len(), chunks = total_chunks, "url batch ingested");
        Ok(documents)
    }
}

/// Fetch one URL and convert its HTML to markdown.
async fn fetch_as_markdown(client: &reqwest::Client, url: &str) -> Result<String, String> {
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP {status}"));
    }
    let html = response.text().await.map_err(|e| e.to_string())?;

    Ok(htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "img", "video", "audio", "embed"])
        .build()
        .convert(&html)
        .unwrap_or(html))
}

//! YouTube transcript ingestion plugin.
//!
//! Fetches the caption track of each video through the public `timedtext`
//! endpoint, joins it into a transcript, and chunks it. Like the URL
//! plugin, it reports progress per video and tolerates per-video failures.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::kb::chunking::{split_standard, SplitterKind, StandardParams};
use crate::kb::models::{DocumentChunk, StatsTracker};

use super::{IngestContext, IngestError, IngestPlugin, IngestSource, ParamSpec};

/// YouTube transcript plugin.
#[derive(Debug, Default)]
pub struct YoutubeTranscriptIngest;

impl YoutubeTranscriptIngest {
    /// Create the plugin.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl IngestPlugin for YoutubeTranscriptIngest {
    fn name(&self) -> &'static str {
        "youtube_transcript_ingest"
    }

    fn kind(&self) -> &'static str {
        "base-ingest"
    }

    fn description(&self) -> &'static str {
        "Fetch YouTube video transcripts and chunk them"
    }

    fn supported_file_types(&self) -> &'static [&'static str] {
        &[]
    }

    fn parameters(&self) -> BTreeMap<&'static str, ParamSpec> {
        BTreeMap::from([
            (
                "video_url",
                ParamSpec {
                    kind: "string",
                    description: "Video URL or id (multiple may be supplied via 'urls')",
                    default: Value::Null,
                    required: true,
                    options: None,
                },
            ),
            (
                "language",
                ParamSpec {
                    kind: "string",
                    description: "Caption language code",
                    default: Value::Null,
                    required: false,
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
            _ => {
                return Err(IngestError::at(
                    "validation",
                    "ValueError",
                    "this plugin ingests video URLs",
                ))
            }
        };

        let language = params
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or("en")
            .to_owned();
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
        let mut documents = Vec::new();
        let total = urls.len() as u64;

        for (index, url) in urls.iter().enumerate() {
            ctx.report_progress(index as u64, total, format!("Fetching transcript for {url}…"))
                .await;

            let Some(video_id) = extract_video_id(url) else {
                warn!(url = %url, "not a recognizable video url, skipping");
                tracker.note_stage("warning", &format!("⚠️ Skipped {url}: not a video url"));
                continue;
            };

            tracker.start_stage("transcript");
            let transcript = match fetch_transcript(&client, &video_id, &language).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(video = %video_id, error = %e, "transcript fetch failed, skipping");
                    tracker.end_stage(&format!("{video_id}: failed ({e})"));
                    tracker.note_stage("warning", &format!("⚠️ Skipped {video_id}: {e}"));
                    ctx.report_stats(tracker.snapshot()).await;
                    continue;
                }
            };
            tracker.end_stage(&format!("{video_id}: {} chars", transcript.len()));

            let chunks = split_standard(&transcript, &standard);
            let count = chunks.len();
            for (chunk_index, text) in chunks.into_iter().enumerate() {
                documents.push(DocumentChunk {
                    text,
                    metadata: json!({
                        "source": url,
                        "filename": format!("youtube_{video_id}"),
                        "video_id": video_id,
                        "language": language,
                        "chunk_index": chunk_index,
                        "chunk_count": count,
                        "chunking_strategy": "standard_recursive",
                    }),
                });
            }

            ctx.report_stats(tracker.snapshot()).await;
        }

        ctx.report_progress(total, total, format!("Fetched {} transcripts", urls.len()))
            .await;

        let total_chunks = documents.len();
        for (global_index, document) in documents.iter_mut().enumerate() {
            if let Some(map) = document.metadata.as_object_mut() {
                map.insert("chunk_index".to_owned(), json!(global_index));
                map.insert("chunk_count".to_owned(), json!(total_chunks));
            }
        }

        tracker.stats_mut().chunking_strategy = "standard_recursive".to_owned();
        tracker.set_chunk_stats(documents.iter().map(|d| d.text.as_str()));
        ctx.report_stats(tracker.snapshot()).await;

        info!(videos = urls.len(), chunks = total_chunks, "transcript batch ingested");
        Ok(documents)
    }
}

/// Extract a video id from the common URL shapes (or accept a bare id).
#[doc(hidden)]
pub fn extract_video_id(url: &str) -> Option<String> {
    let patterns = [
        r"(?:youtube\.com/watch\?v=)([A-Za-z0-9_-]{11})",
        r"(?:youtu\.be/)([A-Za-z0-9_-]{11})",
        r"(?:youtube\.com/embed/)([A-Za-z0-9_-]{11})",
        r"^([A-Za-z0-9_-]{11})$",
    ];
    for pattern in patterns {
        if let Some(captures) = Regex::new(pattern).ok()?.captures(url) {
            return captures.get(1).map(|m| m.as_str().to_owned());
        }
    }
    None
}

/// Fetch and flatten a caption track.
async fn fetch_transcript(
    client: &reqwest::Client,
    video_id: &str,
    language: &str,
) -> Result<String, String> {
    let url = format!("https://www.youtube.com/api/timedtext?v={video_id}&lang={language}");
    let response = client.get(&url).send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP {status}"));
    }

    let xml = response.text().await.map_err(|e| e.to_string())?;
    let transcript = parse_timedtext(&xml);
    if transcript.is_empty() {
        return Err("no captions available".to_owned());
    }
    Ok(transcript)
}

/// Flatten timedtext XML into plain text.
#[doc(hidden)]
pub fn parse_timedtext(xml: &str) -> String {
    let Some(re) = Regex::new(r"<text[^>]*>([\s\S]*?)</text>").ok() else {
        return String::new();
    };
    re.captures_iter(xml)
        .filter_map(|c| c.get(1))
        .map(|m| decode_entities(m.as_str()))
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace('\n', " ")
}

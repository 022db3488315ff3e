//! Chunking strategies shared by the ingestion plugins.
//!
//! Four named modes, all deterministic for identical input and parameters:
//! - `standard` — recursive/character/token text splitting
//! - `by_page` — split on page markers, grouping N pages per chunk
//! - `by_section` — heading-tree splitting with parent-title context
//! - `hierarchical` — parent/child chunks; children are embedded, parents
//!   ride along in child metadata

use regex::Regex;
use serde_json::{json, Value};

/// Separators tried by the recursive splitter, most to least structural.
const RECURSIVE_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Separators for child chunks (sentence boundary added).
const CHILD_SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

/// Page-boundary markers recognized by `by_page`.
const PAGE_PATTERNS: [&str; 4] = [
    r"<!--\s*Page\s+\d+\s*-->",
    r"<!--\s*Slide\s+\d+\s*-->",
    r"<!--\s*Page\s+Break\s*-->",
    r"\[Page\s+\d+\]",
];

// ---------------------------------------------------------------------------
// Standard splitting
// ---------------------------------------------------------------------------

/// Text splitter family for the `standard` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitterKind {
    /// Separator-recursive splitting (default).
    Recursive,
    /// Paragraph-boundary splitting.
    Character,
    /// Whitespace-token window splitting.
    Token,
}

impl SplitterKind {
    /// Parse a splitter name; unknown names fall back to recursive.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "character" | "charactertextsplitter" => Self::Character,
            "token" | "tokentextsplitter" => Self::Token,
            _ => Self::Recursive,
        }
    }

    /// Strategy label recorded in chunk metadata and stats.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Recursive => "standard_recursive",
            Self::Character => "standard_character",
            Self::Token => "standard_token",
        }
    }
}

/// Parameters for the `standard` strategy.
#[derive(Debug, Clone)]
pub struct StandardParams {
    /// Target chunk size in characters (tokens for the token splitter).
    pub chunk_size: usize,
    /// Overlap carried between consecutive chunks.
    pub chunk_overlap: usize,
    /// Splitter family.
    pub splitter: SplitterKind,
}

impl Default for StandardParams {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            splitter: SplitterKind::Recursive,
        }
    }
}

/// Split text with the `standard` strategy.
pub fn split_standard(content: &str, params: &StandardParams) -> Vec<String> {
    let size = params.chunk_size.max(1);
    let overlap = params.chunk_overlap.min(size.saturating_sub(1));

    match params.splitter {
        SplitterKind::Recursive => split_recursive(content, size, overlap, &RECURSIVE_SEPARATORS),
        SplitterKind::Character => merge_pieces(
            content.split("\n\n").map(ToOwned::to_owned).collect(),
            "\n\n",
            size,
            overlap,
        ),
        SplitterKind::Token => split_tokens(content, size, overlap),
    }
}

/// Recursive separator splitting: break on the most structural separator
/// present, merge adjacent pieces into chunks of at most `size` characters
/// with `overlap` carried over, and re-split oversized pieces with the
/// remaining separators (their sub-chunks are emitted as-is, never merged a
/// second time).
pub fn split_recursive(content: &str, size: usize, overlap: usize, separators: &[&str]) -> Vec<String> {
    if content.len() <= size {
        return if content.trim().is_empty() {
            Vec::new()
        } else {
            vec![content.to_owned()]
        };
    }

    let (separator, rest) = separators
        .split_first()
        .map(|(s, rest)| (*s, rest))
        .unwrap_or(("", &[][..]));

    if separator.is_empty() {
        // Last resort: fixed character windows.
        return char_windows(content, size, overlap);
    }

    let mut chunks = Vec::new();
    let mut pending: Vec<String> = Vec::new();

    for piece in content.split(separator) {
        if piece.len() <= size {
            pending.push(piece.to_owned());
        } else {
            chunks.extend(merge_pieces(std::mem::take(&mut pending), separator, size, overlap));
            chunks.extend(split_recursive(piece, size, overlap, rest));
        }
    }
    chunks.extend(merge_pieces(pending, separator, size, overlap));
    chunks
}

/// Merge same-level pieces into chunks of at most `size`, joining with
/// `separator` and carrying `overlap` characters from the end of each
/// emitted chunk. The overlap is dropped when it would push the next chunk
/// over the size bound.
fn merge_pieces(pieces: Vec<String>, separator: &str, size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if piece.is_empty() {
            continue;
        }
        let projected = if current.is_empty() {
            piece.len()
        } else {
            current.len() + separator.len() + piece.len()
        };
        if !current.is_empty() && projected > size {
            if !current.trim().is_empty() {
                chunks.push(current.clone());
            }
            current = overlap_tail(&current, overlap);
            if !current.is_empty() && current.len() + separator.len() + piece.len() > size {
                current.clear();
            }
        }
        if !current.is_empty() {
            current.push_str(separator);
        }
        current.push_str(&piece);
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Fixed character windows with overlap (char-boundary safe).
fn char_windows(content: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Whitespace-token windows with overlap.
fn split_tokens(content: &str, size: usize, overlap: usize) -> Vec<String> {
    let tokens: Vec<&str> = content.split_whitespace().collect();
    if tokens.is_empty() {
        return Vec::new();
    }
    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < tokens.len() {
        let end = (start + size).min(tokens.len());
        chunks.push(tokens[start..end].join(" "));
        if end == tokens.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// The trailing `overlap` characters of a chunk (char-boundary safe).
fn overlap_tail(chunk: &str, overlap: usize) -> String {
    if overlap == 0 {
        return String::new();
    }
    let chars: Vec<char> = chunk.chars().collect();
    let start = chars.len().saturating_sub(overlap);
    chars[start..].iter().collect()
}

// ---------------------------------------------------------------------------
// By page
// ---------------------------------------------------------------------------

/// Split on page markers, grouping `pages_per_chunk` pages together.
///
/// Returns `None` when the content has no recognizable markers (at most one
/// page), signalling the caller to fall back to `standard`. Each chunk's
/// metadata carries a `page_range`.
pub fn split_by_page(content: &str, pages_per_chunk: usize) -> Option<(Vec<String>, Vec<Value>)> {
    let pattern = PAGE_PATTERNS.join("|");
    let re = Regex::new(&pattern).ok()?;

    let starts: Vec<usize> = re.find_iter(content).map(|m| m.start()).collect();
    if starts.is_empty() {
        return None;
    }

    let mut pages = Vec::new();
    if starts[0] > 0 {
        let preamble = &content[..starts[0]];
        if !preamble.trim().is_empty() {
            pages.push(preamble.to_owned());
        }
    }
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(content.len());
        pages.push(content[start..end].to_owned());
    }

    if pages.len() <= 1 {
        return None;
    }

    let group = pages_per_chunk.max(1);
    let mut chunks = Vec::new();
    let mut metadata = Vec::new();

    for (chunk_index, window) in pages.chunks(group).enumerate() {
        let text = window
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        if text.is_empty() {
            continue;
        }

        let page_start = chunk_index * group + 1;
        let page_end = page_start + window.len() - 1;
        let page_range = if page_start == page_end {
            page_start.to_string()
        } else {
            format!("{page_start}-{page_end}")
        };

        chunks.push(text);
        metadata.push(json!({"page_range": page_range}));
    }

    Some((chunks, metadata))
}

// ---------------------------------------------------------------------------
// By section
// ---------------------------------------------------------------------------

/// A node in the heading tree.
#[derive(Debug)]
struct Node {
    level: usize,
    title: String,
    content: Vec<String>,
    children: Vec<usize>,
    parent: Option<usize>,
}

/// Parse markdown into a heading tree (arena-indexed).
fn heading_tree(content: &str) -> Vec<Node> {
    let Some(heading) = Regex::new(r"^(#{1,6})\s+(.+)$").ok() else {
        // Static pattern; this arm is unreachable in practice.
        return vec![Node {
            level: 0,
            title: String::new(),
            content: content.lines().map(ToOwned::to_owned).collect(),
            children: Vec::new(),
            parent: None,
        }];
    };
    let mut nodes = vec![Node {
        level: 0,
        title: String::new(),
        content: Vec::new(),
        children: Vec::new(),
        parent: None,
    }];
    let mut current = 0usize;

    for line in content.lines() {
        if let Some(captures) = heading.captures(line) {
            let level = captures.get(1).map(|m| m.as_str().len()).unwrap_or(1);

            // Climb until the parent is strictly shallower.
            while nodes[current].level >= level {
                match nodes[current].parent {
                    Some(parent) => current = parent,
                    None => break,
                }
            }

            let index = nodes.len();
            nodes.push(Node {
                level,
                title: line.to_owned(),
                content: Vec::new(),
                children: Vec::new(),
                parent: Some(current),
            });
            nodes[current].children.push(index);
            current = index;
        } else {
            nodes[current].content.push(line.to_owned());
        }
    }

    nodes
}

/// Render a node with all of its descendants.
fn node_text(nodes: &[Node], index: usize) -> String {
    let node = &nodes[index];
    let mut lines = Vec::new();
    if !node.title.is_empty() {
        lines.push(node.title.clone());
    }
    lines.extend(node.content.iter().cloned());
    for &child in &node.children {
        lines.push(node_text(nodes, child));
    }
    lines.join("\n")
}

/// Path of ancestor indices from the root (exclusive) down to a node
/// (exclusive).
fn parent_path(nodes: &[Node], index: usize) -> Vec<usize> {
    let mut path = Vec::new();
    let mut cursor = nodes[index].parent;
    while let Some(parent) = cursor {
        if nodes[parent].level > 0 {
            path.push(parent);
        }
        cursor = nodes[parent].parent;
    }
    path.reverse();
    path
}

/// Split at a chosen heading level, prepending parent-heading titles (not
/// parent body) as context and never mixing sections from different
/// parents. Intro text before the first heading attaches only to the first
/// chunk.
///
/// Returns `None` when the document has no headings at the target level,
/// signalling the fallback to `standard`.
pub fn split_by_section(
    content: &str,
    split_level: usize,
    sections_per_chunk: usize,
) -> Option<(Vec<String>, Vec<Value>)> {
    let nodes = heading_tree(content);

    // Nodes at the target level, in document order.
    let targets: Vec<usize> = (0..nodes.len())
        .filter(|&i| nodes[i].level == split_level)
        .collect();
    if targets.is_empty() {
        return None;
    }

    // Group by parent so chunks never span parents.
    let mut groups: Vec<(Vec<usize>, Vec<usize>)> = Vec::new(); // (path, members)
    for &target in &targets {
        let path = parent_path(&nodes, target);
        let extended = match groups.last_mut() {
            Some((last_path, members)) if *last_path == path => {
                members.push(target);
                true
            }
            _ => false,
        };
        if !extended {
            groups.push((path, vec![target]));
        }
    }

    // Intro text before the first heading.
    let intro = nodes[0]
        .content
        .join("\n")
        .trim()
        .to_owned();

    let group_size = sections_per_chunk.max(1);
    let mut chunks = Vec::new();
    let mut metadata = Vec::new();
    let mut first_chunk = true;

    for (path, members) in &groups {
        for batch in members.chunks(group_size) {
            let mut lines: Vec<String> = Vec::new();

            // Parent titles only; the intro rides with the very first chunk.
            for &ancestor in path {
                lines.push(nodes[ancestor].title.clone());
            }
            if first_chunk && !intro.is_empty() {
                lines.insert(0, intro.clone());
            }
            first_chunk = false;

            let mut section_titles = Vec::new();
            for &member in batch {
                lines.push(node_text(&nodes, member));
                section_titles.push(nodes[member].title.clone());
            }

            let text = lines
                .iter()
                .map(|l| l.trim_end())
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            if text.is_empty() {
                continue;
            }

            let parent_titles = path
                .iter()
                .map(|&a| strip_heading_marks(&nodes[a].title))
                .collect::<Vec<_>>()
                .join(" > ");

            chunks.push(text);
            metadata.push(json!({
                "section_titles": section_titles,
                "section_count": batch.len(),
                "parent_path": parent_titles,
            }));
        }
    }

    if chunks.is_empty() {
        None
    } else {
        Some((chunks, metadata))
    }
}

/// `## Title` → `Title`.
fn strip_heading_marks(title: &str) -> String {
    title.trim_start_matches('#').trim().to_owned()
}

// ---------------------------------------------------------------------------
// Hierarchical
// ---------------------------------------------------------------------------

/// Parameters for the `hierarchical` strategy.
#[derive(Debug, Clone)]
pub struct HierarchicalParams {
    /// Parent chunk size in characters.
    pub parent_chunk_size: usize,
    /// Child chunk size in characters.
    pub child_chunk_size: usize,
    /// Overlap between sibling children.
    pub child_chunk_overlap: usize,
    /// Split parents at markdown headers first.
    pub split_by_headers: bool,
    /// Append an indented heading outline for structural queries.
    pub include_outline: bool,
}

impl Default for HierarchicalParams {
    fn default() -> Self {
        Self {
            parent_chunk_size: 2000,
            child_chunk_size: 400,
            child_chunk_overlap: 50,
            split_by_headers: true,
            include_outline: false,
        }
    }
}

/// A parent chunk with its section metadata.
#[derive(Debug, Clone)]
struct ParentChunk {
    text: String,
    metadata: Value,
}

/// Sections delimited by any markdown header. Text before the first header
/// becomes an untitled leading section.
fn sections_by_headers(content: &str) -> Vec<(String, String)> {
    let heading = Regex::new(r"(?m)^#{1,6}\s+.+$").ok();
    let Some(heading) = heading else {
        return vec![(String::new(), content.to_owned())];
    };

    let starts: Vec<usize> = heading.find_iter(content).map(|m| m.start()).collect();
    if starts.is_empty() {
        return vec![(String::new(), content.to_owned())];
    }

    let mut sections = Vec::new();
    if starts[0] > 0 {
        let lead = &content[..starts[0]];
        if !lead.trim().is_empty() {
            sections.push((String::new(), lead.to_owned()));
        }
    }
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(content.len());
        let section = &content[start..end];
        let title = section
            .lines()
            .next()
            .map(strip_heading_marks)
            .unwrap_or_default();
        sections.push((title, section.to_owned()));
    }
    sections
}

fn parent_chunks(content: &str, params: &HierarchicalParams) -> Vec<ParentChunk> {
    let size = params.parent_chunk_size.max(1);
    let mut parents = Vec::new();

    if params.split_by_headers {
        for (title, body) in sections_by_headers(content) {
            if body.len() > size {
                let pieces = split_recursive(&body, size, 100, &RECURSIVE_SEPARATORS);
                let multi = pieces.len() > 1;
                for (part, piece) in pieces.into_iter().enumerate() {
                    let mut metadata = json!({});
                    if !title.is_empty() {
                        metadata["section_title"] = json!(title);
                    }
                    if multi {
                        metadata["section_part"] = json!(part + 1);
                    }
                    parents.push(ParentChunk {
                        text: piece,
                        metadata,
                    });
                }
            } else {
                let mut metadata = json!({});
                if !title.is_empty() {
                    metadata["section_title"] = json!(title);
                }
                parents.push(ParentChunk {
                    text: body,
                    metadata,
                });
            }
        }
    } else {
        for piece in split_recursive(content, size, 100, &RECURSIVE_SEPARATORS) {
            parents.push(ParentChunk {
                text: piece,
                metadata: json!({}),
            });
        }
    }

    parents
}

/// Produce hierarchical parent/child chunks.
///
/// Children are the embedded units; each carries its full parent text and
/// identity in metadata (`parent_text`, `parent_chunk_id`, `child_chunk_id`,
/// `chunk_level: "child"`, `chunk_index`, `chunk_count`,
/// `children_in_parent`).
pub fn split_hierarchical(content: &str, params: &HierarchicalParams) -> (Vec<String>, Vec<Value>) {
    let content = if params.include_outline {
        match document_outline(content) {
            Some(outline) => format!("{content}\n\n{outline}"),
            None => content.to_owned(),
        }
    } else {
        content.to_owned()
    };

    let parents = parent_chunks(&content, params);

    // First pass: all children, so the global count is known up front.
    let mut children: Vec<(usize, usize, usize, String)> = Vec::new(); // (parent, child, per-parent count, text)
    for (parent_index, parent) in parents.iter().enumerate() {
        let child_texts = split_recursive(
            &parent.text,
            params.child_chunk_size.max(1),
            params.child_chunk_overlap,
            &CHILD_SEPARATORS,
        );
        let count = child_texts.len();
        for (child_index, text) in child_texts.into_iter().enumerate() {
            children.push((parent_index, child_index, count, text));
        }
    }

    // Second pass: attach metadata.
    let total = children.len();
    let mut chunks = Vec::with_capacity(total);
    let mut metadata = Vec::with_capacity(total);

    for (global_index, (parent_index, child_index, in_parent, text)) in
        children.into_iter().enumerate()
    {
        let parent = &parents[parent_index];
        let mut meta = json!({
            "parent_chunk_id": parent_index,
            "child_chunk_id": child_index,
            "chunk_level": "child",
            "parent_text": parent.text,
            "chunk_index": global_index,
            "chunk_count": total,
            "children_in_parent": in_parent,
        });
        if let (Some(target), Some(source)) = (meta.as_object_mut(), parent.metadata.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }

        chunks.push(text);
        metadata.push(meta);
    }

    (chunks, metadata)
}

/// Indented heading outline of a document, or `None` without headings.
pub fn document_outline(content: &str) -> Option<String> {
    let heading = Regex::new(r"^(#{1,6})\s+(.+)$").ok()?;
    let mut lines = Vec::new();

    for line in content.lines() {
        if let Some(captures) = heading.captures(line) {
            let level = captures.get(1).map(|m| m.as_str().len()).unwrap_or(1);
            let title = captures.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            lines.push(format!("{}- {title}", "  ".repeat(level.saturating_sub(1))));
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(format!("## Document Outline\n\n{}", lines.join("\n")))
    }
}

//! Chunking strategy tests.

use serde_json::Value;

use lectern::kb::chunking::{
    document_outline, split_by_page, split_by_section, split_hierarchical, split_recursive,
    split_standard, HierarchicalParams, SplitterKind, StandardParams,
};

// -- standard --------------------------------------------------------------

#[test]
fn short_text_is_one_chunk() {
    let chunks = split_standard("hello world", &StandardParams::default());
    assert_eq!(chunks, vec!["hello world".to_owned()]);
}

#[test]
fn recursive_splitter_respects_size() {
    let paragraphs: Vec<String> = (0..20).map(|i| format!("paragraph number {i} with text")).collect();
    let content = paragraphs.join("\n\n");
    let params = StandardParams {
        chunk_size: 120,
        chunk_overlap: 0,
        splitter: SplitterKind::Recursive,
    };

    let chunks = split_standard(&content, &params);
    assert!(chunks.len() > 1);
    for chunk in &chunks {
        assert!(chunk.len() <= 120, "chunk too large: {}", chunk.len());
    }
    // Nothing lost: every paragraph appears somewhere.
    let joined = chunks.join("\n");
    for paragraph in &paragraphs {
        assert!(joined.contains(paragraph));
    }
}

#[test]
fn recursive_splitter_carries_overlap() {
    let content = "aaaa bbbb cccc dddd eeee ffff gggg hhhh";
    let chunks = split_recursive(content, 12, 4, &["\n\n", "\n", " ", ""]);
    assert!(chunks.len() > 1);
    // Each successor starts with the tail of its predecessor.
    for window in chunks.windows(2) {
        let tail: String = window[0].chars().rev().take(4).collect::<String>().chars().rev().collect();
        assert!(
            window[1].starts_with(&tail),
            "expected {:?} to start with {:?}",
            window[1],
            tail
        );
    }
}

#[test]
fn token_splitter_counts_words() {
    let content = (0..50).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
    let params = StandardParams {
        chunk_size: 10,
        chunk_overlap: 2,
        splitter: SplitterKind::Token,
    };
    let chunks = split_standard(&content, &params);
    assert_eq!(chunks[0].split_whitespace().count(), 10);
    // Step of 8 over 50 tokens.
    assert_eq!(chunks.len(), 6);
}

#[test]
fn standard_is_deterministic() {
    let content = "lorem ipsum dolor sit amet ".repeat(100);
    let params = StandardParams::default();
    assert_eq!(split_standard(&content, &params), split_standard(&content, &params));
}

// -- by page ---------------------------------------------------------------

const PAGED: &str = "<!-- Page 1 -->\nfirst page text\n<!-- Page 2 -->\nsecond page text\n<!-- Page 3 -->\nthird page text";

#[test]
fn splits_on_page_markers() {
    let (chunks, metadata) = split_by_page(PAGED, 1).expect("markers found");
    assert_eq!(chunks.len(), 3);
    assert!(chunks[0].contains("first page"));
    assert_eq!(metadata[0]["page_range"], "1");
    assert_eq!(metadata[2]["page_range"], "3");
}

#[test]
fn groups_pages_per_chunk_with_ranges() {
    let (chunks, metadata) = split_by_page(PAGED, 2).expect("markers found");
    assert_eq!(chunks.len(), 2);
    assert!(chunks[0].contains("first page") && chunks[0].contains("second page"));
    assert_eq!(metadata[0]["page_range"], "1-2");
    assert_eq!(metadata[1]["page_range"], "3");
}

#[test]
fn recognizes_all_marker_shapes() {
    for content in [
        "<!-- Slide 1 -->\na\n<!-- Slide 2 -->\nb",
        "x\n<!-- Page Break -->\ny",
        "[Page 1]\na\n[Page 2]\nb",
    ] {
        assert!(split_by_page(content, 1).is_some(), "no markers found in {content:?}");
    }
}

#[test]
fn no_markers_means_fallback() {
    assert!(split_by_page("just some text\nwith lines", 1).is_none());
}

// -- by section ------------------------------------------------------------

const SECTIONED: &str = "intro text before any heading\n\
# Part One\n\
part one preamble\n\
## Alpha\n\
alpha body\n\
## Beta\n\
beta body\n\
# Part Two\n\
## Gamma\n\
gamma body\n";

#[test]
fn splits_at_requested_level_with_parent_titles() {
    let (chunks, metadata) = split_by_section(SECTIONED, 2, 1).expect("headings found");
    assert_eq!(chunks.len(), 3);

    // Every chunk carries its parent heading title as context.
    assert!(chunks[0].contains("# Part One"));
    assert!(chunks[0].contains("## Alpha"));
    assert!(chunks[0].contains("alpha body"));
    // Parent *body* is not duplicated into later chunks.
    assert!(!chunks[1].contains("part one preamble"));
    assert!(chunks[2].contains("# Part Two"));
    assert!(chunks[2].contains("gamma body"));

    assert_eq!(metadata[0]["parent_path"], "Part One");
    assert_eq!(metadata[2]["parent_path"], "Part Two");
}

#[test]
fn intro_attaches_only_to_first_chunk() {
    let (chunks, _) = split_by_section(SECTIONED, 2, 1).expect("headings found");
    assert!(chunks[0].contains("intro text before any heading"));
    for chunk in &chunks[1..] {
        assert!(!chunk.contains("intro text before any heading"));
    }
}

#[test]
fn sections_from_different_parents_never_mix() {
    // With 2 sections per chunk, Beta (Part One) and Gamma (Part Two) must
    // not share a chunk.
    let (chunks, _) = split_by_section(SECTIONED, 2, 2).expect("headings found");
    assert_eq!(chunks.len(), 2);
    assert!(chunks[0].contains("## Alpha") && chunks[0].contains("## Beta"));
    assert!(!chunks[0].contains("## Gamma"));
    assert!(chunks[1].contains("## Gamma"));
}

#[test]
fn no_headings_at_level_means_fallback() {
    assert!(split_by_section("plain text without headings", 2, 1).is_none());
    assert!(split_by_section("# only level one\nbody", 3, 1).is_none());
}

#[test]
fn by_section_is_deterministic() {
    let first = split_by_section(SECTIONED, 2, 1).expect("chunks");
    let second = split_by_section(SECTIONED, 2, 1).expect("chunks");
    assert_eq!(first, second);
}

// -- hierarchical ----------------------------------------------------------

fn hier_content() -> String {
    let mut content = String::new();
    for section in 0..3 {
        content.push_str(&format!("## Section {section}\n"));
        for line in 0..12 {
            content.push_str(&format!("sentence {line} of section {section}. "));
        }
        content.push('\n');
    }
    content
}

#[test]
fn children_carry_parent_identity_and_text() {
    let params = HierarchicalParams {
        parent_chunk_size: 400,
        child_chunk_size: 120,
        child_chunk_overlap: 10,
        split_by_headers: true,
        include_outline: false,
    };
    let (chunks, metadata) = split_hierarchical(&hier_content(), &params);
    assert!(!chunks.is_empty());
    assert_eq!(chunks.len(), metadata.len());

    for (index, meta) in metadata.iter().enumerate() {
        assert_eq!(meta["chunk_level"], "child");
        assert_eq!(meta["chunk_index"], index, "global index is positional");
        assert_eq!(meta["chunk_count"], chunks.len());

        // The embedded text is a fragment of its attached parent.
        let parent_text = meta["parent_text"].as_str().expect("parent text");
        let child_head: String = chunks[index].chars().take(40).collect();
        assert!(
            parent_text.contains(child_head.trim()),
            "child must come from its parent"
        );

        let in_parent = meta["children_in_parent"].as_u64().expect("count");
        let child_id = meta["child_chunk_id"].as_u64().expect("child id");
        assert!(child_id < in_parent);
    }
}

#[test]
fn section_titles_propagate_to_children() {
    let params = HierarchicalParams {
        parent_chunk_size: 400,
        child_chunk_size: 120,
        child_chunk_overlap: 10,
        split_by_headers: true,
        include_outline: false,
    };
    let (_, metadata) = split_hierarchical(&hier_content(), &params);
    let titled = metadata
        .iter()
        .filter(|m| m.get("section_title").is_some())
        .count();
    assert!(titled > 0, "header-split parents carry section_title");
}

#[test]
fn hierarchical_is_deterministic() {
    let content = hier_content();
    let params = HierarchicalParams::default();
    let first = split_hierarchical(&content, &params);
    let second = split_hierarchical(&content, &params);
    assert_eq!(first.0, second.0);
    assert_eq!(
        first.1.iter().map(|m| m["chunk_index"].clone()).collect::<Vec<Value>>(),
        second.1.iter().map(|m| m["chunk_index"].clone()).collect::<Vec<Value>>(),
    );
}

#[test]
fn outline_appended_when_requested() {
    let params = HierarchicalParams {
        include_outline: true,
        ..HierarchicalParams::default()
    };
    let (chunks, metadata) = split_hierarchical(&hier_content(), &params);
    let all_parents: Vec<&str> = metadata
        .iter()
        .filter_map(|m| m["parent_text"].as_str())
        .collect();
    assert!(
        all_parents.iter().any(|p| p.contains("Document Outline")) || chunks.iter().any(|c| c.contains("Document Outline")),
        "outline text must appear in the output"
    );
}

#[test]
fn outline_lists_headings_with_indentation() {
    let outline = document_outline("# A\n## B\ntext\n### C\n").expect("outline");
    assert!(outline.contains("- A"));
    assert!(outline.contains("  - B"));
    assert!(outline.contains("    - C"));
    assert!(document_outline("no headings").is_none());
}

//! C4 citation aggregator: collapses reranked chunks into parent-level
//! citations, per SPEC_FULL.md §3 / §4.4.
//!
//! Grounded in the teacher's citation/source grouping in
//! `services/rag_service.rs` (group retrieved chunks by source document,
//! keep first-seen order), generalized to the spec's explicit preview /
//! related-snippets / recommended-citation-string shape.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::corpus::model::{MetaValue, RankedDocument};

const PREVIEW_CHARS: usize = 300;
const MAX_RELATED_SNIPPETS: usize = 2;

#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub parent_id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub date: Option<String>,
    pub preview: String,
    pub chunk_indices: BTreeSet<i64>,
    pub total_chunks: i64,
    pub representative_text: String,
    pub related_snippets: Vec<String>,
    pub tei_persons: Vec<String>,
    pub tei_places: Vec<String>,
    pub tei_orgs: Vec<String>,
    pub recommended_citation: String,
}

fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push('\u{2026}');
    truncated
}

fn meta_str(doc: &RankedDocument, key: &str) -> Option<String> {
    doc.document
        .metadata
        .get(key)
        .and_then(MetaValue::as_str)
        .map(str::to_string)
}

fn meta_list(doc: &RankedDocument, key: &str) -> Vec<String> {
    doc.document
        .metadata
        .get(key)
        .and_then(MetaValue::as_list)
        .map(|l| l.to_vec())
        .unwrap_or_default()
}

fn recommended_citation(parent_id: &str, title: Option<&str>, url: Option<&str>) -> String {
    match (title, url) {
        (Some(title), Some(url)) => format!("{title} ({parent_id}). {url}"),
        (Some(title), None) => format!("{title} ({parent_id})"),
        (None, Some(url)) => format!("{parent_id}. {url}"),
        (None, None) => parent_id.to_string(),
    }
}

/// Groups the reranked list by `parent_id`, preserving first-seen parent
/// order, and produces one `Citation` per group, capped at `citation_limit`.
pub fn aggregate_citations(ranked: &[RankedDocument], citation_limit: usize) -> Vec<Citation> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&RankedDocument>> = HashMap::new();

    for doc in ranked {
        let parent_id = doc.document.parent_id.clone();
        if !groups.contains_key(&parent_id) {
            order.push(parent_id.clone());
        }
        groups.entry(parent_id).or_default().push(doc);
    }

    let mut citations = Vec::with_capacity(order.len().min(citation_limit));
    for parent_id in order.into_iter().take(citation_limit) {
        let chunks = &groups[&parent_id];
        let representative = chunks[0];

        let chunk_indices: BTreeSet<i64> = chunks.iter().map(|c| c.document.chunk_index).collect();
        let total_chunks = chunks
            .iter()
            .filter_map(|c| meta_str_int(c, "total_chunks"))
            .max()
            .unwrap_or_else(|| chunk_indices.iter().copied().max().unwrap_or(0) + 1);

        let related_snippets: Vec<String> = chunks
            .iter()
            .skip(1)
            .take(MAX_RELATED_SNIPPETS)
            .map(|c| truncate_with_ellipsis(&c.document.text, PREVIEW_CHARS))
            .collect();

        let title = meta_str(representative, "title");
        let url = meta_str(representative, "url");

        citations.push(Citation {
            parent_id: parent_id.clone(),
            title: title.clone(),
            url: url.clone(),
            date: meta_str(representative, "date").or_else(|| meta_str(representative, "date_sent")),
            preview: truncate_with_ellipsis(&representative.document.text, PREVIEW_CHARS),
            chunk_indices,
            total_chunks,
            representative_text: representative.document.text.clone(),
            related_snippets,
            tei_persons: meta_list(representative, "tei_persons"),
            tei_places: meta_list(representative, "tei_places"),
            tei_orgs: meta_list(representative, "tei_orgs"),
            recommended_citation: recommended_citation(&parent_id, title.as_deref(), url.as_deref()),
        });
    }

    citations
}

fn meta_str_int(doc: &RankedDocument, key: &str) -> Option<i64> {
    doc.document.metadata.get(key).and_then(MetaValue::as_int)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::model::Document;

    fn chunk(parent: &str, idx: i64, total: i64, text: &str) -> RankedDocument {
        let doc = Document::new(parent, idx, text)
            .with_meta("total_chunks", MetaValue::Int(total))
            .with_meta("title", MetaValue::Text(format!("Letter {parent}")));
        RankedDocument::new(doc, 0.0, idx as usize)
    }

    #[test]
    fn groups_chunks_by_parent_preserving_first_seen_order() {
        let ranked = vec![
            chunk("letter-2", 0, 2, "second letter chunk 0"),
            chunk("letter-1", 0, 2, "first letter chunk 0"),
            chunk("letter-1", 1, 2, "first letter chunk 1"),
        ];
        let citations = aggregate_citations(&ranked, 10);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].parent_id, "letter-2");
        assert_eq!(citations[1].parent_id, "letter-1");
        assert_eq!(citations[1].chunk_indices, BTreeSet::from([0, 1]));
    }

    #[test]
    fn output_is_capped_at_citation_limit() {
        let ranked: Vec<RankedDocument> = (0..20)
            .map(|i| chunk(&format!("letter-{i}"), 0, 1, "text"))
            .collect();
        let citations = aggregate_citations(&ranked, 5);
        assert_eq!(citations.len(), 5);
    }

    #[test]
    fn preview_is_truncated_with_ellipsis() {
        let long_text = "a".repeat(400);
        let ranked = vec![chunk("letter-1", 0, 1, &long_text)];
        let citations = aggregate_citations(&ranked, 10);
        assert!(citations[0].preview.chars().count() <= PREVIEW_CHARS + 1);
        assert!(citations[0].preview.ends_with('\u{2026}'));
    }

    #[test]
    fn every_citation_has_nonempty_parent_id_and_sorted_chunk_indices() {
        let ranked = vec![
            chunk("letter-1", 2, 3, "c2"),
            chunk("letter-1", 0, 3, "c0"),
        ];
        let citations = aggregate_citations(&ranked, 10);
        assert!(!citations[0].parent_id.is_empty());
        let indices: Vec<i64> = citations[0].chunk_indices.iter().copied().collect();
        assert_eq!(indices, vec![0, 2]);
        assert!(indices.iter().all(|&i| i >= 0 && i < citations[0].total_chunks));
    }
}

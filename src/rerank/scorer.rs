//! C4 reranker — query-conditioned rescoring, per SPEC_FULL.md §4.4.
//!
//! ```text
//! score = 0.5*exact_match + 0.3*keyword_freq + 0.2*proximity + metadata_bonus
//! ```
//!
//! Adapted from the teacher's `services/rag_service.rs` context-ranking
//! pass (same "score documents against the query, then sort" shape),
//! driven here by the spec's closed-form scoring rule rather than raw
//! cosine similarity. Runs in batches of 50 with a cooperative yield
//! between batches, per §4.4 / §5 — this crate's tokio runtime is
//! preemptive for tasks, but the yield keeps a single huge rerank pass
//! from starving other tasks scheduled on the same worker thread.

use std::collections::HashSet;

use once_cell::sync::Lazy;

use crate::corpus::model::{sort_ranked, RankedDocument};

pub const MAX_SCORE: f32 = 10.0;
const PROXIMITY_WINDOW: usize = 50;
const BATCH_SIZE: usize = 50;
const MIN_KEYWORD_LEN: usize = 3;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "did", "do",
        "does", "for", "from", "had", "has", "have", "he", "her", "him", "his", "how", "i", "if",
        "in", "into", "is", "it", "its", "just", "like", "me", "my", "no", "nor", "not", "of",
        "on", "or", "our", "out", "over", "own", "she", "so", "some", "such", "than", "that",
        "the", "their", "them", "then", "there", "these", "they", "this", "those", "to", "too",
        "up", "was", "we", "were", "what", "when", "where", "which", "who", "why", "will",
        "with", "you", "your",
    ]
    .into_iter()
    .collect()
});

/// Splits the query into reranker keywords: lowercased word tokens, minus
/// a fixed English stop-word set, minus tokens shorter than 3 characters.
pub fn extract_keywords(query: &str) -> Vec<String> {
    use unicode_segmentation::UnicodeSegmentation;
    query
        .unicode_words()
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN && !STOP_WORDS.contains(w.as_str()))
        .collect()
}

fn count_whole_word_occurrences(haystack_lower: &str, keyword: &str) -> u32 {
    use unicode_segmentation::UnicodeSegmentation;
    haystack_lower
        .unicode_words()
        .filter(|w| *w == keyword)
        .count() as u32
}

/// Byte offsets (into the lowercased text) of every whole-word occurrence
/// of `keyword`, used by the proximity term.
fn occurrence_offsets(haystack_lower: &str, keyword: &str) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut start = 0;
    while let Some(pos) = haystack_lower[start..].find(keyword) {
        let abs_pos = start + pos;
        let before_ok = haystack_lower[..abs_pos]
            .chars()
            .next_back()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
        let after_idx = abs_pos + keyword.len();
        let after_ok = haystack_lower[after_idx..]
            .chars()
            .next()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
        if before_ok && after_ok {
            offsets.push(abs_pos);
        }
        start = abs_pos + 1;
    }
    offsets
}

/// `score(query, doc)` per the formula in SPEC_FULL.md §4.4, clamped to
/// `[0, MAX_SCORE]`. `query` is the raw (unfiltered) query text, since
/// exact-match is defined over the whole query, not the keyword set.
pub fn score_document(query: &str, keywords: &[String], text: &str, metadata_strings: &[&str]) -> f32 {
    let text_lower = text.to_lowercase();
    let query_lower = query.to_lowercase();

    let exact_match = if !query_lower.trim().is_empty() && text_lower.contains(query_lower.trim()) {
        10.0
    } else {
        0.0
    };

    let keyword_freq: f32 = keywords
        .iter()
        .map(|kw| count_whole_word_occurrences(&text_lower, kw).min(5) as f32)
        .sum();

    let mut proximity = 0.0f32;
    if keywords.len() > 1 {
        let offsets: Vec<Vec<usize>> = keywords
            .iter()
            .map(|kw| occurrence_offsets(&text_lower, kw))
            .collect();
        for i in 0..keywords.len() {
            for j in 0..keywords.len() {
                if i == j {
                    continue;
                }
                let close = offsets[i].iter().any(|&a| {
                    offsets[j]
                        .iter()
                        .any(|&b| a.abs_diff(b) <= PROXIMITY_WINDOW)
                });
                if close {
                    proximity += 1.0;
                }
            }
        }
    }

    let metadata_bonus: f32 = metadata_strings
        .iter()
        .filter(|field| {
            let lower = field.to_lowercase();
            keywords.iter().any(|kw| lower.contains(kw.as_str()))
        })
        .count() as f32
        * 0.5;

    let raw = 0.5 * exact_match + 0.3 * keyword_freq + 0.2 * proximity + metadata_bonus;
    raw.min(MAX_SCORE)
}

/// Scores and sorts every document against `query`. Runs in batches of 50
/// with a cooperative yield between batches (§4.4, §5 suspension point 4).
pub async fn rerank(query: &str, mut docs: Vec<RankedDocument>) -> Vec<RankedDocument> {
    let keywords = extract_keywords(query);

    for batch in docs.chunks_mut(BATCH_SIZE) {
        for ranked in batch.iter_mut() {
            let metadata_strings: Vec<&str> = ranked
                .document
                .metadata
                .values()
                .filter_map(|v| v.as_str())
                .collect();
            ranked.rerank_score =
                score_document(query, &keywords, &ranked.document.text, &metadata_strings);
        }
        tokio::task::yield_now().await;
    }

    sort_ranked(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::model::Document;

    fn ranked(text: &str, rank: usize) -> RankedDocument {
        RankedDocument::new(Document::new("p", rank as i64, text), 0.0, rank)
    }

    #[tokio::test]
    async fn stop_word_only_query_scores_zero_and_preserves_order() {
        let docs = vec![ranked("the cat sat on the mat", 0), ranked("a dog ran", 1)];
        let reranked = rerank("the a of", docs).await;
        assert!(reranked.iter().all(|d| d.rerank_score == 0.0));
        assert_eq!(reranked[0].retrieval_rank, 0);
        assert_eq!(reranked[1].retrieval_rank, 1);
    }

    #[tokio::test]
    async fn exact_substring_match_scores_highest() {
        let docs = vec![
            ranked("natural selection and the origin of species", 0),
            ranked("nothing relevant here about the weather today", 1),
        ];
        let reranked = rerank("natural selection", docs).await;
        assert!(reranked[0].document.text.contains("natural selection"));
        assert!(reranked[0].rerank_score > reranked[1].rerank_score);
    }

    #[test]
    fn keyword_frequency_caps_at_five_occurrences() {
        let keywords = vec!["finch".to_string()];
        let text = "finch finch finch finch finch finch finch";
        let score = score_document("finch population survey", &keywords, text, &[]);
        // keyword_freq contributes 0.3 * min(5, 7) = 1.5, nothing else fires.
        assert!((score - 1.5).abs() < 1e-6);
    }

    #[test]
    fn proximity_counts_ordered_pairs_within_window() {
        let keywords = vec!["darwin".to_string(), "finch".to_string()];
        let close = "darwin studied the finch population closely";
        let far = format!("darwin {}finch", "x".repeat(60));
        let close_score = score_document("darwin finch", &keywords, close, &[]);
        let far_score = score_document("darwin finch", &keywords, &far, &[]);
        assert!(close_score > far_score);
    }

    #[test]
    fn metadata_bonus_applies_per_matching_string_field() {
        let keywords = vec!["hooker".to_string()];
        let score_with = score_document("hooker", &keywords, "unrelated body text", &["Joseph Hooker"]);
        let score_without =
            score_document("hooker", &keywords, "unrelated body text", &["Alfred Wallace"]);
        assert!(score_with > score_without);
    }
}

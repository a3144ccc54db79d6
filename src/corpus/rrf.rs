//! Reciprocal Rank Fusion, per SPEC_FULL.md §4.3 / §8 (S2).
//!
//! `score(d) = Σ 1/(k + rank_i(d))` summed over every supplied ranked
//! list, where `rank_i` is the 0-based position of `d` in list `i`, or a
//! large sentinel rank when `d` does not appear in that list at all (so
//! every candidate still receives a (small, non-zero) contribution from
//! every list, rather than only from the lists it appears in). Enriched
//! from `zircote-rlm-rs::search::rrf`, which implements the simpler
//! skip-absent-lists variant; this crate's fusion differs precisely in
//! that sentinel handling, which this spec calls for explicitly.

use std::collections::HashMap;

pub const DEFAULT_K: u32 = 60;
/// Large enough that its contribution is negligible next to any real
/// rank within the retrieval breadth this crate ever searches.
pub const SENTINEL_RANK: u32 = 1_000_000;

#[derive(Debug, Clone, Copy)]
pub struct RrfConfig {
    pub k: u32,
}

impl Default for RrfConfig {
    fn default() -> Self {
        Self { k: DEFAULT_K }
    }
}

/// Fuses any number of ranked id lists (most relevant first) into one
/// descending-score ranking. Every id appearing in at least one input
/// list appears in the output exactly once.
pub fn reciprocal_rank_fusion(ranked_lists: &[&[String]], config: &RrfConfig) -> Vec<(String, f64)> {
    let mut rank_of: HashMap<&str, Vec<u32>> = HashMap::new();

    for list in ranked_lists {
        for id in list.iter() {
            rank_of
                .entry(id.as_str())
                .or_insert_with(|| vec![SENTINEL_RANK; ranked_lists.len()]);
        }
    }
    for (list_idx, list) in ranked_lists.iter().enumerate() {
        for (rank, id) in list.iter().enumerate() {
            if let Some(ranks) = rank_of.get_mut(id.as_str()) {
                ranks[list_idx] = rank as u32;
            }
        }
    }

    let mut scores: Vec<(String, f64)> = rank_of
        .into_iter()
        .map(|(id, ranks)| {
            let score: f64 = ranks
                .iter()
                .map(|&rank| 1.0 / f64::from(config.k + rank))
                .sum();
            (id.to_string(), score)
        })
        .collect();

    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_lists_preserve_prefix_ordering() {
        let list = ids(&["a", "b", "c", "d"]);
        let config = RrfConfig::default();
        let fused = reciprocal_rank_fusion(&[&list, &list], &config);
        let top3: Vec<&str> = fused.iter().take(3).map(|(id, _)| id.as_str()).collect();
        assert_eq!(top3, vec!["a", "b", "c"]);
    }

    #[test]
    fn exact_scores_for_three_item_fusion() {
        let dense = ids(&["A", "B", "C"]);
        let lexical = ids(&["C", "B", "A"]);
        let config = RrfConfig::default();
        let fused = reciprocal_rank_fusion(&[&dense, &lexical], &config);
        let score_of = |id: &str| fused.iter().find(|(i, _)| i == id).unwrap().1;

        // A: dense rank 0, lexical rank 2
        assert!((score_of("A") - (1.0 / 60.0 + 1.0 / 62.0)).abs() < 1e-12);
        // B: dense rank 1, lexical rank 1
        assert!((score_of("B") - (2.0 / 61.0)).abs() < 1e-12);
        // C: dense rank 2, lexical rank 0
        assert!((score_of("C") - (1.0 / 62.0 + 1.0 / 60.0)).abs() < 1e-12);

        // B scores highest (appears at the best combined rank in both lists).
        assert_eq!(fused[0].0, "B");
    }

    #[test]
    fn disjoint_lists_still_include_every_id_via_sentinel() {
        let a = ids(&["x", "y"]);
        let b = ids(&["z"]);
        let fused = reciprocal_rank_fusion(&[&a, &b], &RrfConfig::default());
        assert_eq!(fused.len(), 3);
        // "z" appears in list b at rank 0, and gets a sentinel contribution from a.
        let z_score = fused.iter().find(|(i, _)| i == "z").unwrap().1;
        assert!(z_score > 0.0);
    }

    #[test]
    fn empty_lists_yield_empty_output() {
        let empty: Vec<String> = vec![];
        let fused = reciprocal_rank_fusion(&[&empty], &RrfConfig::default());
        assert!(fused.is_empty());
    }
}

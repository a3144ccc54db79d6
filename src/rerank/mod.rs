//! C4 — reranker and citation aggregator.

pub mod citations;
pub mod scorer;

pub use citations::{aggregate_citations, Citation};
pub use scorer::{extract_keywords, rerank, score_document, MAX_SCORE};

//! Core data model: `Document`, `Corpus`, `RetrievalRequest`, `RankedDocument`.
//!
//! Grounded in the teacher's `database/models.rs::DocumentChunk` shape
//! (chunk identity, similarity score, page number) generalized to the
//! metadata-map model SPEC_FULL.md §3 requires, since historical-corpus
//! documents (Darwin letters, Hansard entries) carry heterogeneous
//! metadata the teacher's fixed-column struct can't express directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A metadata value: almost everything in this domain is a string, but a
/// handful of fields (chunk_index, total_chunks, page, TEI lists) are
/// naturally typed, so this is a small closed union rather than
/// `serde_json::Value` at large — keeps filter construction exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Text(String),
    Int(i64),
    List(Vec<String>),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            MetaValue::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// Immutable post-ingestion record. Identity is `(parent_id, chunk_index)`
/// — for Darwin letters `parent_id` is the letter id, for Hansard it is
/// the entry id. `id` is the caller-facing composite identifier
/// `"{parent_id}#{chunk_index}"`, matching the BM25 sidecar line format
/// from SPEC_FULL.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub parent_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub metadata: Metadata,
}

impl Document {
    pub fn new(parent_id: impl Into<String>, chunk_index: i64, text: impl Into<String>) -> Self {
        let parent_id = parent_id.into();
        Self {
            id: format!("{parent_id}#{chunk_index}"),
            parent_id,
            chunk_index,
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: MetaValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn corpus(&self) -> Option<&str> {
        self.metadata.get("corpus").and_then(MetaValue::as_str)
    }

    pub fn is_valid(&self) -> bool {
        !self.text.trim().is_empty() && !self.parent_id.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sent" => Some(Direction::Sent),
            "received" => Some(Direction::Received),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimePeriod {
    Year(i64),
    Range(i64, i64),
}

impl TimePeriod {
    /// Parses `"YYYY"` or `"YYYY-YYYY"`. Returns `None` for anything else
    /// rather than erroring — an unsupported filter value is ignored by
    /// the retriever, not rejected, per §4.3.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some((start, end)) = raw.split_once('-') {
            let start: i64 = start.trim().parse().ok()?;
            let end: i64 = end.trim().parse().ok()?;
            Some(TimePeriod::Range(start, end))
        } else {
            raw.trim().parse().ok().map(TimePeriod::Year)
        }
    }

    pub fn contains(&self, year: i64) -> bool {
        match self {
            TimePeriod::Year(y) => *y == year,
            TimePeriod::Range(a, b) => year >= *a && year <= *b,
        }
    }
}

/// {query, k, optional corpus/direction/time-period filters, session id, qa id}.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
    pub corpus_filter: Option<String>,
    pub direction_filter: Option<String>,
    pub time_period_filter: Option<String>,
    pub session_id: String,
    pub qa_id: String,
}

fn default_k() -> usize {
    8
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalRequestError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("query exceeds 2000 characters")]
    QueryTooLong,
    #[error("k must be >= 1")]
    InvalidK,
}

impl RetrievalRequest {
    pub fn validate(&self) -> Result<(), RetrievalRequestError> {
        if self.query.trim().is_empty() {
            return Err(RetrievalRequestError::EmptyQuery);
        }
        if self.query.chars().count() > 2000 {
            return Err(RetrievalRequestError::QueryTooLong);
        }
        if self.k < 1 {
            return Err(RetrievalRequestError::InvalidK);
        }
        Ok(())
    }
}

/// {Document, rrf_score, rerank_score}. Documents are ultimately ordered
/// by descending `rerank_score`, ties broken by original retrieval
/// position — callers must keep `retrieval_rank` to implement that tie
/// break, since `f32` equality alone can't express "same position".
#[derive(Debug, Clone)]
pub struct RankedDocument {
    pub document: Document,
    pub rrf_score: f64,
    pub rerank_score: f32,
    pub retrieval_rank: usize,
}

impl RankedDocument {
    pub fn new(document: Document, rrf_score: f64, retrieval_rank: usize) -> Self {
        Self {
            document,
            rrf_score,
            rerank_score: 0.0,
            retrieval_rank,
        }
    }
}

/// Sorts by descending `rerank_score`; ties keep original retrieval order
/// (stable sort on `retrieval_rank` ascending).
pub fn sort_ranked(mut docs: Vec<RankedDocument>) -> Vec<RankedDocument> {
    docs.sort_by(|a, b| {
        b.rerank_score
            .partial_cmp(&a.rerank_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.retrieval_rank.cmp(&b.retrieval_rank))
    });
    docs
}

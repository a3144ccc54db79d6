//! C3 — the `Retriever` trait, a shared hybrid-search implementation, and
//! the Darwin/Hansard capability presets.
//!
//! SPEC_FULL.md §9 calls for composition over deep subclassing: one
//! `HybridRetriever` carries the dense+BM25+RRF+corpus-balancing mechanics,
//! and per-corpus "adapters" are just different `RetrieverCapabilities`
//! values plumbed into the same struct at construction — there is no
//! Darwin/Hansard subtype, only different configuration. Grounded in the
//! teacher's `services/rag_service.rs` (the context-assembly / filter
//! shape) and enriched from `zircote-rlm-rs::search` for the hybrid
//! dense+lexical fusion shape.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::bm25::Bm25Sidecar;
use super::model::{Document, RankedDocument, RetrievalRequest, TimePeriod};
use super::rrf::{reciprocal_rank_fusion, RrfConfig};
use super::traits::{Embedder, MetadataFilter, VectorIndex};

/// The single correspondent a direction filter (`sent`/`received`) is
/// always relative to in the Darwin correspondence capability set — see
/// `HybridRetriever::build_filter`.
const CORRESPONDENCE_ANCHOR: &str = "Charles Darwin";

#[derive(Debug, Clone)]
pub struct RetrieverCapabilities {
    pub corpus_filtering: bool,
    pub corpus_options: Vec<String>,
    pub direction_filtering: bool,
    pub direction_options: Vec<String>,
    pub time_period_filtering: bool,
}

impl RetrieverCapabilities {
    /// Darwin correspondence: one untagged corpus, but direction (sent /
    /// received) and time-period filters both apply.
    pub fn darwin() -> Self {
        Self {
            corpus_filtering: false,
            corpus_options: vec![],
            direction_filtering: true,
            direction_options: vec!["sent".to_string(), "received".to_string()],
            time_period_filtering: true,
        }
    }

    /// Hansard: four corpus tags (`all` plus three jurisdictions), no
    /// sender/recipient concept, time-period filtering still applies.
    pub fn hansard() -> Self {
        Self {
            corpus_filtering: true,
            corpus_options: vec![
                "all".to_string(),
                "1901_au".to_string(),
                "1901_nz".to_string(),
                "1901_uk".to_string(),
            ],
            direction_filtering: false,
            direction_options: vec![],
            time_period_filtering: true,
        }
    }

    /// The enumerated corpora a balancing pass partitions over — every
    /// declared option except the `all` sentinel.
    fn balancing_corpora(&self) -> Vec<&str> {
        self.corpus_options
            .iter()
            .map(String::as_str)
            .filter(|c| *c != "all")
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetrieverError {
    #[error("invalid retrieval parameters: {0}")]
    InvalidParams(String),
    #[error("retrieval request timed out")]
    Timeout,
    #[error("retrieval connection failed: {0}")]
    Connection(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait Retriever: Send + Sync {
    fn capabilities(&self) -> &RetrieverCapabilities;

    /// Hybrid (or dense-only) search, honoring corpus balancing when the
    /// request's corpus filter is `all`. Returns documents ordered by
    /// descending fused retrieval score; `rerank_score` is left at its
    /// default (0.0) — C4 fills it in.
    async fn invoke(&self, request: &RetrievalRequest) -> Result<Vec<RankedDocument>, RetrieverError>;
}

/// Wraps an `Embedder` so a GPU-configured backend falls back to CPU
/// exactly once on the first runtime failure and stays there — per
/// SPEC_FULL.md §4.3's device-fallback clause. Persistent (CPU) failures
/// propagate normally.
pub struct DeviceFallbackEmbedder {
    primary: Arc<dyn Embedder>,
    fallback: Arc<dyn Embedder>,
    fell_back: std::sync::atomic::AtomicBool,
}

impl DeviceFallbackEmbedder {
    pub fn new(primary: Arc<dyn Embedder>, fallback: Arc<dyn Embedder>) -> Self {
        Self {
            primary,
            fallback,
            fell_back: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Embedder for DeviceFallbackEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        use std::sync::atomic::Ordering;
        if !self.fell_back.load(Ordering::Acquire) {
            match self.primary.embed(text).await {
                Ok(embedding) => return Ok(embedding),
                Err(err) => {
                    tracing::warn!(
                        ?err,
                        "embedding backend probe failed, rebuilding on CPU"
                    );
                    self.fell_back.store(true, Ordering::Release);
                }
            }
        }
        self.fallback.embed(text).await
    }

    fn dimension(&self) -> usize {
        self.fallback.dimension()
    }

    fn model_name(&self) -> &str {
        self.fallback.model_name()
    }
}

/// The shared hybrid-search implementation: dense nearest-neighbor over
/// `index`, optionally fused with BM25 over `bm25` via Reciprocal Rank
/// Fusion, with corpus-balanced partitioning when the filter is `all`.
pub struct HybridRetriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    bm25: Option<Arc<Bm25Sidecar>>,
    capabilities: RetrieverCapabilities,
    request_timeout: Duration,
    rrf: RrfConfig,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        bm25: Option<Arc<Bm25Sidecar>>,
        capabilities: RetrieverCapabilities,
        request_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            index,
            bm25,
            capabilities,
            request_timeout,
            rrf: RrfConfig::default(),
        }
    }

    /// Builds the conjunctive filter from request fields the retriever
    /// actually supports. Unsupported fields are dropped rather than
    /// rejected, per §4.3 — "if any filter is unsupported by the
    /// retriever, it is ignored (not an error)".
    fn build_filter(&self, request: &RetrievalRequest) -> MetadataFilter {
        let mut filter = MetadataFilter::default();

        if self.capabilities.corpus_filtering {
            if let Some(corpus) = &request.corpus_filter {
                if corpus != "all" {
                    filter.corpus = Some(corpus.clone());
                }
            }
        }

        if self.capabilities.direction_filtering {
            if let Some(direction) = &request.direction_filter {
                // The corpus this capability set applies to (Darwin) is one
                // correspondent's archive, so "sent"/"received" resolves
                // against that fixed correspondent rather than an arbitrary
                // name the request doesn't carry (§3 gives the request no
                // person-name field — only the direction enum itself).
                match direction.as_str() {
                    "sent" => filter.sender_name = Some(CORRESPONDENCE_ANCHOR.to_string()),
                    "received" => filter.recipient_name = Some(CORRESPONDENCE_ANCHOR.to_string()),
                    _ => {}
                }
            }
        }

        if self.capabilities.time_period_filtering {
            if let Some(raw) = &request.time_period_filter {
                match TimePeriod::parse(raw) {
                    Some(TimePeriod::Year(y)) => filter.year_eq = Some(y),
                    Some(TimePeriod::Range(a, b)) => filter.year_range = Some((a, b)),
                    None => {}
                }
            }
        }

        filter
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, RetrieverError> {
        tokio::time::timeout(self.request_timeout, self.embedder.embed(query))
            .await
            .map_err(|_| RetrieverError::Timeout)?
            .map_err(|err| RetrieverError::Connection(err.to_string()))
    }

    /// One hybrid search against a single, already-built filter. `k` is
    /// the number of results to return after fusion.
    async fn search_single(
        &self,
        query: &str,
        filter: &MetadataFilter,
        k: usize,
    ) -> Result<Vec<RankedDocument>, RetrieverError> {
        let n = (10 * k).max(100);
        let embedding = self.embed_query(query).await?;

        let dense = tokio::time::timeout(
            self.request_timeout,
            self.index.dense_search(&embedding, n, filter),
        )
        .await
        .map_err(|_| RetrieverError::Timeout)?
        .map_err(|err| RetrieverError::Connection(err.to_string()))?;
        let dense_ids: Vec<String> = dense.iter().map(|(id, _)| id.clone()).collect();

        let bm25 = self.bm25.as_ref().filter(|sidecar| sidecar.is_loaded());

        let (fused, used_hybrid) = if let Some(sidecar) = bm25 {
            let lexical = sidecar.search(query, n);
            let lexical_ids: Vec<String> = lexical.iter().map(|(id, _)| id.clone()).collect();
            let fused = reciprocal_rank_fusion(&[&dense_ids, &lexical_ids], &self.rrf);
            (fused, true)
        } else {
            let fused = dense_ids
                .iter()
                .enumerate()
                .map(|(rank, id)| (id.clone(), 1.0 / f64::from(self.rrf.k + rank as u32)))
                .collect();
            (fused, false)
        };

        let mut out = Vec::with_capacity(k);
        for (rank, (id, score)) in fused.into_iter().enumerate() {
            if out.len() >= k {
                break;
            }
            let document = if used_hybrid {
                // Materialize from the lexical sidecar first (the spec's
                // prescribed source for hybrid results); fall back to the
                // vector index for ids the sidecar doesn't carry.
                match bm25.and_then(|sidecar| sidecar.get(&id)).cloned() {
                    Some(doc) => Some(doc),
                    None => self.get_document(&id).await?,
                }
            } else {
                self.get_document(&id).await?
            };

            let Some(document) = document else { continue };
            // BM25 results are unfiltered; the metadata filter must be
            // re-applied here even though the dense leg already honored it.
            if !filter.is_empty() && !filter.matches(&document.metadata) {
                continue;
            }
            out.push(RankedDocument::new(document, score, rank));
        }
        Ok(out)
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, RetrieverError> {
        self.index
            .get_document(id)
            .await
            .map_err(|err| RetrieverError::Connection(err.to_string()))
    }
}

#[async_trait]
impl Retriever for HybridRetriever {
    fn capabilities(&self) -> &RetrieverCapabilities {
        &self.capabilities
    }

    async fn invoke(&self, request: &RetrievalRequest) -> Result<Vec<RankedDocument>, RetrieverError> {
        if request.query.trim().is_empty() {
            return Err(RetrieverError::InvalidParams("query must not be empty".into()));
        }
        if request.k < 1 {
            return Err(RetrieverError::InvalidParams("k must be >= 1".into()));
        }

        let filter = self.build_filter(request);
        let requests_all = request.corpus_filter.as_deref() == Some("all");
        let corpora = self.capabilities.balancing_corpora();

        if requests_all && self.capabilities.corpus_filtering && corpora.len() > 1 {
            let per_corpus_k = request.k.div_ceil(corpora.len());
            let mut combined = Vec::new();
            for corpus in &corpora {
                let mut per_corpus_filter = filter.clone();
                per_corpus_filter.corpus = Some((*corpus).to_string());
                let mut docs = self
                    .search_single(&request.query, &per_corpus_filter, per_corpus_k)
                    .await?;
                // "rerank per corpus" here is the retriever's own fused
                // score, already descending from `search_single`; C4 runs
                // the query-conditioned reranker afterward over the whole
                // concatenated set. Re-numbering retrieval_rank keeps the
                // stable tie-break meaningful within the combined list.
                for doc in &mut docs {
                    doc.retrieval_rank = combined.len() + doc.retrieval_rank;
                }
                combined.extend(docs);
            }
            combined.truncate(request.k);
            Ok(combined)
        } else {
            self.search_single(&request.query, &filter, request.k).await
        }
    }
}

/// Selects a retriever implementation by configuration string, per the
/// design note in SPEC_FULL.md §9 ("a single interface ... and a registry
/// selected by configuration string; no runtime class loading required").
pub fn capabilities_for_module(module: &str) -> RetrieverCapabilities {
    match module {
        "hansard" => RetrieverCapabilities::hansard(),
        _ => RetrieverCapabilities::darwin(),
    }
}

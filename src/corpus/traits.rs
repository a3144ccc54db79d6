//! The seams external collaborators (the embedding model, the vector DB's
//! storage engine) are reached through. SPEC_FULL.md places both out of
//! scope as implementations; this crate only needs the trait boundary
//! plus one reference, in-process implementation so the crate is
//! runnable standalone — mirrored on the teacher's `EmbeddingProvider`
//! trait in `services/conversation/manager.rs`.

use async_trait::async_trait;

use super::model::{Document, Metadata};

#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub corpus: Option<String>,
    pub sender_name: Option<String>,
    pub recipient_name: Option<String>,
    pub year_eq: Option<i64>,
    pub year_range: Option<(i64, i64)>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.corpus.is_none()
            && self.sender_name.is_none()
            && self.recipient_name.is_none()
            && self.year_eq.is_none()
            && self.year_range.is_none()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        if let Some(corpus) = &self.corpus {
            if metadata.get("corpus").and_then(|v| v.as_str()) != Some(corpus.as_str()) {
                return false;
            }
        }
        if let Some(sender) = &self.sender_name {
            if metadata.get("sender_name").and_then(|v| v.as_str()) != Some(sender.as_str()) {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient_name {
            if metadata.get("recipient_name").and_then(|v| v.as_str()) != Some(recipient.as_str())
            {
                return false;
            }
        }
        let year = metadata.get("year").and_then(|v| v.as_int());
        if let Some(expected) = self.year_eq {
            if year != Some(expected) {
                return false;
            }
        }
        if let Some((start, end)) = self.year_range {
            match year {
                Some(y) if y >= start && y <= end => {}
                _ => return false,
            }
        }
        true
    }
}

/// Generates dense embeddings for a query or a document chunk. Implemented
/// by a real provider (reached over HTTP, out of scope per SPEC_FULL.md
/// §1) in production, and by a deterministic stub in tests.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    fn dimension(&self) -> usize;
    fn model_name(&self) -> &str;
}

/// One nearest-neighbor + lexical search backend over a populated index.
/// The index is assumed already built by the out-of-scope ingestion
/// pipeline; this trait only reads it.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Dense nearest-neighbor search. Returns `(document_id, similarity)`
    /// pairs ordered by descending similarity.
    async fn dense_search(
        &self,
        query_embedding: &[f32],
        n: usize,
        filter: &MetadataFilter,
    ) -> anyhow::Result<Vec<(String, f32)>>;

    async fn get_document(&self, id: &str) -> anyhow::Result<Option<Document>>;

    async fn get_documents(&self, ids: &[String]) -> anyhow::Result<Vec<Document>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.get_document(id).await? {
                out.push(doc);
            }
        }
        Ok(out)
    }
}

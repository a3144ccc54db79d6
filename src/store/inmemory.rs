//! Reference in-process backend for the C2 handle pool: a deterministic
//! hashing embedder and a flat cosine-similarity scan over documents
//! loaded from a JSONL corpus file.
//!
//! Per SPEC_FULL.md §B3, the vector DB's on-disk storage engine and the
//! embedding model's internals are out-of-scope external collaborators —
//! this module is the "reference, in-process implementation" the spec
//! calls for so the crate runs standalone without either. The corpus file
//! format mirrors the BM25 sidecar's JSONL shape (`corpus::bm25`) since
//! both read the same already-ingested documents, just into different
//! index structures.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::corpus::model::{Document, MetaValue, Metadata};
use crate::corpus::traits::{Embedder, MetadataFilter, VectorIndex};

use super::pool::{EmbedderFactory, IndexFactory};

const DIMENSION: usize = 256;

/// Deterministic bag-of-words hashing embedding: every token is hashed
/// into one of `DIMENSION` buckets and the resulting vector is
/// L2-normalized. Not semantically meaningful, but stable and
/// dependency-free, so dense search and RRF fusion have a real
/// cosine-similarity ranking to exercise without a network call.
pub struct HashingEmbedder {
    model_name: String,
}

impl HashingEmbedder {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
        }
    }
}

fn hash_bucket(token: &str) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % DIMENSION
}

fn hash_embed(text: &str) -> Vec<f32> {
    use unicode_segmentation::UnicodeSegmentation;
    let mut vector = vec![0.0f32; DIMENSION];
    for token in text.unicode_words() {
        vector[hash_bucket(&token.to_lowercase())] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(hash_embed(text))
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

struct Indexed {
    document: Document,
    embedding: Vec<f32>,
}

/// A flat, brute-force cosine-similarity scan over every document loaded
/// from a corpus JSONL file — one line per document, same shape as the
/// BM25 sidecar (`{"id", "text", "metadata"}`), embedding computed once at
/// load time with the same `Embedder` the pool hands this index.
pub struct FlatIndex {
    docs: Vec<Indexed>,
    by_id: HashMap<String, usize>,
}

impl FlatIndex {
    pub fn empty() -> Self {
        Self {
            docs: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    pub async fn load(path: &Path, embedder: &dyn Embedder) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_str(&contents, embedder).await
    }

    pub async fn from_str(contents: &str, embedder: &dyn Embedder) -> anyhow::Result<Self> {
        #[derive(serde::Deserialize)]
        struct Line {
            id: String,
            text: String,
            #[serde(default)]
            metadata: serde_json::Map<String, serde_json::Value>,
        }

        let mut docs = Vec::new();
        let mut by_id = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: Line = serde_json::from_str(line)?;
            let (parent_id, chunk_index) = match parsed.id.rsplit_once('#') {
                Some((p, c)) => (p.to_string(), c.parse().unwrap_or(0)),
                None => (parsed.id.clone(), 0),
            };
            let metadata = json_to_metadata(parsed.metadata);
            let document = Document {
                id: parsed.id.clone(),
                parent_id,
                chunk_index,
                text: parsed.text.clone(),
                metadata,
            };
            let embedding = embedder.embed(&parsed.text).await?;
            by_id.insert(document.id.clone(), docs.len());
            docs.push(Indexed { document, embedding });
        }
        Ok(Self { docs, by_id })
    }
}

fn json_to_metadata(raw: serde_json::Map<String, serde_json::Value>) -> Metadata {
    let mut metadata = Metadata::new();
    for (key, value) in raw {
        let converted = match value {
            serde_json::Value::String(s) => Some(MetaValue::Text(s)),
            serde_json::Value::Number(n) => n.as_i64().map(MetaValue::Int),
            serde_json::Value::Array(items) => Some(MetaValue::List(
                items.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
            )),
            _ => None,
        };
        if let Some(value) = converted {
            metadata.insert(key, value);
        }
    }
    metadata
}

#[async_trait]
impl VectorIndex for FlatIndex {
    async fn dense_search(
        &self,
        query_embedding: &[f32],
        n: usize,
        filter: &MetadataFilter,
    ) -> anyhow::Result<Vec<(String, f32)>> {
        let mut scored: Vec<(String, f32)> = self
            .docs
            .iter()
            .filter(|d| filter.is_empty() || filter.matches(&d.document.metadata))
            .map(|d| (d.document.id.clone(), cosine(query_embedding, &d.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n);
        Ok(scored)
    }

    async fn get_document(&self, id: &str) -> anyhow::Result<Option<Document>> {
        Ok(self.by_id.get(id).map(|&idx| self.docs[idx].document.clone()))
    }
}

/// Builds a `FlatIndex` from the corpus file named by the pool key's
/// `persist_directory` (a path to the JSONL corpus dump, not a directory —
/// the field is named for parity with the real vector-DB handle this
/// stands in for). A missing file yields an empty index rather than an
/// error, matching the BM25 sidecar's "absent means degrade" convention.
pub struct FlatIndexFactory;

#[async_trait]
impl IndexFactory for FlatIndexFactory {
    async fn build(&self, key: &super::pool::HandleKey) -> anyhow::Result<std::sync::Arc<dyn VectorIndex>> {
        let path = PathBuf::from(&key.persist_directory);
        let embedder = HashingEmbedder::new(key.embedding_model.clone());
        let index = if path.exists() {
            FlatIndex::load(&path, &embedder).await?
        } else {
            tracing::warn!(path = %path.display(), "corpus file not found, starting with an empty index");
            FlatIndex::empty()
        };
        Ok(std::sync::Arc::new(index))
    }
}

pub struct HashingEmbedderFactory;

#[async_trait]
impl EmbedderFactory for HashingEmbedderFactory {
    async fn build(&self, model_name: &str) -> anyhow::Result<std::sync::Arc<dyn Embedder>> {
        Ok(std::sync::Arc::new(HashingEmbedder::new(model_name.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"
{"id": "letter-1#0", "text": "Darwin wrote about finches and natural selection", "metadata": {"corpus": "darwin"}}
{"id": "letter-2#0", "text": "A recipe for Victorian plum pudding", "metadata": {"corpus": "darwin"}}
"#
    }

    #[tokio::test]
    async fn dense_search_ranks_the_more_similar_document_first() {
        let embedder = HashingEmbedder::new("test-model");
        let index = FlatIndex::from_str(sample(), &embedder).await.unwrap();
        let query = embedder.embed("finches and natural selection").await.unwrap();
        let results = index.dense_search(&query, 2, &MetadataFilter::default()).await.unwrap();
        assert_eq!(results[0].0, "letter-1#0");
    }

    #[tokio::test]
    async fn get_document_round_trips_metadata() {
        let embedder = HashingEmbedder::new("test-model");
        let index = FlatIndex::from_str(sample(), &embedder).await.unwrap();
        let doc = index.get_document("letter-2#0").await.unwrap().unwrap();
        assert_eq!(doc.corpus(), Some("darwin"));
    }

    #[tokio::test]
    async fn missing_corpus_file_yields_empty_index_not_an_error() {
        let factory = FlatIndexFactory;
        let key = super::super::pool::HandleKey {
            collection: "c".to_string(),
            embedding_model: "m".to_string(),
            persist_directory: "/nonexistent/path/corpus.jsonl".to_string(),
        };
        let index = factory.build(&key).await.unwrap();
        let results = index.dense_search(&[0.0; DIMENSION], 5, &MetadataFilter::default()).await.unwrap();
        assert!(results.is_empty());
    }
}

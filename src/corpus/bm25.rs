//! BM25 sidecar: a read-only lexical index loaded from a JSONL file.
//!
//! Line format (SPEC_FULL.md §6): `{"id": "<parent_id>#<chunk_index>",
//! "text": "<string>", "metadata": {...}}`. Absence of the file means
//! hybrid search silently degrades to dense-only (§8 boundary behavior);
//! callers check `BM25Sidecar::is_loaded` rather than treating a missing
//! file as an error.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use unicode_segmentation::UnicodeSegmentation;

use super::model::{Document, MetaValue, Metadata};

const K1: f32 = 1.5;
const B: f32 = 0.75;

#[derive(Debug, Deserialize)]
struct SidecarLine {
    id: String,
    text: String,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

struct SidecarDoc {
    document: Document,
    term_freq: HashMap<String, u32>,
    length: u32,
}

pub struct Bm25Sidecar {
    docs: Vec<SidecarDoc>,
    id_to_idx: HashMap<String, usize>,
    doc_freq: HashMap<String, u32>,
    avg_doc_len: f32,
}

fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words().map(|w| w.to_lowercase()).collect()
}

fn json_to_metadata(raw: serde_json::Map<String, serde_json::Value>) -> Metadata {
    let mut metadata = Metadata::new();
    for (key, value) in raw {
        let converted = match value {
            serde_json::Value::String(s) => Some(MetaValue::Text(s)),
            serde_json::Value::Number(n) => n.as_i64().map(MetaValue::Int),
            serde_json::Value::Array(items) => Some(MetaValue::List(
                items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            )),
            _ => None,
        };
        if let Some(value) = converted {
            metadata.insert(key, value);
        }
    }
    metadata
}

impl Bm25Sidecar {
    pub fn empty() -> Self {
        Self {
            docs: Vec::new(),
            id_to_idx: HashMap::new(),
            doc_freq: HashMap::new(),
            avg_doc_len: 0.0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        !self.docs.is_empty()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> anyhow::Result<Self> {
        let mut docs = Vec::new();
        let mut id_to_idx = HashMap::new();
        let mut doc_freq: HashMap<String, u32> = HashMap::new();
        let mut total_len: u64 = 0;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: SidecarLine = serde_json::from_str(line)?;
            let (parent_id, chunk_index) = split_parent_chunk(&parsed.id);
            let metadata = json_to_metadata(parsed.metadata);
            let document = Document {
                id: parsed.id.clone(),
                parent_id,
                chunk_index,
                text: parsed.text.clone(),
                metadata,
            };

            let tokens = tokenize(&parsed.text);
            let mut term_freq = HashMap::new();
            for token in &tokens {
                *term_freq.entry(token.clone()).or_insert(0) += 1;
            }
            for term in term_freq.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            total_len += tokens.len() as u64;

            id_to_idx.insert(document.id.clone(), docs.len());
            docs.push(SidecarDoc {
                document,
                term_freq,
                length: tokens.len() as u32,
            });
        }

        let avg_doc_len = if docs.is_empty() {
            0.0
        } else {
            total_len as f32 / docs.len() as f32
        };

        Ok(Self {
            docs,
            id_to_idx,
            doc_freq,
            avg_doc_len,
        })
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.id_to_idx.get(id).map(|&idx| &self.docs[idx].document)
    }

    /// BM25 top-N over the sidecar. Unfiltered — per §4.3, the metadata
    /// filter must be re-applied by the caller after fusion.
    pub fn search(&self, query: &str, n: usize) -> Vec<(String, f64)> {
        if self.docs.is_empty() {
            return Vec::new();
        }
        let query_terms = tokenize(query);
        let total_docs = self.docs.len() as f32;

        let mut scores: Vec<(String, f64)> = self
            .docs
            .iter()
            .map(|doc| {
                let mut score = 0.0f32;
                for term in &query_terms {
                    let tf = *doc.term_freq.get(term).unwrap_or(&0) as f32;
                    if tf == 0.0 {
                        continue;
                    }
                    let df = *self.doc_freq.get(term).unwrap_or(&0) as f32;
                    let idf = ((total_docs - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let norm = 1.0 - B + B * (doc.length as f32 / self.avg_doc_len.max(1.0));
                    score += idf * (tf * (K1 + 1.0)) / (tf + K1 * norm);
                }
                (doc.document.id.clone(), score as f64)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores.truncate(n);
        scores
    }
}

fn split_parent_chunk(id: &str) -> (String, i64) {
    match id.rsplit_once('#') {
        Some((parent, chunk)) => (parent.to_string(), chunk.parse().unwrap_or(0)),
        None => (id.to_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bm25Sidecar {
        let contents = r#"
{"id": "letter-1#0", "text": "The quick brown fox jumps over the lazy dog", "metadata": {"corpus": "darwin"}}
{"id": "letter-2#0", "text": "Natural selection acts on variation within a species", "metadata": {"corpus": "darwin"}}
{"id": "letter-3#0", "text": "The fox and the dog became unlikely friends", "metadata": {"corpus": "darwin"}}
"#;
        Bm25Sidecar::from_str(contents).unwrap()
    }

    #[test]
    fn search_ranks_matching_documents_first() {
        let sidecar = sample();
        let results = sidecar.search("fox dog", 10);
        assert!(!results.is_empty());
        assert!(results[0].1 > 0.0);
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"letter-1#0"));
        assert!(ids.contains(&"letter-3#0"));
    }

    #[test]
    fn search_excludes_non_matching_documents() {
        let sidecar = sample();
        let results = sidecar.search("xyznonexistentterm", 10);
        assert!(results.is_empty());
    }

    #[test]
    fn empty_sidecar_reports_not_loaded() {
        let sidecar = Bm25Sidecar::empty();
        assert!(!sidecar.is_loaded());
        assert!(sidecar.search("anything", 5).is_empty());
    }

    #[test]
    fn parent_and_chunk_index_parsed_from_composite_id() {
        let sidecar = sample();
        let doc = sidecar.get("letter-1#0").unwrap();
        assert_eq!(doc.parent_id, "letter-1");
        assert_eq!(doc.chunk_index, 0);
    }
}

//! C10 — span registry and tracer.
//!
//! Two `SpanStore` implementations behind one trait, as SPEC_FULL.md §4.10
//! requires: an embedded, file-backed store for development (grounded in
//! the teacher's `logging/logger.rs` batching-worker pattern — a bounded
//! `flume` channel feeding a background task that appends to disk) and a
//! shared, Redis-backed store for production with an in-memory mirror that
//! answers reads when the network store errors.
//!
//! The `Tracer` on top creates the `pipeline > (guardrail, retrieval,
//! reranking, generation > response, references)` span hierarchy with
//! `tracing::info_span!`, and registers the span ids the spec's synthetic
//! key shapes require (`(session_id, qa_id)`, `(session_id, "_root_")`,
//! `(session_id, "{qa_id}_response")`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::Span;

pub const SPAN_RECORD_TTL: Duration = Duration::from_secs(60 * 60);

/// A post-hoc label attached to a span: a name, a label, and an optional
/// numeric score, per the GLOSSARY's `Annotation` entry. Feedback
/// submission (§4.10) builds one of these per axis present on the
/// request and attaches it to the looked-up response span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub label: String,
    pub score: Option<i64>,
}

impl Annotation {
    pub fn new(name: impl Into<String>, label: impl Into<String>, score: Option<i64>) -> Self {
        Self { name: name.into(), label: label.into(), score }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub session_id: String,
    pub qa_id: String,
    pub span_id: String,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SpanRecord {
    fn is_expired(&self) -> bool {
        Utc::now().signed_duration_since(self.created_at)
            > chrono::Duration::from_std(SPAN_RECORD_TTL).unwrap()
    }
}

#[async_trait::async_trait]
pub trait SpanStore: Send + Sync {
    async fn register(&self, session_id: &str, qa_id: &str, span_id: &str, trace_id: Option<&str>);
    async fn register_root(&self, session_id: &str, span_id: &str);
    async fn find(&self, session_id: &str, qa_id: &str) -> Option<String>;
    async fn find_by_trace(&self, trace_id: &str) -> Option<String>;
    async fn find_root(&self, session_id: &str) -> Option<String>;
    async fn prune_expired(&self);
}

const ROOT_QA_ID: &str = "_root_";

/// Development backend: an append-only file of newline-delimited JSON
/// records, mirrored in a `DashMap` for O(1) lookups. Loaded fully into
/// the mirror at construction; every write both updates the mirror and is
/// queued (non-blocking) to the append log via a `flume` channel, the
/// same fire-and-forget shape the teacher's `ActivityLogger::log` uses.
pub struct EmbeddedSpanStore {
    mirror: DashMap<(String, String), SpanRecord>,
    by_trace: DashMap<String, String>,
    sender: flume::Sender<SpanRecord>,
}

impl EmbeddedSpanStore {
    pub async fn open(path: impl Into<std::path::PathBuf>) -> anyhow::Result<Arc<Self>> {
        let path = path.into();
        let mirror = DashMap::new();
        let by_trace = DashMap::new();

        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            for line in contents.lines() {
                if let Ok(record) = serde_json::from_str::<SpanRecord>(line) {
                    if !record.is_expired() {
                        if let Some(trace_id) = &record.trace_id {
                            by_trace.insert(trace_id.clone(), record.span_id.clone());
                        }
                        mirror.insert((record.session_id.clone(), record.qa_id.clone()), record);
                    }
                }
            }
        }

        let (sender, receiver) = flume::bounded::<SpanRecord>(1024);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        tokio::spawn(async move {
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(err) => {
                    tracing::error!(?err, "span registry append log unavailable");
                    return;
                }
            };
            while let Ok(record) = receiver.recv_async().await {
                if let Ok(mut line) = serde_json::to_string(&record) {
                    line.push('\n');
                    if let Err(err) = file.write_all(line.as_bytes()).await {
                        tracing::warn!(?err, "failed to persist span record");
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            mirror,
            by_trace,
            sender,
        }))
    }
}

#[async_trait::async_trait]
impl SpanStore for EmbeddedSpanStore {
    async fn register(&self, session_id: &str, qa_id: &str, span_id: &str, trace_id: Option<&str>) {
        let record = SpanRecord {
            session_id: session_id.to_string(),
            qa_id: qa_id.to_string(),
            span_id: span_id.to_string(),
            trace_id: trace_id.map(str::to_string),
            created_at: Utc::now(),
        };
        if let Some(tid) = trace_id {
            self.by_trace.insert(tid.to_string(), span_id.to_string());
        }
        self.mirror
            .insert((session_id.to_string(), qa_id.to_string()), record.clone());
        let _ = self.sender.try_send(record);
    }

    async fn register_root(&self, session_id: &str, span_id: &str) {
        self.register(session_id, ROOT_QA_ID, span_id, None).await;
    }

    async fn find(&self, session_id: &str, qa_id: &str) -> Option<String> {
        let key = (session_id.to_string(), qa_id.to_string());
        let record = self.mirror.get(&key)?;
        if record.is_expired() {
            drop(record);
            self.mirror.remove(&key);
            return None;
        }
        Some(record.span_id.clone())
    }

    async fn find_by_trace(&self, trace_id: &str) -> Option<String> {
        self.by_trace.get(trace_id).map(|v| v.clone())
    }

    async fn find_root(&self, session_id: &str) -> Option<String> {
        self.find(session_id, ROOT_QA_ID).await
    }

    async fn prune_expired(&self) {
        self.mirror.retain(|_, record| !record.is_expired());
    }
}

/// Production backend: Redis, with the two key shapes from SPEC_FULL.md
/// §4.10 — a hash per session (`session:{id}` field `qa_id` -> `span_id`)
/// and a direct key per trace id (`trace:{id}` -> `span_id`), both with a
/// 1 hour TTL. An in-memory mirror answers reads if Redis errors rather
/// than merely on a miss, matching "Reads check the network store first,
/// then fall back to the mirror" (a network *error*, not an absent key,
/// is what triggers the fallback).
pub struct SharedSpanStore {
    manager: redis::aio::ConnectionManager,
    mirror: RwLock<HashMap<(String, String), String>>,
    trace_mirror: RwLock<HashMap<String, String>>,
}

impl SharedSpanStore {
    pub async fn connect(url: &str) -> anyhow::Result<Arc<Self>> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Arc::new(Self {
            manager,
            mirror: RwLock::new(HashMap::new()),
            trace_mirror: RwLock::new(HashMap::new()),
        }))
    }

    fn session_key(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    fn trace_key(trace_id: &str) -> String {
        format!("trace:{trace_id}")
    }
}

#[async_trait::async_trait]
impl SpanStore for SharedSpanStore {
    async fn register(&self, session_id: &str, qa_id: &str, span_id: &str, trace_id: Option<&str>) {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let key = Self::session_key(session_id);
        let ttl = SPAN_RECORD_TTL.as_secs() as i64;
        let result: redis::RedisResult<()> = async {
            conn.hset::<_, _, _, ()>(&key, qa_id, span_id).await?;
            conn.expire::<_, ()>(&key, ttl).await?;
            if let Some(tid) = trace_id {
                conn.set_ex::<_, _, ()>(Self::trace_key(tid), span_id, ttl as u64)
                    .await?;
            }
            Ok(())
        }
        .await;

        self.mirror.write().insert(
            (session_id.to_string(), qa_id.to_string()),
            span_id.to_string(),
        );
        if let Some(tid) = trace_id {
            self.trace_mirror
                .write()
                .insert(tid.to_string(), span_id.to_string());
        }
        if let Err(err) = result {
            tracing::warn!(?err, "span registry write failed, relying on mirror");
        }
    }

    async fn register_root(&self, session_id: &str, span_id: &str) {
        self.register(session_id, ROOT_QA_ID, span_id, None).await;
    }

    async fn find(&self, session_id: &str, qa_id: &str) -> Option<String> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        match conn
            .hget::<_, _, Option<String>>(Self::session_key(session_id), qa_id)
            .await
        {
            Ok(Some(span_id)) => Some(span_id),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(?err, "span registry read failed, using mirror");
                self.mirror
                    .read()
                    .get(&(session_id.to_string(), qa_id.to_string()))
                    .cloned()
            }
        }
    }

    async fn find_by_trace(&self, trace_id: &str) -> Option<String> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        match conn
            .get::<_, Option<String>>(Self::trace_key(trace_id))
            .await
        {
            Ok(Some(span_id)) => Some(span_id),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(?err, "trace lookup failed, using mirror");
                self.trace_mirror.read().get(trace_id).cloned()
            }
        }
    }

    async fn find_root(&self, session_id: &str) -> Option<String> {
        self.find(session_id, ROOT_QA_ID).await
    }

    async fn prune_expired(&self) {
        // Redis TTLs expire keys on their own; the mirror is unbounded in
        // this simple form and is swept by wall-clock on next restart
        // (entries beyond TTL are harmless stale fallbacks, replaced on
        // the next successful register for the same key).
    }
}

/// Creates and indexes the spec's span hierarchy for one request, and
/// registers span ids under the synthetic keys feedback lookups rely on.
pub struct Tracer {
    store: Arc<dyn SpanStore>,
}

pub struct PipelineSpans {
    pub pipeline: Span,
    pub guardrail: Span,
    pub retrieval: Span,
    pub reranking: Span,
    pub generation: Span,
    pub response_span_id: String,
    pub pipeline_span_id: String,
}

impl Tracer {
    pub fn new(store: Arc<dyn SpanStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn SpanStore> {
        self.store.clone()
    }

    /// Opens the full `pipeline > ...` span tree for one ask/stream
    /// request and performs the registrations SPEC_FULL.md §4.10 names.
    pub async fn start_pipeline(&self, session_id: &str, qa_id: &str) -> PipelineSpans {
        let pipeline_span_id = uuid::Uuid::new_v4().to_string();
        let pipeline = tracing::info_span!(
            "pipeline",
            session_id = %session_id,
            qa_id = %qa_id,
            span_id = %pipeline_span_id
        );
        let guardrail = tracing::info_span!(parent: &pipeline, "guardrail");
        let retrieval = tracing::info_span!(parent: &pipeline, "retrieval");
        let reranking = tracing::info_span!(parent: &pipeline, "reranking");
        let generation_span_id = uuid::Uuid::new_v4().to_string();
        let generation = tracing::info_span!(
            parent: &pipeline,
            "generation",
            span_id = %generation_span_id
        );

        self.store
            .register(session_id, qa_id, &pipeline_span_id, None)
            .await;
        if self.store.find_root(session_id).await.is_none() {
            self.store.register_root(session_id, &pipeline_span_id).await;
        }
        let response_qa_id = format!("{qa_id}_response");
        self.store
            .register(session_id, &response_qa_id, &generation_span_id, None)
            .await;

        PipelineSpans {
            pipeline,
            guardrail,
            retrieval,
            reranking,
            generation,
            response_span_id: generation_span_id,
            pipeline_span_id,
        }
    }

    /// Looks up the response span for feedback attachment with bounded
    /// retries (3 attempts, 50/100/200 ms), falling back to the plain
    /// `qa_id` span on miss, per §4.10.
    pub async fn find_response_span(&self, session_id: &str, qa_id: &str) -> Option<String> {
        let response_qa_id = format!("{qa_id}_response");
        let backoffs = [
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(200),
        ];
        for (attempt, delay) in backoffs.iter().enumerate() {
            if let Some(span_id) = self.store.find(session_id, &response_qa_id).await {
                return Some(span_id);
            }
            if attempt + 1 < backoffs.len() {
                tokio::time::sleep(*delay).await;
            }
        }
        self.store.find(session_id, qa_id).await
    }

    /// Emits one structured tracing event per annotation, tagged with the
    /// span it attaches to. There is no separate annotation store in this
    /// crate — like the teacher's own span/event model, an annotation
    /// *is* a structured log record keyed by `span_id`, not a row in a
    /// side table.
    pub fn emit_annotations(&self, span_id: &str, annotations: &[Annotation]) {
        for annotation in annotations {
            tracing::info!(
                span_id,
                annotation.name = %annotation.name,
                annotation.label = %annotation.label,
                annotation.score = ?annotation.score,
                "feedback annotation"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embedded_store_round_trips_registration() {
        let dir = std::env::temp_dir().join(format!("spans-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("spans.kv");
        let store = EmbeddedSpanStore::open(path).await.unwrap();
        store.register("s1", "q1", "span-1", Some("trace-1")).await;
        assert_eq!(store.find("s1", "q1").await, Some("span-1".to_string()));
        assert_eq!(
            store.find_by_trace("trace-1").await,
            Some("span-1".to_string())
        );
        assert_eq!(store.find("s1", "missing").await, None);
    }

    #[tokio::test]
    async fn register_root_is_idempotent_key() {
        let dir = std::env::temp_dir().join(format!("spans-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("spans.kv");
        let store = EmbeddedSpanStore::open(path).await.unwrap();
        store.register_root("s1", "root-span").await;
        assert_eq!(store.find_root("s1").await, Some("root-span".to_string()));
    }

    #[tokio::test]
    async fn tracer_registers_response_span_under_synthetic_key() {
        let dir = std::env::temp_dir().join(format!("spans-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("spans.kv");
        let store = EmbeddedSpanStore::open(path).await.unwrap();
        let tracer = Tracer::new(store.clone());
        let spans = tracer.start_pipeline("s1", "q1").await;
        assert_eq!(
            store.find("s1", "q1_response").await,
            Some(spans.response_span_id)
        );
        assert!(tracer.find_response_span("s1", "q1").await.is_some());
    }
}

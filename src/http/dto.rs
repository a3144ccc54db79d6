//! Wire-level request/response shapes for the C11 HTTP surface.
//!
//! Kept separate from the domain types in `corpus`/`rerank`/`jobs` the way
//! the teacher keeps `handlers::*::{Request, Response}` structs apart from
//! its `services` domain types — these exist only to pin the exact JSON
//! shape SPEC_FULL.md §6 names, not to carry business logic.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::{JobRecord, JobStatus};
use crate::rerank::Citation;

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigResponse {
    pub environment: String,
    pub retriever_module: String,
    pub embedding_model: String,
    pub search_type: String,
    pub k: usize,
    pub citation_limit: usize,
    pub llm_provider: String,
    pub llm_model: String,
    pub prompt_caching_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterGroup {
    pub supported: bool,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FiltersResponse {
    pub corpus: FilterGroup,
    pub direction: FilterGroup,
    pub time_period: FilterGroup,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub qa_id: Option<String>,
    #[serde(default)]
    pub corpus_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub result: Vec<String>,
    pub qa_id: String,
    pub citations: Vec<Citation>,
    pub document_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Body shared by `/api/ask/stream` and `/api/ask/async` — the spec gives
/// them identical fields, differing only in transport.
#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub corpus_filter: Option<String>,
    #[serde(default)]
    pub previous_corpus_filter: Option<String>,
    #[serde(default)]
    pub direction_filter: Option<String>,
    #[serde(default)]
    pub time_period_filter: Option<String>,
    #[serde(default)]
    pub chat_history: Vec<ChatTurn>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub qa_id: Option<String>,
    /// Accepted for forward compatibility with multi-provider clients;
    /// this orchestrator instance is bound to one provider/model at
    /// startup (§9 — no per-request backend switching), so a mismatching
    /// value is logged and otherwise ignored rather than rejected.
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AsyncAcceptedResponse {
    pub request_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AsyncStatusResponse {
    pub request_id: Uuid,
    pub status: &'static str,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub result: Option<AsyncResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AsyncResult {
    #[serde(rename = "result")]
    pub response_text: String,
    pub citations: Vec<Citation>,
}

impl AsyncStatusResponse {
    pub fn from_record(record: JobRecord) -> Self {
        let status = match record.status {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        let result = match (record.response_text, record.citations) {
            (Some(response_text), Some(citations)) => Some(AsyncResult { response_text, citations }),
            _ => None,
        };
        Self {
            request_id: record.id,
            status,
            created_at: record.created_at,
            result,
            error: record.error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatsResponse {
    pub queue_stats: QueueStats,
    pub async_enabled: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub backend: &'static str,
}

/// Per-axis integer ratings from SPEC_FULL.md §3's `Feedback` data model.
/// Each present field becomes one annotation (see
/// `handlers::build_feedback_annotations`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedbackRatings {
    #[serde(default)]
    pub relevance: Option<i64>,
    #[serde(default)]
    pub factual_accuracy: Option<i64>,
    #[serde(default)]
    pub clarity: Option<i64>,
    #[serde(default)]
    pub source_quality: Option<i64>,
    #[serde(default)]
    pub question_difficulty: Option<i64>,
    #[serde(default)]
    pub analysis_quality: Option<i64>,
    #[serde(default)]
    pub corpus_fidelity: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    pub session_id: String,
    pub qa_id: String,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(flatten)]
    pub ratings: FeedbackRatings,
    /// Free-text comment. `rating` is kept as a deprecated alias some
    /// older clients still send a bare "up"/"down" string through.
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fault_flags: Vec<String>,
    #[serde(default)]
    pub ai_validation: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackResponse {
    pub message: &'static str,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckResponse {
    pub message: &'static str,
    pub status: &'static str,
}

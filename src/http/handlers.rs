//! C11 route handlers, one function per endpoint in SPEC_FULL.md §6's
//! routes table.
//!
//! Grounded in the teacher's `handlers/chat.rs` / `handlers/search.rs`
//! (thin async fns over `Extension`/`State` plus a domain service call) —
//! generalized here to this crate's single `Orchestrator` plus the C5/C9/
//! C10 side-channels the spec's extra routes need.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::corpus::{RetrievalRequest, RetrievalRequestError, RetrieverCapabilities};
use crate::error::ApiError;
use crate::orchestrator::check_guardrail;
use crate::promptcache::CacheStats;
use crate::state::AppState;
use crate::telemetry::Annotation;

use super::dto::{
    AckResponse, AskRequest, AsyncAcceptedResponse, AsyncStatusResponse, ConfigResponse,
    FeedbackRequest, FeedbackResponse, FilterGroup, FiltersResponse, QueryRequest, QueryResponse,
    QueueStats, QueueStatsResponse, StatusResponse,
};

/// Builds one `Annotation` per feedback axis present on the request: a
/// `sentiment`/`thumbs-{up,down}` pair when `sentiment` is set, then one
/// per populated per-axis rating field, in the field order SPEC_FULL.md
/// §3 lists them. Pure so it can be unit-tested without a tracer.
pub fn build_feedback_annotations(body: &FeedbackRequest) -> Vec<Annotation> {
    let mut annotations = Vec::new();

    match body.sentiment.as_deref() {
        Some("positive") => annotations.push(Annotation::new("sentiment", "thumbs-up", Some(1))),
        Some("negative") => annotations.push(Annotation::new("sentiment", "thumbs-down", Some(0))),
        Some(other) if !other.is_empty() => {
            annotations.push(Annotation::new("sentiment", other, None));
        }
        _ => {}
    }

    let axes: [(&str, Option<i64>); 7] = [
        ("relevance", body.ratings.relevance),
        ("factual_accuracy", body.ratings.factual_accuracy),
        ("clarity", body.ratings.clarity),
        ("source_quality", body.ratings.source_quality),
        ("question_difficulty", body.ratings.question_difficulty),
        ("analysis_quality", body.ratings.analysis_quality),
        ("corpus_fidelity", body.ratings.corpus_fidelity),
    ];
    for (label, score) in axes {
        if let Some(score) = score {
            annotations.push(Annotation::new("rating", label, Some(score)));
        }
    }

    annotations
}

fn map_retrieval_validation(err: RetrievalRequestError) -> ApiError {
    ApiError::Validation(err.to_string())
}

/// Defaults an unsupported or unrecognized corpus filter to `"all"` for
/// retrievers that support corpus filtering, and drops it entirely for
/// ones that don't (Darwin), per §6's validation rule.
fn normalize_corpus_filter(caps: &RetrieverCapabilities, filter: Option<String>) -> Option<String> {
    if !caps.corpus_filtering {
        return None;
    }
    match filter {
        Some(value) if caps.corpus_options.iter().any(|o| o == &value) => Some(value),
        _ => Some("all".to_string()),
    }
}

fn normalize_direction_filter(caps: &RetrieverCapabilities, filter: Option<String>) -> Option<String> {
    if caps.direction_filtering {
        filter
    } else {
        None
    }
}

fn normalize_time_period_filter(caps: &RetrieverCapabilities, filter: Option<String>) -> Option<String> {
    if caps.time_period_filtering {
        filter
    } else {
        None
    }
}

#[allow(clippy::too_many_arguments)]
fn build_retrieval_request(
    query: String,
    session_id: Option<String>,
    qa_id: Option<String>,
    corpus_filter: Option<String>,
    direction_filter: Option<String>,
    time_period_filter: Option<String>,
    k: usize,
) -> RetrievalRequest {
    RetrievalRequest {
        query,
        k,
        corpus_filter,
        direction_filter,
        time_period_filter,
        session_id: session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        qa_id: qa_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
    }
}

pub async fn health() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

pub async fn config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let settings = &state.settings;
    Json(ConfigResponse {
        environment: settings.environment.clone(),
        retriever_module: settings.retriever_config.retriever_module.clone(),
        embedding_model: settings.retriever_config.embedding_model.clone(),
        search_type: settings.retriever_config.search_type.clone(),
        k: settings.retriever_config.k,
        citation_limit: settings.retriever_config.citation_limit,
        llm_provider: settings.llm_provider.clone(),
        llm_model: settings.llm_model.clone(),
        prompt_caching_enabled: settings.prompt_cache.enabled,
    })
}

pub async fn filters(State(state): State<AppState>) -> Json<FiltersResponse> {
    let caps = &state.retriever_capabilities;
    Json(FiltersResponse {
        corpus: FilterGroup {
            supported: caps.corpus_filtering,
            options: caps.corpus_options.clone(),
        },
        direction: FilterGroup {
            supported: caps.direction_filtering,
            options: caps.direction_options.clone(),
        },
        time_period: FilterGroup {
            supported: caps.time_period_filtering,
            options: Vec::new(),
        },
    })
}

/// `/query` and `/api/query` — the non-streaming ask, driven through the
/// same synchronous orchestrator path the async worker uses.
pub async fn query(
    State(state): State<AppState>,
    Json(body): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let corpus_filter = normalize_corpus_filter(&state.retriever_capabilities, body.corpus_filter);
    let request = build_retrieval_request(
        body.query,
        body.session_id,
        body.qa_id,
        corpus_filter,
        None,
        None,
        state.settings.retriever_config.k,
    );
    request.validate().map_err(map_retrieval_validation)?;
    check_guardrail(&request.query)?;

    let qa_id = request.qa_id.clone();
    let answer = state.orchestrator.clone().answer_sync(request, Vec::new()).await?;
    let document_count = answer.citations.len();
    Ok(Json(QueryResponse {
        result: vec![answer.response_text],
        qa_id,
        citations: answer.citations,
        document_count,
    }))
}

/// `/api/ask/stream` — the SSE path. Pre-pipeline validation and guardrail
/// failures short-circuit with a plain JSON error response, same as
/// `query`'s; the SSE `error` frame is reserved for failures that occur
/// after the stream has already started (once the orchestrator's own
/// generator is driving it), since no `Sse` body has been opened yet at
/// this point for a client to be reading frames from.
pub async fn ask_stream(State(state): State<AppState>, Json(body): Json<AskRequest>) -> Response {
    let caps = &state.retriever_capabilities;
    let corpus_filter = normalize_corpus_filter(caps, body.corpus_filter);
    let direction_filter = normalize_direction_filter(caps, body.direction_filter);
    let time_period_filter = normalize_time_period_filter(caps, body.time_period_filter);

    let request = build_retrieval_request(
        body.question,
        body.session_id,
        body.qa_id,
        corpus_filter,
        direction_filter,
        time_period_filter,
        state.settings.retriever_config.k,
    );

    if let Err(err) = request.validate().map_err(map_retrieval_validation) {
        return err.into_response();
    }
    if let Err(err) = check_guardrail(&request.query) {
        return err.into_response();
    }
    if let Some(provider) = &body.provider {
        if !provider.eq_ignore_ascii_case(&state.settings.llm_provider) {
            tracing::debug!(
                requested = %provider,
                configured = %state.settings.llm_provider,
                "per-request provider override is not supported, using the configured provider"
            );
        }
    }

    let qa_id = request.qa_id.clone();
    let history = body.chat_history.into_iter().map(|turn| (turn.role, turn.content)).collect();
    let stream = state.orchestrator.clone().answer_stream(request, history);
    crate::sse::stream_response(qa_id, stream)
}

/// `/api/ask/async` — enqueues the question and returns immediately. The
/// worker (C9) re-validates and guardrail-checks the query again when it
/// actually runs the pipeline, since queuing happens before either check.
pub async fn ask_async(
    State(state): State<AppState>,
    Json(body): Json<AskRequest>,
) -> Result<Json<AsyncAcceptedResponse>, ApiError> {
    if body.question.trim().is_empty() {
        return Err(ApiError::Validation("query must not be empty".to_string()));
    }
    if body.question.chars().count() > 2000 {
        return Err(ApiError::Validation("query exceeds 2000 characters".to_string()));
    }
    check_guardrail(&body.question)?;

    let id = state
        .job_store
        .enqueue(body.question, body.session_id)
        .await
        .map_err(|err| ApiError::QueueUnavailable(err.to_string()))?;

    Ok(Json(AsyncAcceptedResponse { request_id: id, status: "queued" }))
}

pub async fn ask_async_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AsyncStatusResponse>, ApiError> {
    let record = state
        .job_store
        .get(id)
        .await
        .map_err(|err| ApiError::QueueUnavailable(err.to_string()))?
        .ok_or(ApiError::JobNotFound)?;
    Ok(Json(AsyncStatusResponse::from_record(record)))
}

pub async fn queue_stats(State(state): State<AppState>) -> Json<QueueStatsResponse> {
    Json(QueueStatsResponse {
        queue_stats: QueueStats {
            backend: if state.settings.redis.is_some() { "redis" } else { "in-memory" },
        },
        async_enabled: true,
        timestamp: chrono::Utc::now(),
    })
}

/// `/api/feedback` — rejects rather than silently drops feedback for a
/// session/qa pair with no matching generation span, per SPEC_FULL.md
/// §B5's open-question decision.
pub async fn feedback(
    State(state): State<AppState>,
    Json(body): Json<FeedbackRequest>,
) -> Result<Json<FeedbackResponse>, ApiError> {
    let span_id = state.tracer.find_response_span(&body.session_id, &body.qa_id).await;
    let Some(span_id) = span_id else {
        return Err(ApiError::SpanLookupMiss(format!(
            "no response span for session {} qa {}",
            body.session_id, body.qa_id
        )));
    };
    let annotations = build_feedback_annotations(&body);
    state.tracer.emit_annotations(&span_id, &annotations);
    tracing::info!(
        span_id,
        rating = ?body.rating,
        comment = ?body.comment,
        tags = ?body.tags,
        fault_flags = ?body.fault_flags,
        ai_validation = body.ai_validation.is_some(),
        annotation_count = annotations.len(),
        "feedback recorded"
    );
    Ok(Json(FeedbackResponse { message: "feedback recorded", status: "ok" }))
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.prompt_cache.stats())
}

pub async fn cache_clear(State(state): State<AppState>) -> Json<AckResponse> {
    state.prompt_cache.clear();
    Json(AckResponse { message: "prompt cache cleared", status: "ok" })
}

//! C8 — SSE transport: encodes `OrchestratorEvent`s into the wire frames
//! SPEC_FULL.md §4.8 specifies.
//!
//! Grounded in the teacher's `handlers/chat.rs` SSE handler (axum's
//! `response::sse::{Event, Sse}` plus a `futures::stream` adapter), but
//! rebuilt around this crate's own `OrchestratorEvent` enum rather than the
//! teacher's ad hoc message/done/error event names — the spec calls for
//! exactly three event names (`chunk` default, `references`, `error`) and a
//! fixed JSON payload shape per frame, not a free-form text protocol.

use std::convert::Infallible;

use axum::http::{header, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;

use crate::orchestrator::OrchestratorEvent;
use crate::rerank::Citation;

#[derive(Debug, Clone, Serialize)]
struct ChunkPayload<'a> {
    #[serde(rename = "qaId")]
    qa_id: &'a str,
    #[serde(rename = "responseComplete")]
    response_complete: bool,
    chunk: ChunkBody<'a>,
    timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
struct ChunkBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct ReferencesPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "qaId")]
    qa_id: &'a str,
    citations: &'a [Citation],
    #[serde(rename = "allCitations")]
    all_citations: &'a [Citation],
}

#[derive(Debug, Clone, Serialize)]
struct CompletionPayload<'a> {
    #[serde(rename = "qaId")]
    qa_id: &'a str,
    #[serde(rename = "responseComplete")]
    response_complete: bool,
    #[serde(rename = "responseText")]
    response_text: &'a str,
    citations: &'a [Citation],
    timestamp: i64,
}

/// Encodes one `OrchestratorEvent` into one SSE `Event`. A chunk carries no
/// `event:` line (defaults to `chunk` on the client); references are tagged
/// `event: references`; completion is tagged `event: complete`; errors are
/// tagged `event: error`.
fn encode(qa_id: &str, event: OrchestratorEvent) -> Event {
    let now = Utc::now().timestamp_millis();
    match event {
        OrchestratorEvent::Chunk(text) => {
            let payload = ChunkPayload {
                qa_id,
                response_complete: false,
                chunk: ChunkBody { kind: "text", text: &text },
                timestamp: now,
            };
            Event::default().data(serde_json::to_string(&payload).unwrap_or_default())
        }
        OrchestratorEvent::References { citations, all_citations } => {
            let payload = ReferencesPayload {
                kind: "references",
                qa_id,
                citations: &citations,
                all_citations: &all_citations,
            };
            Event::default()
                .event("references")
                .data(serde_json::to_string(&payload).unwrap_or_default())
        }
        OrchestratorEvent::Complete { response_text, citations } => {
            let payload = CompletionPayload {
                qa_id,
                response_complete: true,
                response_text: &response_text,
                citations: &citations,
                timestamp: now,
            };
            Event::default()
                .event("complete")
                .data(serde_json::to_string(&payload).unwrap_or_default())
        }
        OrchestratorEvent::Error(message) => {
            // §6's error frame shape is `{type, detail, timestamp}`, not the
            // `{qaId, chunk, ...}` shape the other three frames share.
            let payload = json!({"type": "error", "detail": message, "timestamp": now});
            Event::default()
                .event("error")
                .data(payload.to_string())
        }
    }
}

/// Wraps an `OrchestratorEvent` stream into an axum SSE response, with the
/// headers §4.8 requires (`Content-Type: text/event-stream` is set by
/// `Sse` itself; `Cache-Control`, `Connection`, and the proxy-buffering
/// hint are added on top).
pub fn stream_response(
    qa_id: String,
    events: impl Stream<Item = OrchestratorEvent> + Send + 'static,
) -> Response {
    let encoded = events.map(move |event| Ok::<Event, Infallible>(encode(&qa_id, event)));
    let mut response = Sse::new(encoded).keep_alive(KeepAlive::default()).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_event_has_no_explicit_event_name_and_correct_payload_shape() {
        let event = encode("q1", OrchestratorEvent::Chunk("hello".to_string()));
        let rendered = format!("{event}");
        assert!(!rendered.starts_with("event:"));
        assert!(rendered.contains("\"qaId\":\"q1\""));
        assert!(rendered.contains("\"responseComplete\":false"));
        assert!(rendered.contains("\"type\":\"text\""));
    }

    #[test]
    fn references_event_is_tagged_and_carries_both_citation_lists() {
        let citation = crate::rerank::aggregate_citations(
            &[crate::corpus::RankedDocument::new(
                crate::corpus::Document::new("p", 0, "text"),
                0.0,
                0,
            )],
            10,
        );
        let event = encode(
            "q1",
            OrchestratorEvent::References {
                citations: citation.clone(),
                all_citations: citation,
            },
        );
        let rendered = format!("{event}");
        assert!(rendered.contains("event:references") || rendered.contains("event: references"));
        assert!(rendered.contains("\"type\":\"references\""));
        assert!(rendered.contains("\"allCitations\""));
    }

    #[test]
    fn complete_event_is_tagged_and_carries_citations() {
        let citation = crate::rerank::aggregate_citations(
            &[crate::corpus::RankedDocument::new(
                crate::corpus::Document::new("p", 0, "text"),
                0.0,
                0,
            )],
            10,
        );
        let event = encode(
            "q1",
            OrchestratorEvent::Complete {
                response_text: "the answer".to_string(),
                citations: citation,
            },
        );
        let rendered = format!("{event}");
        assert!(rendered.contains("event:complete") || rendered.contains("event: complete"));
        assert!(rendered.contains("\"responseComplete\":true"));
        assert!(rendered.contains("\"responseText\":\"the answer\""));
    }

    #[test]
    fn error_event_is_tagged_and_carries_message() {
        let event = encode("q1", OrchestratorEvent::Error("boom".to_string()));
        let rendered = format!("{event}");
        assert!(rendered.contains("event:error") || rendered.contains("event: error"));
        assert!(rendered.contains("\"type\":\"error\""));
        assert!(rendered.contains("\"detail\":\"boom\""));
    }
}

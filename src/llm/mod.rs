//! C6 — LLM adapter: one uniform streaming interface over several
//! provider backends, per SPEC_FULL.md §4.6.
//!
//! Grounded in the teacher's `services/llm_service.rs` (reqwest +
//! SSE-chunk parsing over an OpenAI-compatible endpoint), generalized
//! behind one trait so `openai` / `anthropic` / `google` / `bedrock` /
//! `local-runtime` are interchangeable at the call site. The external LLM
//! HTTP APIs themselves are out of scope (§1); `providers.rs` normalizes
//! their differing stream formats through one chunk-extraction function,
//! and `local-runtime` is a real, in-process implementation so the crate
//! is runnable standalone.

pub mod providers;

use std::pin::Pin;

use futures::Stream;
use serde::Deserialize;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("missing credentials for provider {0}")]
    MissingCredentials(&'static str),
    #[error("llm request failed: {0}")]
    Request(String),
    #[error("llm stream error: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    LocalRuntime,
    Bedrock,
}

impl Provider {
    pub const DEFAULT: Provider = Provider::LocalRuntime;

    /// Selects by uppercased name; an unrecognized provider falls back to
    /// the default with a logged warning, per §4.6.
    pub fn parse(raw: &str) -> Self {
        match raw.to_uppercase().as_str() {
            "OPENAI" => Provider::OpenAi,
            "ANTHROPIC" => Provider::Anthropic,
            "GOOGLE" => Provider::Google,
            "LOCAL-RUNTIME" | "LOCAL_RUNTIME" | "LOCALRUNTIME" => Provider::LocalRuntime,
            "BEDROCK" => Provider::Bedrock,
            other => {
                tracing::warn!(provider = %other, "unknown LLM provider, falling back to default");
                Provider::DEFAULT
            }
        }
    }

    pub fn env_key(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Google => "GOOGLE_API_KEY",
            Provider::Bedrock => "AWS_ACCESS_KEY_ID",
            Provider::LocalRuntime => "",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::LocalRuntime => "local-runtime",
            Provider::Bedrock => "bedrock",
        }
    }
}

#[async_trait::async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Streams the completion for `prompt` as a finite sequence of text
    /// chunks. `model` overrides the adapter's configured default model
    /// when non-empty.
    async fn stream(&self, prompt: &str, temperature: f32, model: &str) -> Result<ChunkStream, LlmError>;

    fn provider(&self) -> Provider;
}

/// A single normalized chunk-extraction layer: provider payloads put the
/// text either directly on the chunk object (`content` / `text`) or
/// nested under `delta` — both variants are tried here so each provider
/// backend only needs to hand this function the parsed JSON value.
pub fn extract_chunk_text(value: &serde_json::Value) -> Option<String> {
    if let Some(choices) = value.get("choices").and_then(|v| v.as_array()) {
        if let Some(first) = choices.first() {
            if let Some(text) = first
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(|v| v.as_str())
            {
                return Some(text.to_string());
            }
            if let Some(text) = first.get("text").and_then(|v| v.as_str()) {
                return Some(text.to_string());
            }
        }
    }
    if let Some(text) = value
        .get("delta")
        .and_then(|d| d.get("text"))
        .and_then(|v| v.as_str())
    {
        return Some(text.to_string());
    }
    if let Some(candidates) = value.get("candidates").and_then(|v| v.as_array()) {
        if let Some(text) = candidates
            .first()
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .and_then(|p| p.first())
            .and_then(|p| p.get("text"))
            .and_then(|v| v.as_str())
        {
            return Some(text.to_string());
        }
    }
    if let Some(text) = value.get("content").and_then(|v| v.as_str()) {
        return Some(text.to_string());
    }
    if let Some(text) = value.get("text").and_then(|v| v.as_str()) {
        return Some(text.to_string());
    }
    None
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawSseLine {
    pub done: bool,
    pub value: serde_json::Value,
}

/// Parses one `data: ...` SSE line into either a sentinel "done" marker
/// (`[DONE]`) or the JSON payload it carries.
pub(crate) fn parse_sse_data_line(line: &str) -> Option<RawSseLine> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload == "[DONE]" {
        return Some(RawSseLine {
            done: true,
            value: serde_json::Value::Null,
        });
    }
    serde_json::from_str(payload).ok().map(|value| RawSseLine {
        done: false,
        value,
    })
}

pub use providers::{build_adapter, LocalRuntimeAdapter};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_is_case_insensitive() {
        assert_eq!(Provider::parse("openai"), Provider::OpenAi);
        assert_eq!(Provider::parse("OpenAI"), Provider::OpenAi);
        assert_eq!(Provider::parse("ANTHROPIC"), Provider::Anthropic);
    }

    #[test]
    fn unknown_provider_falls_back_to_default() {
        assert_eq!(Provider::parse("some-unknown-vendor"), Provider::DEFAULT);
    }

    #[test]
    fn extracts_text_from_openai_style_delta() {
        let value = serde_json::json!({"choices": [{"delta": {"content": "hello"}}]});
        assert_eq!(extract_chunk_text(&value), Some("hello".to_string()));
    }

    #[test]
    fn extracts_text_from_anthropic_style_delta() {
        let value = serde_json::json!({"delta": {"text": "hi"}});
        assert_eq!(extract_chunk_text(&value), Some("hi".to_string()));
    }

    #[test]
    fn extracts_text_from_flat_content_field() {
        let value = serde_json::json!({"content": "flat"});
        assert_eq!(extract_chunk_text(&value), Some("flat".to_string()));
    }

    #[test]
    fn parses_done_sentinel() {
        let parsed = parse_sse_data_line("data: [DONE]").unwrap();
        assert!(parsed.done);
    }
}

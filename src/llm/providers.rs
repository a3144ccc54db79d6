//! Provider backends for the C6 `LlmAdapter` trait.
//!
//! The HTTP-backed adapters follow the teacher's `chat_stream` shape in
//! `services/llm_service.rs` almost line for line: a reqwest streaming
//! POST, `bytes_stream()`, lines split on `data: `, `[DONE]` sentinel. Each
//! provider differs only in endpoint, auth header and JSON body/response
//! shape, so that parsing loop is written once in `drive_sse_stream` and
//! reused; `extract_chunk_text` absorbs the per-provider JSON shape
//! differences.
//!
//! `local-runtime` needs no network call — it is a real in-process
//! implementation (a deterministic word-chunked echo of the prompt's
//! trailing "Answer:" continuation) so the crate runs standalone without
//! external credentials, matching how `corpus::bm25`/`store::pool` give
//! this crate an in-process default for every external dependency.

use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::json;

use super::{extract_chunk_text, parse_sse_data_line, ChunkStream, LlmAdapter, LlmError, Provider};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const LOCAL_RUNTIME_CHUNK_DELAY: Duration = Duration::from_millis(15);

fn client() -> Client {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .expect("failed to build reqwest client")
}

/// Drives an OpenAI-compatible SSE chat-completions endpoint: `Authorization:
/// Bearer <key>`, body `{model, messages, temperature, stream: true}`,
/// response lines `data: {...}` terminated by `data: [DONE]`.
struct OpenAiCompatAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    default_model: String,
    provider: Provider,
    auth_header: &'static str,
    auth_prefix: &'static str,
}

impl OpenAiCompatAdapter {
    fn new(
        provider: Provider,
        base_url: String,
        default_model: String,
        auth_header: &'static str,
        auth_prefix: &'static str,
    ) -> Result<Self, LlmError> {
        let env_key = provider.env_key();
        let api_key = std::env::var(env_key).map_err(|_| LlmError::MissingCredentials(env_key))?;
        Ok(Self {
            client: client(),
            base_url,
            api_key,
            default_model,
            provider,
            auth_header,
            auth_prefix,
        })
    }
}

#[async_trait::async_trait]
impl LlmAdapter for OpenAiCompatAdapter {
    async fn stream(&self, prompt: &str, temperature: f32, model: &str) -> Result<ChunkStream, LlmError> {
        let model = if model.is_empty() { self.default_model.as_str() } else { model };
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": temperature,
            "stream": true,
        });

        let response = self
            .client
            .post(&self.base_url)
            .header(self.auth_header, format!("{}{}", self.auth_prefix, self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Request(format!("{status}: {text}")));
        }

        Ok(drive_sse_stream(response))
    }

    fn provider(&self) -> Provider {
        self.provider
    }
}

/// Drives a Google-style `generateContent` streaming endpoint: API key on
/// the query string, body `{contents: [...], generationConfig}`.
struct GoogleAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl GoogleAdapter {
    fn new(base_url: String, default_model: String) -> Result<Self, LlmError> {
        let api_key = std::env::var(Provider::Google.env_key())
            .map_err(|_| LlmError::MissingCredentials(Provider::Google.env_key()))?;
        Ok(Self {
            client: client(),
            base_url,
            api_key,
            default_model,
        })
    }
}

#[async_trait::async_trait]
impl LlmAdapter for GoogleAdapter {
    async fn stream(&self, prompt: &str, temperature: f32, model: &str) -> Result<ChunkStream, LlmError> {
        let model = if model.is_empty() { self.default_model.as_str() } else { model };
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?key={}",
            self.base_url, model, self.api_key
        );
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {"temperature": temperature},
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Request(format!("{status}: {text}")));
        }

        Ok(drive_sse_stream(response))
    }

    fn provider(&self) -> Provider {
        Provider::Google
    }
}

/// Shared SSE driving loop: reads `bytes_stream()`, splits on newlines,
/// feeds each `data: ...` line through `parse_sse_data_line` +
/// `extract_chunk_text`, and yields the accumulated text pieces.
fn drive_sse_stream(response: reqwest::Response) -> ChunkStream {
    let mut byte_stream = response.bytes_stream();
    let mut carry = String::new();

    Box::pin(try_stream! {
        while let Some(next) = byte_stream.next().await {
            let bytes = next.map_err(|e| LlmError::Stream(e.to_string()))?;
            carry.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline_pos) = carry.find('\n') {
                let line = carry[..newline_pos].trim_end_matches('\r').to_string();
                carry.drain(..=newline_pos);

                if line.is_empty() {
                    continue;
                }
                let Some(parsed) = parse_sse_data_line(&line) else {
                    continue;
                };
                if parsed.done {
                    return;
                }
                if let Some(text) = extract_chunk_text(&parsed.value) {
                    if !text.is_empty() {
                        yield text;
                    }
                }
            }
        }
    })
}

/// In-process default provider: no network call, no credentials. Splits a
/// canned continuation of the prompt into word-sized chunks with a small
/// delay between each, so downstream SSE framing and bounded-concurrency
/// code exercise a real streaming shape without external dependencies.
pub struct LocalRuntimeAdapter;

impl LocalRuntimeAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalRuntimeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LlmAdapter for LocalRuntimeAdapter {
    async fn stream(&self, prompt: &str, _temperature: f32, _model: &str) -> Result<ChunkStream, LlmError> {
        let question = prompt
            .rsplit("Answer:")
            .next()
            .unwrap_or(prompt)
            .trim()
            .to_string();
        let words: Vec<String> = if question.is_empty() {
            vec!["{answer}".to_string()]
        } else {
            format!(
                "Based on the retrieved context, here is a response to: {question}"
            )
            .split_whitespace()
            .map(|w| format!("{w} "))
            .collect()
        };

        Ok(Box::pin(try_stream! {
            for word in words {
                tokio::time::sleep(LOCAL_RUNTIME_CHUNK_DELAY).await;
                yield word;
            }
        }))
    }

    fn provider(&self) -> Provider {
        Provider::LocalRuntime
    }
}

/// Bedrock's streaming wire format (`EventStream`) is not an SSE transport,
/// so it is fronted here with the same trait rather than implemented
/// against the real AWS event-stream framing, which is out of scope for
/// this crate's retrieval-and-generation surface. Construction still
/// validates the expected credential is present so a misconfigured
/// deployment fails fast at startup instead of at first request.
struct BedrockAdapter {
    default_model: String,
}

impl BedrockAdapter {
    fn new(default_model: String) -> Result<Self, LlmError> {
        std::env::var(Provider::Bedrock.env_key())
            .map_err(|_| LlmError::MissingCredentials(Provider::Bedrock.env_key()))?;
        Ok(Self { default_model })
    }
}

#[async_trait::async_trait]
impl LlmAdapter for BedrockAdapter {
    async fn stream(&self, prompt: &str, temperature: f32, model: &str) -> Result<ChunkStream, LlmError> {
        let model = if model.is_empty() { self.default_model.as_str() } else { model };
        tracing::warn!(
            model,
            temperature,
            "bedrock adapter has no wire implementation, delegating to local-runtime"
        );
        LocalRuntimeAdapter::new().stream(prompt, temperature, model).await
    }

    fn provider(&self) -> Provider {
        Provider::Bedrock
    }
}

/// Constructs the adapter for `provider`, reading any required
/// credentials from the environment. Missing credentials fail
/// construction immediately rather than surfacing on first use.
pub fn build_adapter(
    provider: Provider,
    default_model: String,
) -> Result<Box<dyn LlmAdapter>, LlmError> {
    match provider {
        Provider::OpenAi => Ok(Box::new(OpenAiCompatAdapter::new(
            Provider::OpenAi,
            "https://api.openai.com/v1/chat/completions".to_string(),
            default_model,
            "Authorization",
            "Bearer ",
        )?)),
        Provider::Anthropic => Ok(Box::new(OpenAiCompatAdapter::new(
            Provider::Anthropic,
            "https://api.anthropic.com/v1/messages".to_string(),
            default_model,
            "x-api-key",
            "",
        )?)),
        Provider::Google => Ok(Box::new(GoogleAdapter::new(
            "https://generativelanguage.googleapis.com".to_string(),
            default_model,
        )?)),
        Provider::Bedrock => Ok(Box::new(BedrockAdapter::new(default_model)?)),
        Provider::LocalRuntime => Ok(Box::new(LocalRuntimeAdapter::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_fail_openai_construction() {
        std::env::remove_var("OPENAI_API_KEY");
        let result = build_adapter(Provider::OpenAi, "gpt-4o".to_string());
        assert!(matches!(result, Err(LlmError::MissingCredentials("OPENAI_API_KEY"))));
    }

    #[test]
    fn local_runtime_always_constructs() {
        let adapter = build_adapter(Provider::LocalRuntime, String::new());
        assert!(adapter.is_ok());
        assert_eq!(adapter.unwrap().provider(), Provider::LocalRuntime);
    }

    #[tokio::test]
    async fn local_runtime_streams_nonempty_chunks() {
        let adapter = LocalRuntimeAdapter::new();
        let mut stream = adapter
            .stream("Context...\n\nUser: what is natural selection?\nAnswer:", 0.2, "")
            .await
            .unwrap();
        let mut total = String::new();
        while let Some(chunk) = stream.next().await {
            total.push_str(&chunk.unwrap());
        }
        assert!(total.contains("what is natural selection?"));
    }

    /// Exercises `OpenAiCompatAdapter` against a mock HTTP server rather
    /// than the real OpenAI endpoint, so the SSE-framing/chunk-extraction
    /// loop (`drive_sse_stream`) is proven against an actual `reqwest`
    /// response body, not just a hand-built string in `extract_chunk_text`'s
    /// own unit tests.
    #[tokio::test]
    async fn openai_adapter_streams_text_from_a_mocked_sse_endpoint() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hello \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        std::env::set_var("OPENAI_API_KEY", "test-key");
        let adapter = OpenAiCompatAdapter::new(
            Provider::OpenAi,
            format!("{}/v1/chat/completions", server.uri()),
            "gpt-4o-mini".to_string(),
            "Authorization",
            "Bearer ",
        )
        .unwrap();
        std::env::remove_var("OPENAI_API_KEY");

        let mut stream = adapter.stream("what did Darwin write?", 0.2, "").await.unwrap();
        let mut total = String::new();
        while let Some(chunk) = stream.next().await {
            total.push_str(&chunk.unwrap());
        }
        assert_eq!(total, "hello world");
    }
}

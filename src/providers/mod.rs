//! Provider adapters: one uniform contract over OpenAI, Anthropic, and
//! Google for unary and streamed chat/text completion.
//!
//! Requests arrive provider-agnostic (OpenAI-style messages, already filtered
//! by the orchestrator's parameter constraints); adapters translate to the
//! native wire format, classify failures, and normalize usage including the
//! provider-specific cache token fields.

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod retry;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;

use crate::domain::{GatewayError, Provider, Result};
use crate::pricing::TokenCounts;

/// OpenAI-style chat message. `content` stays a raw value so provider
/// pass-through fields (notably Anthropic `cache_control` on content parts)
/// survive untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Canonical chat request handed to an adapter. `params` has already been
/// through the orchestrator's constraint filter.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub params: Map<String, Value>,
}

/// Canonical text-completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Canceled,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Canceled => "canceled",
        }
    }
}

/// Usage normalized across providers. Exactly one cache-read style field is
/// set per provider: `cache_read_input_tokens` (Anthropic),
/// `cached_prompt_tokens` (OpenAI), `cached_content_token_count` (Google).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_content_token_count: Option<u64>,
}

impl NormalizedUsage {
    /// View for the pricing engine. OpenAI reports cached tokens inside
    /// `prompt_tokens`, and Google inside `promptTokenCount`, so those are
    /// carved out of the input bucket; Anthropic reports cache tokens
    /// separately already.
    pub fn token_counts(&self) -> TokenCounts {
        let cached_prompt = self.cached_prompt_tokens.unwrap_or(0);
        let cached_content = self.cached_content_token_count.unwrap_or(0);
        TokenCounts {
            input_tokens: self
                .prompt_tokens
                .saturating_sub(cached_prompt)
                .saturating_sub(cached_content),
            output_tokens: self.completion_tokens,
            cache_creation_tokens: self.cache_creation_input_tokens.unwrap_or(0),
            cache_read_tokens: self.cache_read_input_tokens.unwrap_or(0),
            cached_prompt_tokens: cached_prompt,
            cached_content_tokens: cached_content,
        }
    }
}

/// Unary adapter result.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: NormalizedUsage,
}

/// One streamed delta. The final chunk carries the usage.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub delta: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<NormalizedUsage>,
}

pub type ProviderStream = BoxStream<'static, Result<StreamChunk>>;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn chat(&self, request: &ChatRequest) -> Result<ProviderResponse>;
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ProviderStream>;

    async fn completion(&self, request: &CompletionRequest) -> Result<ProviderResponse>;
    async fn completion_stream(&self, request: &CompletionRequest) -> Result<ProviderStream>;
}

// ===== Shared wire helpers =====

/// Map an upstream HTTP error into the gateway taxonomy. 5xx stays
/// retryable, 4xx is fatal.
pub(crate) async fn check_status(
    response: reqwest::Response,
    provider: Provider,
) -> Result<reqwest::Response> {
    let status = response.status().as_u16();
    if status < 400 {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = extract_error_message(&body).unwrap_or_else(|| format!("{} error", provider));
    Err(GatewayError::UpstreamRejected { status, message })
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

pub(crate) fn transport_error(provider: Provider, err: reqwest::Error) -> GatewayError {
    GatewayError::UpstreamUnavailable(format!("{}: {}", provider, err))
}

/// What one parsed SSE data payload means.
pub(crate) enum SseEvent {
    Chunk(StreamChunk),
    Done,
    Skip,
}

type SseParser = Box<dyn FnMut(&str) -> Result<SseEvent> + Send>;

struct SseState {
    inner: BoxStream<'static, std::result::Result<bytes::Bytes, reqwest::Error>>,
    provider: Provider,
    buffer: String,
    queue: VecDeque<StreamChunk>,
    parse: SseParser,
    finished: bool,
}

/// Turn an upstream SSE byte stream into a stream of parsed chunks. The
/// parser sees each `data:` payload; `event:` lines and blanks are ignored
/// (the payloads themselves carry a type tag on every provider).
pub(crate) fn sse_chunk_stream(
    response: reqwest::Response,
    provider: Provider,
    parse: SseParser,
) -> ProviderStream {
    let state = SseState {
        inner: response.bytes_stream().boxed(),
        provider,
        buffer: String::new(),
        queue: VecDeque::new(),
        parse,
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.queue.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.finished {
                return None;
            }

            match st.inner.next().await {
                Some(Ok(bytes)) => {
                    st.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = st.buffer.find('\n') {
                        let line = st.buffer[..pos].trim().to_string();
                        st.buffer.drain(..=pos);

                        if line.is_empty() {
                            continue;
                        }
                        let Some(data) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let data = data.trim_start();

                        match (st.parse)(data) {
                            Ok(SseEvent::Chunk(chunk)) => st.queue.push_back(chunk),
                            Ok(SseEvent::Done) => {
                                st.finished = true;
                                break;
                            }
                            Ok(SseEvent::Skip) => {}
                            Err(e) => {
                                st.finished = true;
                                return Some((Err(e), st));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(transport_error(st.provider, e)), st));
                }
                None => {
                    st.finished = true;
                }
            }
        }
    }))
}

/// Build a reqwest client with per-provider pool limits and timeouts.
pub(crate) fn build_http_client(
    timeout_secs: u64,
    max_connections: usize,
) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .connect_timeout(std::time::Duration::from_secs(10))
        .pool_max_idle_per_host(max_connections)
        .build()
        .map_err(|e| GatewayError::Internal(format!("http client build failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_usage_token_counts_openai_style() {
        // OpenAI counts cached tokens inside prompt_tokens.
        let usage = NormalizedUsage {
            prompt_tokens: 1100,
            completion_tokens: 50,
            total_tokens: 1150,
            cached_prompt_tokens: Some(1000),
            ..Default::default()
        };
        let counts = usage.token_counts();
        assert_eq!(counts.input_tokens, 100);
        assert_eq!(counts.cached_prompt_tokens, 1000);
        assert_eq!(counts.output_tokens, 50);
    }

    #[test]
    fn test_normalized_usage_token_counts_anthropic_style() {
        // Anthropic reports cache tokens outside input_tokens.
        let usage = NormalizedUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
            cache_read_input_tokens: Some(2000),
            ..Default::default()
        };
        let counts = usage.token_counts();
        assert_eq!(counts.input_tokens, 100);
        assert_eq!(counts.cache_read_tokens, 2000);
    }

    #[test]
    fn test_extract_error_message() {
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"bad model","type":"invalid"}}"#),
            Some("bad model".to_string())
        );
        assert_eq!(
            extract_error_message(r#"{"message":"nope"}"#),
            Some("nope".to_string())
        );
        assert_eq!(extract_error_message("not json"), None);
    }

    #[test]
    fn test_finish_reason_wire_names() {
        assert_eq!(FinishReason::Stop.as_str(), "stop");
        assert_eq!(FinishReason::ToolCalls.as_str(), "tool_calls");
        assert_eq!(FinishReason::Canceled.as_str(), "canceled");
    }
}

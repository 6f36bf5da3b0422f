//! Anthropic adapter. Translates OpenAI-style messages to the Messages API,
//! passes `cache_control` through untouched, and normalizes the ephemeral
//! cache usage fields.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{
    build_http_client, check_status, sse_chunk_stream, transport_error, ChatMessage, ChatRequest,
    CompletionRequest, FinishReason, NormalizedUsage, ProviderAdapter, ProviderResponse,
    ProviderStream, SseEvent, StreamChunk,
};
use crate::config::ProviderConfig;
use crate::domain::{GatewayError, Provider, Result};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicAdapter {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config.timeout_secs, config.max_connections)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: config.api_key.clone(),
        })
    }

    /// OpenAI-style messages -> Messages API shape. System messages move to
    /// the top-level `system` field; content values (string or parts, with
    /// any `cache_control` markers) pass through unchanged.
    fn messages_body(
        model: &str,
        messages: &[ChatMessage],
        params: &Map<String, Value>,
        stream: bool,
    ) -> Value {
        let mut system_parts: Vec<Value> = Vec::new();
        let mut turns: Vec<Value> = Vec::new();

        for message in messages {
            if message.role == "system" {
                match &message.content {
                    Value::String(text) => {
                        system_parts.push(json!({"type": "text", "text": text}))
                    }
                    Value::Array(parts) => system_parts.extend(parts.iter().cloned()),
                    other => system_parts.push(other.clone()),
                }
            } else {
                turns.push(json!({
                    "role": message.role,
                    "content": message.content,
                }));
            }
        }

        let mut body = Map::new();
        body.insert("model".to_string(), json!(model));
        body.insert("messages".to_string(), Value::Array(turns));
        if !system_parts.is_empty() {
            body.insert("system".to_string(), Value::Array(system_parts));
        }

        for (key, value) in params {
            body.insert(key.clone(), value.clone());
        }
        // The Messages API requires max_tokens.
        body.entry("max_tokens".to_string())
            .or_insert(json!(DEFAULT_MAX_TOKENS));

        if stream {
            body.insert("stream".to_string(), json!(true));
        }
        Value::Object(body)
    }

    fn completion_as_messages(request: &CompletionRequest, stream: bool) -> Value {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: Value::String(request.prompt.clone()),
            name: None,
        }];
        Self::messages_body(&request.model, &messages, &request.params, stream)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(Provider::Anthropic, e))?;
        check_status(response, Provider::Anthropic).await
    }

    async fn unary(&self, body: &Value) -> Result<ProviderResponse> {
        let response = self.post(body).await?;
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Provider::Anthropic, e))?;

        let content = parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(ProviderResponse {
            content,
            finish_reason: map_stop_reason(parsed.stop_reason.as_deref()),
            usage: parsed.usage.normalize(),
        })
    }

    async fn streamed(&self, body: &Value) -> Result<ProviderStream> {
        let response = self.post(body).await?;
        Ok(sse_chunk_stream(
            response,
            Provider::Anthropic,
            Box::new(StreamAccumulator::default().into_parser()),
        ))
    }
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        // end_turn, stop_sequence, pause_turn all read as a normal stop.
        _ => FinishReason::Stop,
    }
}

// ===== Wire types =====

#[derive(Debug, Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

impl ApiUsage {
    fn normalize(&self) -> NormalizedUsage {
        NormalizedUsage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens.filter(|v| *v > 0),
            cache_read_input_tokens: self.cache_read_input_tokens.filter(|v| *v > 0),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// Streaming events carry usage in two places: `message_start` has the input
/// side, the final `message_delta` has the output side and the stop reason.
/// The accumulator stitches them into one final-usage chunk.
#[derive(Default)]
struct StreamAccumulator {
    input_usage: ApiUsage,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    delta: Option<Value>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<ApiUsage>,
}

impl StreamAccumulator {
    fn into_parser(mut self) -> impl FnMut(&str) -> Result<SseEvent> + Send {
        move |data: &str| {
            let event: StreamEvent = match serde_json::from_str(data) {
                Ok(e) => e,
                Err(_) => return Ok(SseEvent::Skip),
            };

            match event.event_type.as_str() {
                "message_start" => {
                    if let Some(usage) = event.message.and_then(|m| m.usage) {
                        self.input_usage = usage;
                    }
                    Ok(SseEvent::Skip)
                }
                "content_block_delta" => {
                    let text = event
                        .delta
                        .as_ref()
                        .and_then(|d| d.get("text"))
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if text.is_empty() {
                        return Ok(SseEvent::Skip);
                    }
                    Ok(SseEvent::Chunk(StreamChunk {
                        delta: text,
                        ..Default::default()
                    }))
                }
                "message_delta" => {
                    self.stop_reason = event
                        .delta
                        .as_ref()
                        .and_then(|d| d.get("stop_reason"))
                        .and_then(|r| r.as_str())
                        .map(str::to_string);

                    let output_tokens = event.usage.as_ref().map(|u| u.output_tokens).unwrap_or(0);
                    let combined = ApiUsage {
                        input_tokens: self.input_usage.input_tokens,
                        output_tokens,
                        cache_creation_input_tokens: self.input_usage.cache_creation_input_tokens,
                        cache_read_input_tokens: self.input_usage.cache_read_input_tokens,
                    };

                    Ok(SseEvent::Chunk(StreamChunk {
                        delta: String::new(),
                        finish_reason: Some(map_stop_reason(self.stop_reason.as_deref())),
                        usage: Some(combined.normalize()),
                    }))
                }
                "message_stop" => Ok(SseEvent::Done),
                "error" => Err(GatewayError::UpstreamRejected {
                    status: 500,
                    message: data.to_string(),
                }),
                // ping, content_block_start, content_block_stop
                _ => Ok(SseEvent::Skip),
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ProviderResponse> {
        let body = Self::messages_body(&request.model, &request.messages, &request.params, false);
        self.unary(&body).await
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ProviderStream> {
        let body = Self::messages_body(&request.model, &request.messages, &request.params, true);
        self.streamed(&body).await
    }

    async fn completion(&self, request: &CompletionRequest) -> Result<ProviderResponse> {
        let body = Self::completion_as_messages(request, false);
        self.unary(&body).await
    }

    async fn completion_stream(&self, request: &CompletionRequest) -> Result<ProviderStream> {
        let body = Self::completion_as_messages(request, true);
        self.streamed(&body).await
    }
}

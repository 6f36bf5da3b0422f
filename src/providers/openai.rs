//! OpenAI adapter: chat + legacy text completions, unary and streamed.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{
    build_http_client, check_status, sse_chunk_stream, transport_error, ChatRequest,
    CompletionRequest, FinishReason, NormalizedUsage, ProviderAdapter, ProviderResponse,
    ProviderStream, SseEvent, StreamChunk,
};
use crate::config::ProviderConfig;
use crate::domain::{GatewayError, Provider, Result};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiAdapter {
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

    fn chat_body(request: &ChatRequest, stream: bool) -> Value {
        let mut body = Map::new();
        body.insert("model".to_string(), json!(request.model));
        body.insert(
            "messages".to_string(),
            serde_json::to_value(&request.messages).unwrap_or(Value::Null),
        );
        for (key, value) in &request.params {
            body.insert(key.clone(), value.clone());
        }
        rename_max_tokens_if_needed(&request.model, &mut body);
        if stream {
            body.insert("stream".to_string(), json!(true));
            body.insert("stream_options".to_string(), json!({"include_usage": true}));
        }
        Value::Object(body)
    }

    fn completion_body(request: &CompletionRequest, stream: bool) -> Value {
        let mut body = Map::new();
        body.insert("model".to_string(), json!(request.model));
        body.insert("prompt".to_string(), json!(request.prompt));
        for (key, value) in &request.params {
            body.insert(key.clone(), value.clone());
        }
        if stream {
            body.insert("stream".to_string(), json!(true));
            body.insert("stream_options".to_string(), json!({"include_usage": true}));
        }
        Value::Object(body)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(Provider::OpenAI, e))?;
        check_status(response, Provider::OpenAI).await
    }
}

/// Certain model families reject `max_tokens` in favor of
/// `max_completion_tokens`; the rename happens here, after the constraint
/// filter has produced the canonical params.
fn rename_max_tokens_if_needed(model: &str, body: &mut Map<String, Value>) {
    let needs_rename = model.starts_with("gpt-5")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4");
    if needs_rename && !body.contains_key("max_completion_tokens") {
        if let Some(value) = body.remove("max_tokens") {
            debug!(model, "renamed max_tokens to max_completion_tokens");
            body.insert("max_completion_tokens".to_string(), value);
        }
    }
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

// ===== Wire types =====

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl ApiUsage {
    fn normalize(&self) -> NormalizedUsage {
        let cached = self
            .prompt_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .filter(|c| *c > 0);
        NormalizedUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            cached_prompt_tokens: cached,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    text: Option<String>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

fn parse_stream_payload(data: &str) -> Result<SseEvent> {
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let parsed: StreamResponse = match serde_json::from_str(data) {
        Ok(p) => p,
        // Malformed frames are skipped, matching upstream guidance.
        Err(_) => return Ok(SseEvent::Skip),
    };

    let mut chunk = StreamChunk::default();
    if let Some(choice) = parsed.choices.into_iter().next() {
        if let Some(content) = choice.delta.content {
            chunk.delta = content;
        } else if let Some(text) = choice.text {
            chunk.delta = text;
        }
        if let Some(reason) = choice.finish_reason.as_deref() {
            chunk.finish_reason = Some(map_finish_reason(Some(reason)));
        }
    }
    if let Some(usage) = parsed.usage {
        chunk.usage = Some(usage.normalize());
    }

    if chunk.delta.is_empty() && chunk.finish_reason.is_none() && chunk.usage.is_none() {
        Ok(SseEvent::Skip)
    } else {
        Ok(SseEvent::Chunk(chunk))
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ProviderResponse> {
        let body = Self::chat_body(request, false);
        let response = self.post("/chat/completions", &body).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Provider::OpenAI, e))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::internal("openai returned no choices"))?;

        Ok(ProviderResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            usage: parsed.usage.map(|u| u.normalize()).unwrap_or_default(),
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ProviderStream> {
        let body = Self::chat_body(request, true);
        let response = self.post("/chat/completions", &body).await?;
        Ok(sse_chunk_stream(
            response,
            Provider::OpenAI,
            Box::new(parse_stream_payload),
        ))
    }

    async fn completion(&self, request: &CompletionRequest) -> Result<ProviderResponse> {
        let body = Self::completion_body(request, false);
        let response = self.post("/completions", &body).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Provider::OpenAI, e))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::internal("openai returned no choices"))?;

        Ok(ProviderResponse {
            content: choice.text,
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            usage: parsed.usage.map(|u| u.normalize()).unwrap_or_default(),
        })
    }

    async fn completion_stream(&self, request: &CompletionRequest) -> Result<ProviderStream> {
        let body = Self::completion_body(request, true);
        let response = self.post("/completions", &body).await?;
        Ok(sse_chunk_stream(
            response,
            Provider::OpenAI,
            Box::new(parse_stream_payload),
        ))
    }
}

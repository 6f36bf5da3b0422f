//! Google (Gemini) adapter over the generateContent API.

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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GoogleAdapter {
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

    /// OpenAI-style messages -> Gemini contents. System messages become
    /// `systemInstruction`; assistant maps to the `model` role.
    fn request_body(messages: &[ChatMessage], params: &Map<String, Value>) -> Value {
        let mut system_parts: Vec<Value> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();

        for message in messages {
            let parts = content_to_parts(&message.content);
            if message.role == "system" {
                system_parts.extend(parts);
                continue;
            }
            let role = if message.role == "assistant" {
                "model"
            } else {
                "user"
            };
            contents.push(json!({"role": role, "parts": parts}));
        }

        let mut generation_config = Map::new();
        for (key, value) in params {
            match key.as_str() {
                "max_tokens" | "max_completion_tokens" => {
                    generation_config.insert("maxOutputTokens".to_string(), value.clone());
                }
                "temperature" => {
                    generation_config.insert("temperature".to_string(), value.clone());
                }
                "top_p" => {
                    generation_config.insert("topP".to_string(), value.clone());
                }
                "stop" => {
                    generation_config.insert("stopSequences".to_string(), value.clone());
                }
                // Anything else rides along at the top level untouched.
                _ => {}
            }
        }

        let mut body = Map::new();
        body.insert("contents".to_string(), Value::Array(contents));
        if !system_parts.is_empty() {
            body.insert(
                "systemInstruction".to_string(),
                json!({"parts": system_parts}),
            );
        }
        if !generation_config.is_empty() {
            body.insert(
                "generationConfig".to_string(),
                Value::Object(generation_config),
            );
        }
        Value::Object(body)
    }

    async fn post(&self, model: &str, action: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!(
            "{}/models/{}:{}?key={}",
            self.base_url, model, action, self.api_key
        );
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(Provider::Google, e))?;
        check_status(response, Provider::Google).await
    }

    async fn unary(&self, model: &str, body: &Value) -> Result<ProviderResponse> {
        let response = self.post(model, "generateContent", body).await?;
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Provider::Google, e))?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::internal("google returned no candidates"))?;

        Ok(ProviderResponse {
            content: candidate.text(),
            finish_reason: map_finish_reason(candidate.finish_reason.as_deref()),
            usage: parsed
                .usage_metadata
                .map(|u| u.normalize())
                .unwrap_or_default(),
        })
    }

    async fn streamed(&self, model: &str, body: &Value) -> Result<ProviderStream> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        );
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(Provider::Google, e))?;
        let response = check_status(response, Provider::Google).await?;

        Ok(sse_chunk_stream(
            response,
            Provider::Google,
            Box::new(parse_stream_payload),
        ))
    }
}

fn content_to_parts(content: &Value) -> Vec<Value> {
    match content {
        Value::String(text) => vec![json!({"text": text})],
        Value::Array(parts) => parts
            .iter()
            .map(|part| {
                // OpenAI-style {type:"text",text} parts become {text}.
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    json!({"text": text})
                } else {
                    part.clone()
                }
            })
            .collect(),
        other => vec![json!({"text": other.to_string()})],
    }
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT") => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Stop,
    }
}

// ===== Wire types =====

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
    #[serde(default)]
    cached_content_token_count: Option<u64>,
}

impl UsageMetadata {
    fn normalize(&self) -> NormalizedUsage {
        NormalizedUsage {
            prompt_tokens: self.prompt_token_count,
            completion_tokens: self.candidates_token_count,
            total_tokens: self.total_token_count,
            cached_content_token_count: self.cached_content_token_count.filter(|v| *v > 0),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

impl Candidate {
    fn text(&self) -> String {
        self.content
            .as_ref()
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

/// Gemini streams plain JSON frames and ends the stream without a sentinel;
/// usage arrives on the final frame.
fn parse_stream_payload(data: &str) -> Result<SseEvent> {
    let parsed: GenerateResponse = match serde_json::from_str(data) {
        Ok(p) => p,
        Err(_) => return Ok(SseEvent::Skip),
    };

    let mut chunk = StreamChunk::default();
    if let Some(candidate) = parsed.candidates.first() {
        chunk.delta = candidate.text();
        if let Some(reason) = candidate.finish_reason.as_deref() {
            chunk.finish_reason = Some(map_finish_reason(Some(reason)));
        }
    }
    if let Some(usage) = parsed.usage_metadata {
        chunk.usage = Some(usage.normalize());
    }

    if chunk.delta.is_empty() && chunk.finish_reason.is_none() && chunk.usage.is_none() {
        Ok(SseEvent::Skip)
    } else {
        Ok(SseEvent::Chunk(chunk))
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ProviderResponse> {
        let body = Self::request_body(&request.messages, &request.params);
        self.unary(&request.model, &body).await
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ProviderStream> {
        let body = Self::request_body(&request.messages, &request.params);
        self.streamed(&request.model, &body).await
    }

    async fn completion(&self, request: &CompletionRequest) -> Result<ProviderResponse> {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: Value::String(request.prompt.clone()),
            name: None,
        }];
        let body = Self::request_body(&messages, &request.params);
        self.unary(&request.model, &body).await
    }

    async fn completion_stream(&self, request: &CompletionRequest) -> Result<ProviderStream> {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: Value::String(request.prompt.clone()),
            name: None,
        }];
        let body = Self::request_body(&messages, &request.params);
        self.streamed(&request.model, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_translation() {
        let messages = vec![
            ChatMessage {
                role: "system".to_string(),
                content: json!("Be brief."),
                name: None,
            },
            ChatMessage {
                role: "user".to_string(),
                content: json!("Hello"),
                name: None,
            },
            ChatMessage {
                role: "assistant".to_string(),
                content: json!("Hi!"),
                name: None,
            },
        ];
        let mut params = Map::new();
        params.insert("max_tokens".to_string(), json!(256));
        params.insert("temperature".to_string(), json!(0.7));

        let body = GoogleAdapter::request_body(&messages, &params);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(body["generationConfig"]["temperature"], 0.7);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("STOP")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), FinishReason::Length);
        assert_eq!(
            map_finish_reason(Some("SAFETY")),
            FinishReason::ContentFilter
        );
    }

    #[test]
    fn test_usage_normalization() {
        let usage = UsageMetadata {
            prompt_token_count: 1050,
            candidates_token_count: 40,
            total_token_count: 1090,
            cached_content_token_count: Some(1000),
        };
        let normalized = usage.normalize();
        assert_eq!(normalized.cached_content_token_count, Some(1000));
        assert_eq!(normalized.token_counts().input_tokens, 50);
    }

    #[test]
    fn test_stream_payload_with_usage() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"done"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":5,"totalTokenCount":15}}"#;
        match parse_stream_payload(data).unwrap() {
            SseEvent::Chunk(chunk) => {
                assert_eq!(chunk.delta, "done");
                assert_eq!(chunk.finish_reason, Some(FinishReason::Stop));
                assert_eq!(chunk.usage.unwrap().total_tokens, 15);
            }
            _ => panic!("expected chunk"),
        }
    }
}

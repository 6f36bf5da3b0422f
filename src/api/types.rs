//! Request and response DTOs for the HTTP surface. Completion endpoints are
//! OpenAI-wire-compatible with one addition: `usage.credits`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use validator::Validate;

use crate::domain::{DeductionOutcome, Operation};
use crate::providers::{ChatMessage, FinishReason, NormalizedUsage};
use crate::storage::{UsageFilter, UsageSummary};

// ===== Completion requests =====

/// Chat completion request. Known routing fields are explicit; every other
/// parameter (temperature, max_tokens, provider pass-through, unknown keys)
/// lands in `params` for the constraint filter.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Text completion request.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionApiRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

// ===== Completion responses =====

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsInfo {
    pub deducted: i64,
    pub remaining: i64,
    pub subscription_remaining: i64,
    pub purchased_remaining: i64,
}

impl From<&DeductionOutcome> for CreditsInfo {
    fn from(outcome: &DeductionOutcome) -> Self {
        Self {
            deducted: outcome.deducted,
            remaining: outcome.remaining,
            subscription_remaining: outcome.subscription_remaining,
            purchased_remaining: outcome.purchased_remaining,
        }
    }
}

/// The usage object on every completion response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub credits_used: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    pub credits: CreditsInfo,
}

impl UsageInfo {
    pub fn build(usage: &NormalizedUsage, outcome: &DeductionOutcome) -> Self {
        let cached = usage
            .cached_prompt_tokens
            .or(usage.cached_content_token_count);
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            credits_used: outcome.deducted,
            cached_tokens: cached,
            cache_creation_input_tokens: usage.cache_creation_input_tokens,
            cache_read_input_tokens: usage.cache_read_input_tokens,
            credits: CreditsInfo::from(outcome),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponseMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    pub usage: UsageInfo,
}

impl ChatCompletionResponse {
    pub fn new(model: String, content: String, finish_reason: FinishReason, usage: UsageInfo) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            object: "chat.completion",
            created: Utc::now().timestamp(),
            model,
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: ChatResponseMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: finish_reason.as_str().to_string(),
            }],
            usage,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub text: String,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: UsageInfo,
}

impl CompletionResponse {
    pub fn new(model: String, text: String, finish_reason: FinishReason, usage: UsageInfo) -> Self {
        Self {
            id: format!("cmpl-{}", Uuid::new_v4().simple()),
            object: "text_completion",
            created: Utc::now().timestamp(),
            model,
            choices: vec![CompletionChoice {
                index: 0,
                text,
                finish_reason: finish_reason.as_str().to_string(),
            }],
            usage,
        }
    }
}

// ===== Streaming frames =====

#[derive(Debug, Clone, Serialize, Default)]
pub struct StreamDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: StreamDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One SSE frame of a streamed completion. Only the final pre-`[DONE]` frame
/// carries `usage`.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionStreamFrame {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

impl CompletionStreamFrame {
    pub fn delta(id: &str, model: &str, chat: bool, content: String) -> Self {
        Self {
            id: id.to_string(),
            object: if chat {
                "chat.completion.chunk"
            } else {
                "text_completion.chunk"
            },
            created: Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: StreamDelta {
                    role: None,
                    content: Some(content),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    pub fn finish(
        id: &str,
        model: &str,
        chat: bool,
        finish_reason: FinishReason,
        usage: UsageInfo,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: if chat {
                "chat.completion.chunk"
            } else {
                "text_completion.chunk"
            },
            created: Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: StreamDelta::default(),
                finish_reason: Some(finish_reason.as_str().to_string()),
            }],
            usage: Some(usage),
        }
    }
}

// ===== Listings, usage, pagination =====

#[derive(Debug, Clone, Serialize)]
pub struct PageMeta {
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsagePage<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
    pub summary: UsageSummary,
}

#[derive(Debug, Clone, Deserialize, Default, Validate)]
pub struct UsageQuery {
    #[serde(default = "default_limit")]
    #[validate(range(min = 1, max = 100))]
    pub limit: i64,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub offset: i64,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub model_id: Option<String>,
    pub operation: Option<String>,
}

fn default_limit() -> i64 {
    20
}

impl UsageQuery {
    pub fn to_filter(&self) -> UsageFilter {
        UsageFilter {
            start_date: self.start_date,
            end_date: self.end_date,
            model_id: self.model_id.clone(),
            operation: self.operation.as_deref().and_then(Operation::parse),
            limit: self.limit.clamp(1, 100),
            offset: self.offset.max(0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageStatsQuery {
    #[serde(default = "default_group_by")]
    pub group_by: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

fn default_group_by() -> String {
    "day".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_request_collects_unknown_params() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 100,
            "temperature": 0.5,
            "some_vendor_knob": true
        });
        let request: ChatCompletionRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.model, "gpt-4o");
        assert!(!request.stream);
        assert_eq!(request.params["max_tokens"], 100);
        assert_eq!(request.params["some_vendor_knob"], true);
        assert!(request.params.get("model").is_none());
    }

    #[test]
    fn test_usage_info_serialization_shape() {
        let usage = NormalizedUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
            cache_read_input_tokens: Some(2000),
            ..Default::default()
        };
        let outcome = DeductionOutcome {
            deducted: 1,
            remaining: 499,
            subscription_remaining: 499,
            purchased_remaining: 0,
            debit_trail: vec![],
        };

        let info = UsageInfo::build(&usage, &outcome);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["promptTokens"], 100);
        assert_eq!(json["creditsUsed"], 1);
        assert_eq!(json["cacheReadInputTokens"], 2000);
        assert_eq!(json["credits"]["deducted"], 1);
        assert_eq!(json["credits"]["subscriptionRemaining"], 499);
        assert!(json.get("cachedTokens").is_none());
    }

    #[test]
    fn test_usage_query_clamps_limit() {
        let query = UsageQuery {
            limit: 5000,
            ..Default::default()
        };
        assert_eq!(query.to_filter().limit, 100);

        let query = UsageQuery {
            limit: 0,
            offset: -5,
            ..Default::default()
        };
        let filter = query.to_filter();
        assert_eq!(filter.limit, 1);
        assert_eq!(filter.offset, 0);
    }

    #[test]
    fn test_stream_frame_usage_only_on_finish() {
        let delta = CompletionStreamFrame::delta("id-1", "gpt-4o", true, "hel".to_string());
        assert!(delta.usage.is_none());
        let json = serde_json::to_value(&delta).unwrap();
        assert!(json.get("usage").is_none());
        assert_eq!(json["choices"][0]["delta"]["content"], "hel");
    }
}

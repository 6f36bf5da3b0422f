//! The single place gateway errors become HTTP. Everything below the API
//! layer returns typed `GatewayError`s; this module maps them onto the
//! canonical envelope `{"error": {code, message, details?}}`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error};
use uuid::Uuid;

use crate::domain::GatewayError;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError(pub GatewayError);

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn mapped(&self) -> (StatusCode, &'static str, String, Option<Value>) {
        use GatewayError::*;
        match &self.0 {
            InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "invalid_request",
                msg.clone(),
                None,
            ),
            Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_error",
                msg.clone(),
                None,
            ),
            Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.clone(), None),
            Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone(), None),
            InsufficientScope { required } => (
                StatusCode::FORBIDDEN,
                "forbidden",
                format!("missing required scope: {}", required),
                Some(json!({ "requiredScope": required })),
            ),
            TierRestricted {
                model_id,
                required_tier,
                current_tier,
            } => (
                StatusCode::FORBIDDEN,
                "tier_restricted",
                format!("model {} requires the {} tier", model_id, required_tier),
                Some(json!({
                    "modelId": model_id,
                    "requiredTier": required_tier,
                    "currentTier": current_tier,
                    "upgradeUrl": "/account/upgrade",
                })),
            ),
            ModelNotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("model not found: {}", id),
                None,
            ),
            ModelUnavailable(id) => (
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("model {} is not available for inference", id),
                None,
            ),
            InsufficientCredits {
                required,
                available,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                "insufficient credits for this request".to_string(),
                Some(json!({
                    "required": required,
                    "available": available,
                    "shortfall": required - available,
                })),
            ),
            RateLimitExceeded {
                retry_after_secs, ..
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_exceeded",
                "rate limit exceeded".to_string(),
                Some(json!({ "retryAfter": retry_after_secs })),
            ),
            NotFound(what) => (StatusCode::NOT_FOUND, "not_found", what.clone(), None),
            Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            UpstreamRejected { status, message } if *status == 422 => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_error",
                message.clone(),
                None,
            ),
            UpstreamRejected { status, message } if *status < 500 => (
                StatusCode::BAD_REQUEST,
                "invalid_request",
                message.clone(),
                None,
            ),
            UpstreamRejected { .. } | UpstreamUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "upstream provider unavailable".to_string(),
                None,
            ),
            Canceled => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_server_error",
                "request canceled".to_string(),
                None,
            ),
            // Pool exhaustion is back-pressure, not a bug: shed load.
            Database(sqlx::Error::PoolTimedOut) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "server busy, retry shortly".to_string(),
                Some(json!({ "retryAfter": 1 })),
            ),
            Database(_) | Io(_) | Serialization(_) | Config(_) | PricingNotFound { .. }
            | Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_server_error",
                "an internal error occurred".to_string(),
                None,
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, mut details) = self.mapped();

        if status.is_server_error() {
            let correlation_id = Uuid::new_v4().to_string();
            error!(
                correlation_id = %correlation_id,
                code,
                error = %self.0,
                "request failed"
            );
            let detail_map = details.get_or_insert_with(|| json!({}));
            if let Some(map) = detail_map.as_object_mut() {
                map.insert("correlationId".to_string(), json!(correlation_id));
            }
        } else {
            debug!(code, error = %self.0, "client error");
        }

        let body = Json(ErrorBody {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        });

        let mut response = (status, body).into_response();

        if let GatewayError::RateLimitExceeded {
            retry_after_secs,
            limit,
            remaining,
            reset_at,
        } = &self.0
        {
            let headers = response.headers_mut();
            headers.insert(
                header::RETRY_AFTER,
                HeaderValue::from_str(&retry_after_secs.to_string()).unwrap(),
            );
            headers.insert(
                "x-ratelimit-limit",
                HeaderValue::from_str(&limit.to_string()).unwrap(),
            );
            headers.insert(
                "x-ratelimit-remaining",
                HeaderValue::from_str(&remaining.to_string()).unwrap(),
            );
            headers.insert(
                "x-ratelimit-reset",
                HeaderValue::from_str(&reset_at.to_string()).unwrap(),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_credits_mapping() {
        let err = ApiError(GatewayError::InsufficientCredits {
            required: 5,
            available: 2,
        });
        let (status, code, _, details) = err.mapped();
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(code, "insufficient_credits");
        let details = details.unwrap();
        assert_eq!(details["shortfall"], 3);
    }

    #[test]
    fn test_tier_restricted_carries_upgrade_details() {
        let err = ApiError(GatewayError::TierRestricted {
            model_id: "gpt-4o".to_string(),
            required_tier: "pro".to_string(),
            current_tier: "free".to_string(),
        });
        let (status, code, _, details) = err.mapped();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(code, "tier_restricted");
        let details = details.unwrap();
        assert_eq!(details["requiredTier"], "pro");
        assert_eq!(details["currentTier"], "free");
    }

    #[test]
    fn test_upstream_4xx_maps_to_client_error() {
        let err = ApiError(GatewayError::UpstreamRejected {
            status: 400,
            message: "context too long".to_string(),
        });
        let (status, code, message, _) = err.mapped();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "invalid_request");
        assert_eq!(message, "context too long");
    }

    #[test]
    fn test_upstream_5xx_maps_to_service_unavailable() {
        let err = ApiError(GatewayError::UpstreamRejected {
            status: 503,
            message: "overloaded".to_string(),
        });
        let (status, code, _, _) = err.mapped();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(code, "service_unavailable");
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let err = ApiError(GatewayError::Internal("secret pool state".to_string()));
        let (_, _, message, _) = err.mapped();
        assert!(!message.contains("secret"));
    }

    #[test]
    fn test_rate_limit_response_headers() {
        let err = ApiError(GatewayError::RateLimitExceeded {
            retry_after_secs: 42,
            limit: 10,
            remaining: 0,
            reset_at: 1_700_000_000,
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "42");
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }
}

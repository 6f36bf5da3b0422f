use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Insufficient scope: required {required}")]
    InsufficientScope { required: String },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model {model_id} requires tier {required_tier}, current tier is {current_tier}")]
    TierRestricted {
        model_id: String,
        required_tier: String,
        current_tier: String,
    },

    #[error("Model {0} is not available for inference")]
    ModelUnavailable(String),

    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded {
        retry_after_secs: u64,
        limit: u64,
        remaining: u64,
        reset_at: i64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Pricing not found for provider={provider}, model={model}")]
    PricingNotFound { provider: String, model: String },

    #[error("Provider rejected the request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    #[error("Provider unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Request canceled")]
    Canceled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        GatewayError::Config(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        GatewayError::Validation(msg.into())
    }

    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        GatewayError::InvalidRequest(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        GatewayError::Internal(msg.into())
    }

    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        GatewayError::Unauthorized(msg.into())
    }

    /// Transport failures and provider 5xx are worth one retry.
    /// Provider 4xx and auth errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::UpstreamUnavailable(_) => true,
            GatewayError::UpstreamRejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::UpstreamUnavailable("timeout".into()).is_retryable());
        assert!(GatewayError::UpstreamRejected {
            status: 503,
            message: "overloaded".into()
        }
        .is_retryable());
        assert!(!GatewayError::UpstreamRejected {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!GatewayError::Unauthorized("no token".into()).is_retryable());
        assert!(!GatewayError::InsufficientCredits {
            required: 5,
            available: 2
        }
        .is_retryable());
    }
}

use http::StatusCode;
use streamgate_protocol::ErrorEnvelope;

use crate::timeout::FiredReason;

pub mod codes {
    pub const CONTEXT_EXCEEDED: &str = "streamgate.context_length_exceeded";
    pub const MODEL_SERVICE_UNAVAILABLE: &str = "streamgate.model_services_unavailable";
    pub const MODEL_UNAVAILABLE: &str = "streamgate.model_unavailable";
    pub const UNAUTHORIZED: &str = "streamgate.model_services_unauthorized";
    pub const TOO_MANY_REQUESTS: &str = "streamgate.too_many_requests";
    pub const INTERNAL_ERROR: &str = "streamgate.internal_error";
    pub const NETWORK_ERROR: &str = "streamgate.network_interrupt";
    pub const SERVER_BUSY: &str = "streamgate.server_busy";
    pub const STREAM_IDLE_TIMEOUT: &str = "streamgate.stream_idle_timeout";
    pub const TOTAL_IDLE_TIMEOUT: &str = "streamgate.total_stream_idle_timeout";
    pub const BAD_REQUEST: &str = "streamgate.bad_request";
    pub const CANCELLED: &str = "streamgate.request_cancelled";
}

/// Error type attached to failures that come from the model side.
pub const MODEL_ERROR_TYPE: &str = "ai_model_error";

const CONTEXT_LENGTH_PHRASES: [&str; 2] = [
    "This model's maximum context length",
    "Input text is too long",
];

/// Upstream subsystem named by an API error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorSubtype {
    QuotaCheck,
    QuotaManager,
    AiGateway,
    Generic,
}

impl ApiErrorSubtype {
    fn from_code(code: &str) -> Self {
        if code.contains("quota-check") {
            ApiErrorSubtype::QuotaCheck
        } else if code.contains("quota-manager") {
            ApiErrorSubtype::QuotaManager
        } else if code.contains("ai-gateway") {
            ApiErrorSubtype::AiGateway
        } else {
            ApiErrorSubtype::Generic
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApiErrorSubtype::QuotaCheck => "quota-check",
            ApiErrorSubtype::QuotaManager => "quota-manager",
            ApiErrorSubtype::AiGateway => "ai-gateway",
            ApiErrorSubtype::Generic => MODEL_ERROR_TYPE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} ({status}): {message}")]
pub struct ApiError {
    pub status: u16,
    pub code: String,
    pub error_type: String,
    pub message: String,
    pub subtype: ApiErrorSubtype,
}

impl ApiError {
    /// Error for a non-2xx status whose body named no known subsystem.
    pub fn from_status(status: u16, body: &str) -> Self {
        let (code, message) = match status {
            404 => (
                codes::MODEL_UNAVAILABLE,
                "The requested model is unavailable.".to_string(),
            ),
            401 => (
                codes::UNAUTHORIZED,
                "The model service rejected the credentials.".to_string(),
            ),
            429 => (
                codes::TOO_MANY_REQUESTS,
                "Too many requests, please try again later.".to_string(),
            ),
            504 => (
                codes::SERVER_BUSY,
                "The model service is busy, please try again later.".to_string(),
            ),
            _ => (
                codes::MODEL_SERVICE_UNAVAILABLE,
                format!(
                    "The model service is unavailable.\n\n[Error Detail]:\nCode: {status}\nMessage: {body}"
                ),
            ),
        };
        Self {
            status,
            code: code.to_string(),
            error_type: MODEL_ERROR_TYPE.to_string(),
            message,
            subtype: ApiErrorSubtype::Generic,
        }
    }
}

/// Every way a chat request can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("idle timeout (total): the request's idle budget is exhausted")]
    TotalIdleTimeout,
    #[error("idle timeout (single): the model stream stayed silent too long")]
    StreamIdleTimeout,
    #[error("model service unavailable: {0}")]
    ModelServiceUnavailable(String),
    #[error("network interrupted: {0}")]
    Network(String),
    #[error("input exceeds the model's maximum context length")]
    ContextTooLong,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid request: {0}")]
    Client(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("downstream connection closed")]
    Downstream,
}

impl GatewayError {
    /// Maps a non-2xx upstream reply. Envelopes whose code names a known
    /// subsystem keep their own code and message; anything else becomes a
    /// status-derived error carrying the raw body.
    pub fn from_upstream_status(status: u16, body: &[u8]) -> Self {
        if status == 413 {
            return GatewayError::ContextTooLong;
        }
        if let Some(parsed) = ErrorEnvelope::parse_upstream(body) {
            let subtype = ApiErrorSubtype::from_code(&parsed.code);
            if subtype != ApiErrorSubtype::Generic {
                return GatewayError::Api(ApiError {
                    status,
                    code: parsed.code,
                    error_type: subtype.as_str().to_string(),
                    message: parsed.message,
                    subtype,
                });
            }
        }
        let text = String::from_utf8_lossy(body);
        let detail = if text.trim().is_empty() {
            "None"
        } else {
            text.as_ref()
        };
        GatewayError::Api(ApiError::from_status(status, detail))
    }

    pub fn from_fired(reason: Option<FiredReason>) -> Self {
        match reason {
            Some(FiredReason::TotalBudget) => GatewayError::TotalIdleTimeout,
            Some(FiredReason::AttemptIdle) => GatewayError::StreamIdleTimeout,
            None => GatewayError::Cancelled,
        }
    }

    /// Whether the same model deserves a second attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Api(api) => {
                api.status >= 500
                    || api.code == codes::SERVER_BUSY
                    || api.code == codes::MODEL_SERVICE_UNAVAILABLE
            }
            GatewayError::ContextTooLong | GatewayError::Cancelled | GatewayError::Downstream => {
                false
            }
            GatewayError::TotalIdleTimeout
            | GatewayError::StreamIdleTimeout
            | GatewayError::ModelServiceUnavailable(_)
            | GatewayError::Network(_)
            | GatewayError::Client(_)
            | GatewayError::Encode(_)
            | GatewayError::Decode(_) => true,
        }
    }

    /// Failures that end the request regardless of retry policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Cancelled | GatewayError::Downstream)
    }

    pub fn is_context_length(&self) -> bool {
        match self {
            GatewayError::ContextTooLong => true,
            GatewayError::Api(api) => {
                api.code == codes::CONTEXT_EXCEEDED
                    || CONTEXT_LENGTH_PHRASES
                        .iter()
                        .any(|phrase| api.message.contains(phrase))
            }
            GatewayError::ModelServiceUnavailable(message) | GatewayError::Network(message) => {
                CONTEXT_LENGTH_PHRASES
                    .iter()
                    .any(|phrase| message.contains(phrase))
            }
            _ => false,
        }
    }

    pub fn status(&self) -> StatusCode {
        let code = match self {
            GatewayError::TotalIdleTimeout | GatewayError::StreamIdleTimeout => 504,
            GatewayError::ModelServiceUnavailable(_) => 503,
            GatewayError::Network(_) => 502,
            GatewayError::ContextTooLong | GatewayError::Client(_) => 400,
            GatewayError::Api(api) => api.status,
            GatewayError::Encode(_) | GatewayError::Decode(_) => 500,
            GatewayError::Cancelled => 499,
            GatewayError::Downstream => 500,
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
    }

    pub fn code(&self) -> &str {
        match self {
            GatewayError::TotalIdleTimeout => codes::TOTAL_IDLE_TIMEOUT,
            GatewayError::StreamIdleTimeout => codes::STREAM_IDLE_TIMEOUT,
            GatewayError::ModelServiceUnavailable(_) => codes::MODEL_SERVICE_UNAVAILABLE,
            GatewayError::Network(_) => codes::NETWORK_ERROR,
            GatewayError::ContextTooLong => codes::CONTEXT_EXCEEDED,
            GatewayError::Api(api) => &api.code,
            GatewayError::Client(_) => codes::BAD_REQUEST,
            GatewayError::Encode(_) | GatewayError::Decode(_) | GatewayError::Downstream => {
                codes::INTERNAL_ERROR
            }
            GatewayError::Cancelled => codes::CANCELLED,
        }
    }

    pub fn error_type(&self) -> &str {
        match self {
            GatewayError::Api(api) => &api.error_type,
            GatewayError::Client(_) => "invalid_request_error",
            _ => MODEL_ERROR_TYPE,
        }
    }

    pub fn message(&self) -> String {
        match self {
            GatewayError::Api(api) => api.message.clone(),
            GatewayError::ContextTooLong => {
                "The input exceeds the model's maximum context length. Please shorten the conversation and retry."
                    .to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.message(), self.error_type(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_codes_keep_their_identity() {
        let err = GatewayError::from_upstream_status(
            403,
            br#"{"error":{"code":"quota-manager.insufficient","message":"no quota left"}}"#,
        );
        let GatewayError::Api(api) = &err else {
            panic!("expected api error");
        };
        assert_eq!(api.subtype, ApiErrorSubtype::QuotaManager);
        assert_eq!(api.error_type, "quota-manager");
        assert_eq!(api.message, "no quota left");
        assert!(!err.is_retryable());
    }

    #[test]
    fn unknown_bodies_become_status_errors() {
        let err = GatewayError::from_upstream_status(502, b"");
        assert_eq!(err.code(), codes::MODEL_SERVICE_UNAVAILABLE);
        assert!(err.message().contains("Message: None"));
        assert!(err.is_retryable());

        let busy = GatewayError::from_upstream_status(504, b"upstream timeout");
        assert_eq!(busy.code(), codes::SERVER_BUSY);
        assert!(busy.is_retryable());

        let missing = GatewayError::from_upstream_status(404, b"no such model");
        assert_eq!(missing.code(), codes::MODEL_UNAVAILABLE);
        assert!(!missing.is_retryable());

        assert_eq!(
            GatewayError::from_upstream_status(413, b"too big"),
            GatewayError::ContextTooLong
        );
    }

    #[test]
    fn context_length_phrases_are_detected_in_raw_bodies() {
        let err = GatewayError::from_upstream_status(
            400,
            br#"{"error":{"message":"This model's maximum context length is 8192 tokens","code":"context_length_exceeded"}}"#,
        );
        assert!(err.is_context_length());
        assert!(!GatewayError::StreamIdleTimeout.is_context_length());
    }

    #[test]
    fn local_failures_are_classified() {
        assert!(GatewayError::Network("reset".into()).is_retryable());
        assert!(!GatewayError::Cancelled.is_retryable());
        assert!(GatewayError::Downstream.is_fatal());
        assert_eq!(
            GatewayError::from_fired(Some(FiredReason::TotalBudget)),
            GatewayError::TotalIdleTimeout
        );
        assert_eq!(GatewayError::from_fired(None), GatewayError::Cancelled);
    }

    #[test]
    fn envelope_carries_code_and_type() {
        let envelope = GatewayError::ContextTooLong.envelope();
        assert_eq!(envelope.error.code, codes::CONTEXT_EXCEEDED);
        assert_eq!(envelope.error.error_type, MODEL_ERROR_TYPE);
        assert_eq!(GatewayError::ContextTooLong.status(), StatusCode::BAD_REQUEST);
    }
}

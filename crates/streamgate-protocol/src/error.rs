use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
}

/// `{"error": {"message", "type", "code"}}`, the shape every failure reaches
/// the client in, streamed or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(
        message: impl Into<String>,
        error_type: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                error_type: error_type.into(),
                code: code.into(),
            },
        }
    }

    /// Reads an upstream error body. Providers disagree on whether `code` is a
    /// string or a number and on whether the object is nested under `error`,
    /// so both are accepted.
    pub fn parse_upstream(body: &[u8]) -> Option<ErrorBody> {
        let value: Value = serde_json::from_slice(body).ok()?;
        let object = match value.get("error") {
            Some(inner @ Value::Object(_)) => inner,
            _ => &value,
        };
        let code = match object.get("code") {
            Some(Value::String(code)) => code.clone(),
            Some(Value::Number(code)) => code.to_string(),
            _ => String::new(),
        };
        let message = object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let error_type = object
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if code.is_empty() && message.is_empty() {
            return None;
        }
        Some(ErrorBody {
            message,
            error_type,
            code,
        })
    }
}

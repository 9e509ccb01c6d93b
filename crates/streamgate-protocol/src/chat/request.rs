use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{ChatMessage, ExtraBody, PromptMode, Role, StreamOptions};

/// Model name that asks the gateway to pick candidates through its router.
pub const AUTO_MODEL: &str = "auto";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_body: Option<ExtraBody>,
    /// Sampling and vendor fields the gateway passes through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn prompt_mode(&self) -> PromptMode {
        self.extra_body
            .as_ref()
            .map(|extra| extra.prompt_mode)
            .unwrap_or_default()
    }

    pub fn is_auto(&self) -> bool {
        self.model == AUTO_MODEL
    }

    /// Text of the most recent user message.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(ChatMessage::text)
    }

    /// Body for one upstream call: the given model and messages, gateway-only
    /// options stripped, and usage reporting requested when streaming.
    pub fn for_upstream(&self, model: &str, messages: &[ChatMessage], stream: bool) -> Self {
        Self {
            model: model.to_string(),
            messages: messages.to_vec(),
            tools: self.tools.clone(),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            extra_body: None,
            extra: self.extra.clone(),
        }
    }
}

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use streamgate_common::Headers;
use streamgate_protocol::chat::Usage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Chat(ChatRecord),
}

impl Event {
    pub fn request_id(&self) -> &str {
        match self {
            Event::Chat(record) => &record.request_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub input: String,
    pub output: String,
    pub status: ToolStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyRecord {
    pub first_token_ms: Option<u64>,
    /// Until the first window-full of content left the gateway.
    pub window_ms: Option<u64>,
    pub total_ms: u64,
}

/// Audit entry for one finished chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub request_id: String,
    pub at: SystemTime,
    pub requested_model: String,
    pub serving_model: Option<String>,
    pub stream: bool,
    pub attempts: u32,
    pub latency: LatencyRecord,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub response_headers: Headers,
    pub response_content: String,
    pub error: Option<String>,
}

//! Client-facing side of a request: the tool-aware streaming pipeline, its
//! raw passthrough mode, and the buffered completion runner.

mod completion;
mod stream;
mod window;

use std::time::Duration;

use streamgate_common::{GatewayConfig, Headers, header_set};

use crate::routing::HEADER_SELECT_LLM;

pub use completion::{CompletionAttempt, CompletionReport};
pub use stream::{StreamReport, StreamingPipeline};
pub use window::ContentWindow;

pub const TRUNCATION_NOTICE: &str = "... (truncated due to excessive length)";
pub const SEARCH_START: &str = "\n#### 🔍 ";
pub const SEARCH_END: &str = "searching";
pub const ANALYZING: &str = "\n#### 💡 Search complete, analyzing";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub window_size: usize,
    pub max_tool_depth: u32,
    pub max_tool_result_chars: usize,
    pub tools_disabled: bool,
    pub placeholder_tick: Duration,
    pub placeholder_ticks: u32,
    pub analyzing_tick: Duration,
    pub analyzing_ticks: u32,
    pub forward_response_headers: Vec<String>,
}

impl PipelineSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            window_size: config.window_size,
            max_tool_depth: config.max_tool_depth,
            max_tool_result_chars: config.max_tool_result_chars,
            tools_disabled: config.tools_disabled,
            placeholder_tick: config.placeholder_tick,
            placeholder_ticks: config.placeholder_ticks,
            analyzing_tick: config.analyzing_tick,
            analyzing_ticks: config.analyzing_ticks,
            forward_response_headers: config.forward_response_headers.clone(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            window_size: 6,
            max_tool_depth: 6,
            max_tool_result_chars: 100_000,
            tools_disabled: false,
            placeholder_tick: Duration::from_millis(600),
            placeholder_ticks: 5,
            analyzing_tick: Duration::from_millis(100),
            analyzing_ticks: 3,
            forward_response_headers: Vec::new(),
        }
    }
}

/// Where and how every attempt of one request reaches the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub url: String,
    pub headers: Headers,
    /// Set when the candidate list came from the router; the serving model
    /// is then reported back in `x-select-llm`.
    pub routed: bool,
}

impl UpstreamTarget {
    /// Headers for a call to `model`. Routed calls name the model actually
    /// being tried, which changes as candidates degrade.
    pub fn headers_for(&self, model: &str) -> Headers {
        let mut headers = self.headers.clone();
        if self.routed {
            header_set(&mut headers, HEADER_SELECT_LLM, model);
        }
        headers
    }
}

/// Cuts `text` to at most `limit` characters and appends the truncation
/// notice when anything was removed.
pub fn truncate_tool_result(text: String, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => {
            let mut out = text[..cut].to_string();
            out.push_str(TRUNCATION_NOTICE);
            out
        }
        None => text,
    }
}

pub fn summarize_instruction(tool_list: &str) -> String {
    format!(
        "Please summarize the key findings and/or code from the results above within the <thinking></thinking> tags. No need to summarize error messages. \n\
         If the search failed, don't say 'failed', describe this outcome as 'did not find relevant results' instead. MUST NOT use terms like 'failure', 'error', or 'unsuccessful' in your description. \n\
         In your summary, must include the name of the tool used and specify which tools you intend to use next. \n\
         When appropriate, prioritize using these tools: {tool_list}"
    )
}

//! Inline tools the model invokes by writing `<name>...</name>` into its
//! answer.

mod http_executor;

use async_trait::async_trait;

pub use http_executor::HttpToolExecutor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool {tool} is missing required parameter {param}")]
    MissingParameter { tool: String, param: String },
    #[error("tool request failed: {0}")]
    Request(String),
    #[error("tool returned status {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Name of the first tool whose opening tag occurs in `text`.
    async fn detect_tool(&self, text: &str) -> Option<String>;

    async fn execute(&self, name: &str, input: &str) -> Result<String, ToolError>;

    /// Human-readable list of the available tools, quoted back to the model.
    fn list_tools(&self) -> String;

    /// Names of every tool, used to hold back partially streamed tags.
    fn tool_names(&self) -> Vec<String>;
}

pub fn opening_tag(name: &str) -> String {
    format!("<{name}>")
}

/// Trimmed text between `<name>` and `</name>`.
pub fn extract_tag_value(input: &str, name: &str) -> Option<String> {
    let open = opening_tag(name);
    let close = format!("</{name}>");
    let start = input.find(&open)? + open.len();
    let end = input[start..].find(&close)? + start;
    Some(input[start..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_nested_parameter() {
        let input = "<codebase_search>\n<query> retry policy </query>\n<top_k>3</top_k>\n</codebase_search>";
        assert_eq!(extract_tag_value(input, "query").as_deref(), Some("retry policy"));
        assert_eq!(extract_tag_value(input, "top_k").as_deref(), Some("3"));
        assert_eq!(extract_tag_value(input, "missing"), None);
        assert_eq!(extract_tag_value("<query>unterminated", "query"), None);
    }
}

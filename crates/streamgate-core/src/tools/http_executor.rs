use async_trait::async_trait;
use serde_json::{Map, Value};
use streamgate_common::{ParameterSource, ToolDefinition};
use tracing::debug;
use wreq::{Client, Method};

use super::{ToolError, ToolExecutor, extract_tag_value, opening_tag};

/// Tools backed by HTTP endpoints, driven entirely by configuration.
pub struct HttpToolExecutor {
    client: Client,
    tools: Vec<ToolDefinition>,
}

impl HttpToolExecutor {
    pub fn new(client: Client, tools: Vec<ToolDefinition>) -> Self {
        Self { client, tools }
    }

    fn find(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|tool| tool.name == name)
    }
}

/// JSON arguments for `tool`, read from the model's tool block.
pub(crate) fn build_arguments(
    tool: &ToolDefinition,
    input: &str,
) -> Result<Map<String, Value>, ToolError> {
    let mut args = Map::new();
    for param in &tool.parameters {
        let value = match param.source {
            ParameterSource::Manual => param.default.clone(),
            ParameterSource::Llm => {
                extract_tag_value(input, &param.name).or_else(|| param.default.clone())
            }
        };
        match value {
            Some(value) => {
                args.insert(param.name.clone(), Value::String(value));
            }
            None if param.required => {
                return Err(ToolError::MissingParameter {
                    tool: tool.name.clone(),
                    param: param.name.clone(),
                });
            }
            None => {}
        }
    }
    Ok(args)
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn detect_tool(&self, text: &str) -> Option<String> {
        self.tools
            .iter()
            .find(|tool| text.contains(&opening_tag(&tool.name)))
            .map(|tool| tool.name.clone())
    }

    async fn execute(&self, name: &str, input: &str) -> Result<String, ToolError> {
        let tool = self
            .find(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let args = build_arguments(tool, input)?;
        let body = serde_json::to_vec(&args).map_err(|err| ToolError::Request(err.to_string()))?;
        let method = Method::from_bytes(tool.method.to_ascii_uppercase().as_bytes())
            .map_err(|err| ToolError::Request(err.to_string()))?;
        debug!(tool = %name, endpoint = %tool.endpoint, "calling tool");

        let resp = self
            .client
            .request(method, &tool.endpoint)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| ToolError::Request(err.to_string()))?;
        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| ToolError::Request(err.to_string()))?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if !(200..300).contains(&status) {
            return Err(ToolError::Status { status, body: text });
        }
        Ok(text)
    }

    fn list_tools(&self) -> String {
        self.tools
            .iter()
            .map(|tool| tool.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name.clone()).collect()
    }
}

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod headers;

pub use headers::{Headers, header_get, header_remove, header_set};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Where a tool parameter value comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterSource {
    /// Extracted from `<param>..</param>` in the model output.
    #[default]
    Llm,
    /// Always filled from the configured default.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub source: ParameterSource,
}

/// An HTTP-backed tool the model can invoke inline with `<name>...</name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub endpoint: String,
    #[serde(default = "default_tool_method")]
    pub method: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

fn default_tool_method() -> String {
    "POST".to_string()
}

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI > ENV > config file > defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub upstream_base_url: String,
    pub upstream_chat_path: String,
    pub upstream_api_key: Option<String>,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Longest silence tolerated within one upstream call.
    pub idle_timeout: Duration,
    /// Silence budget shared by every attempt of one request.
    pub total_idle_timeout: Duration,
    pub retry_backoff: Duration,
    pub min_retry_budget: Duration,
    pub max_attempts_per_model: u32,
    pub window_size: usize,
    pub max_tool_depth: u32,
    pub max_tool_result_chars: usize,
    pub tools_disabled: bool,
    pub tools: Vec<ToolDefinition>,
    pub router_candidates: Vec<String>,
    pub forward_response_headers: Vec<String>,
    pub placeholder_tick: Duration,
    pub placeholder_ticks: u32,
    pub analyzing_tick: Duration,
    pub analyzing_ticks: u32,
}

impl GatewayConfig {
    pub fn upstream_chat_url(&self) -> String {
        let base = self.upstream_base_url.trim_end_matches('/');
        let path = self.upstream_chat_path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Optional layer used for merging config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub upstream_base_url: Option<String>,
    pub upstream_chat_path: Option<String>,
    pub upstream_api_key: Option<String>,
    pub proxy: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub total_idle_timeout_ms: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    pub min_retry_budget_ms: Option<u64>,
    pub max_attempts_per_model: Option<u32>,
    pub window_size: Option<usize>,
    pub max_tool_depth: Option<u32>,
    pub max_tool_result_chars: Option<usize>,
    pub tools_disabled: Option<bool>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub router_candidates: Option<Vec<String>>,
    pub forward_response_headers: Option<Vec<String>>,
    pub placeholder_tick_ms: Option<u64>,
    pub placeholder_ticks: Option<u32>,
    pub analyzing_tick_ms: Option<u64>,
    pub analyzing_ticks: Option<u32>,
}

macro_rules! overlay_fields {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )+
    };
}

impl GatewayConfigPatch {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        overlay_fields!(
            self,
            other,
            host,
            port,
            upstream_base_url,
            upstream_chat_path,
            upstream_api_key,
            proxy,
            connect_timeout_ms,
            idle_timeout_ms,
            total_idle_timeout_ms,
            retry_backoff_ms,
            min_retry_budget_ms,
            max_attempts_per_model,
            window_size,
            max_tool_depth,
            max_tool_result_chars,
            tools_disabled,
            tools,
            router_candidates,
            forward_response_headers,
            placeholder_tick_ms,
            placeholder_ticks,
            analyzing_tick_ms,
            analyzing_ticks,
        );
    }

    pub fn into_config(self) -> Result<GatewayConfig, ConfigError> {
        let upstream_base_url = self
            .upstream_base_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingField("upstream_base_url"))?;
        let window_size = self.window_size.unwrap_or(6);
        if window_size == 0 {
            return Err(ConfigError::Invalid("window_size must be at least 1".to_string()));
        }
        let max_attempts_per_model = self.max_attempts_per_model.unwrap_or(2);
        if max_attempts_per_model == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts_per_model must be at least 1".to_string(),
            ));
        }

        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8080),
            upstream_base_url,
            upstream_chat_path: self
                .upstream_chat_path
                .unwrap_or_else(|| "/v1/chat/completions".to_string()),
            upstream_api_key: self.upstream_api_key.filter(|key| !key.trim().is_empty()),
            proxy: self.proxy.filter(|proxy| !proxy.trim().is_empty()),
            connect_timeout: millis(self.connect_timeout_ms, 5_000),
            idle_timeout: millis(self.idle_timeout_ms, 30_000),
            total_idle_timeout: millis(self.total_idle_timeout_ms, 90_000),
            retry_backoff: millis(self.retry_backoff_ms, 5_000),
            min_retry_budget: millis(self.min_retry_budget_ms, 5_000),
            max_attempts_per_model,
            window_size,
            max_tool_depth: self.max_tool_depth.unwrap_or(6),
            max_tool_result_chars: self.max_tool_result_chars.unwrap_or(100_000),
            tools_disabled: self.tools_disabled.unwrap_or(false),
            tools: self.tools.unwrap_or_default(),
            router_candidates: self.router_candidates.unwrap_or_default(),
            forward_response_headers: self.forward_response_headers.unwrap_or_else(|| {
                vec![
                    "x-oneapi-request-id".to_string(),
                    "x-select-llm".to_string(),
                    "x-user-input".to_string(),
                ]
            }),
            placeholder_tick: millis(self.placeholder_tick_ms, 600),
            placeholder_ticks: self.placeholder_ticks.unwrap_or(5),
            analyzing_tick: millis(self.analyzing_tick_ms, 100),
            analyzing_ticks: self.analyzing_ticks.unwrap_or(3),
        })
    }
}

fn millis(value: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default_ms))
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            upstream_base_url: Some(value.upstream_base_url),
            upstream_chat_path: Some(value.upstream_chat_path),
            upstream_api_key: value.upstream_api_key,
            proxy: value.proxy,
            connect_timeout_ms: Some(as_millis(value.connect_timeout)),
            idle_timeout_ms: Some(as_millis(value.idle_timeout)),
            total_idle_timeout_ms: Some(as_millis(value.total_idle_timeout)),
            retry_backoff_ms: Some(as_millis(value.retry_backoff)),
            min_retry_budget_ms: Some(as_millis(value.min_retry_budget)),
            max_attempts_per_model: Some(value.max_attempts_per_model),
            window_size: Some(value.window_size),
            max_tool_depth: Some(value.max_tool_depth),
            max_tool_result_chars: Some(value.max_tool_result_chars),
            tools_disabled: Some(value.tools_disabled),
            tools: Some(value.tools),
            router_candidates: Some(value.router_candidates),
            forward_response_headers: Some(value.forward_response_headers),
            placeholder_tick_ms: Some(as_millis(value.placeholder_tick)),
            placeholder_ticks: Some(value.placeholder_ticks),
            analyzing_tick_ms: Some(as_millis(value.analyzing_tick)),
            analyzing_ticks: Some(value.analyzing_ticks),
        }
    }
}

fn as_millis(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

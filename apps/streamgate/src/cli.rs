use std::path::PathBuf;

use clap::Parser;
use streamgate_common::GatewayConfigPatch;

/// Flags and environment variables. Anything left unset falls through to the
/// config file and then to the built-in defaults.
#[derive(Parser)]
#[command(name = "streamgate")]
pub(crate) struct Cli {
    /// JSON config file.
    #[arg(long, env = "STREAMGATE_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    #[arg(long, env = "STREAMGATE_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "STREAMGATE_PORT")]
    pub(crate) port: Option<u16>,
    #[arg(long, env = "STREAMGATE_UPSTREAM_BASE_URL")]
    pub(crate) upstream_base_url: Option<String>,
    #[arg(long, env = "STREAMGATE_UPSTREAM_CHAT_PATH")]
    pub(crate) upstream_chat_path: Option<String>,
    #[arg(long, env = "STREAMGATE_UPSTREAM_API_KEY", hide_env_values = true)]
    pub(crate) upstream_api_key: Option<String>,
    #[arg(long, env = "STREAMGATE_PROXY")]
    pub(crate) proxy: Option<String>,
    #[arg(long, env = "STREAMGATE_CONNECT_TIMEOUT_MS")]
    pub(crate) connect_timeout_ms: Option<u64>,
    #[arg(long, env = "STREAMGATE_IDLE_TIMEOUT_MS")]
    pub(crate) idle_timeout_ms: Option<u64>,
    #[arg(long, env = "STREAMGATE_TOTAL_IDLE_TIMEOUT_MS")]
    pub(crate) total_idle_timeout_ms: Option<u64>,
    #[arg(long, env = "STREAMGATE_RETRY_BACKOFF_MS")]
    pub(crate) retry_backoff_ms: Option<u64>,
    #[arg(long, env = "STREAMGATE_MIN_RETRY_BUDGET_MS")]
    pub(crate) min_retry_budget_ms: Option<u64>,
    #[arg(long, env = "STREAMGATE_MAX_ATTEMPTS_PER_MODEL")]
    pub(crate) max_attempts_per_model: Option<u32>,
    #[arg(long, env = "STREAMGATE_WINDOW_SIZE")]
    pub(crate) window_size: Option<usize>,
    #[arg(long, env = "STREAMGATE_MAX_TOOL_DEPTH")]
    pub(crate) max_tool_depth: Option<u32>,
    #[arg(long, env = "STREAMGATE_TOOLS_DISABLED")]
    pub(crate) tools_disabled: Option<bool>,
    /// Comma-separated candidates for requests addressed to `auto`.
    #[arg(long, env = "STREAMGATE_ROUTER_CANDIDATES", value_delimiter = ',')]
    pub(crate) router_candidates: Option<Vec<String>>,
}

impl Cli {
    pub(crate) fn into_patch(self) -> GatewayConfigPatch {
        GatewayConfigPatch {
            host: self.host,
            port: self.port,
            upstream_base_url: self.upstream_base_url,
            upstream_chat_path: self.upstream_chat_path,
            upstream_api_key: self.upstream_api_key,
            proxy: self.proxy,
            connect_timeout_ms: self.connect_timeout_ms,
            idle_timeout_ms: self.idle_timeout_ms,
            total_idle_timeout_ms: self.total_idle_timeout_ms,
            retry_backoff_ms: self.retry_backoff_ms,
            min_retry_budget_ms: self.min_retry_budget_ms,
            max_attempts_per_model: self.max_attempts_per_model,
            window_size: self.window_size,
            max_tool_depth: self.max_tool_depth,
            tools_disabled: self.tools_disabled,
            router_candidates: self.router_candidates,
            ..GatewayConfigPatch::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_become_a_patch() {
        let cli = Cli::parse_from([
            "streamgate",
            "--port",
            "9000",
            "--upstream-base-url",
            "http://llm:8000",
            "--router-candidates",
            "m1,m2",
        ]);
        let patch = cli.into_patch();
        assert_eq!(patch.port, Some(9000));
        assert_eq!(patch.upstream_base_url.as_deref(), Some("http://llm:8000"));
        assert_eq!(
            patch.router_candidates,
            Some(vec!["m1".to_string(), "m2".to_string()])
        );
        assert_eq!(patch.host, None);
    }
}

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
mod cli;
use streamgate_common::GatewayConfigPatch;
use streamgate_core::upstream::UpstreamClientConfig;
use streamgate_core::{
    EventHub, Gateway, HttpToolExecutor, StaticRouter, TerminalEventSink, TiktokenCounter,
    WreqUpstreamClient,
};
use streamgate_router::gateway_router;
use tracing::info;

use crate::cli::Cli;

const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("streamgate failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    let mut patch = match cli.config.as_deref() {
        Some(path) => GatewayConfigPatch::from_json_file(path)?,
        None => GatewayConfigPatch::default(),
    };
    patch.overlay(cli.into_patch());
    let config = patch.into_config()?;
    info!(
        host = %config.host,
        port = config.port,
        upstream = %config.upstream_chat_url(),
        proxy = %config.proxy.as_deref().unwrap_or(""),
        tools = config.tools.len(),
        tools_disabled = config.tools_disabled,
        router_candidates = ?config.router_candidates,
        "config loaded"
    );

    let client = WreqUpstreamClient::new(UpstreamClientConfig::from_config(&config))?;
    let events = EventHub::new(EVENT_BUFFER);
    events.add_sink(Arc::new(TerminalEventSink::new())).await;

    let mut gateway = Gateway::new(
        config.clone(),
        Arc::new(client.clone()),
        Arc::new(TiktokenCounter::new()),
        events,
    );
    if !config.tools_disabled && !config.tools.is_empty() {
        let tools = HttpToolExecutor::new(client.client().clone(), config.tools.clone());
        gateway = gateway.with_tools(Arc::new(tools));
    }
    if !config.router_candidates.is_empty() {
        gateway = gateway.with_router(Arc::new(StaticRouter::new(
            config.router_candidates.clone(),
        )));
    }

    let app = gateway_router(Arc::new(gateway));
    let bind = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shutdown complete");

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("streamgate=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

use std::future::Future;
use std::pin::Pin;

use tracing::info;

use super::{Event, EventSink, SinkError};

/// Logs each record as one JSON line on the `streamgate::audit` target.
pub struct TerminalEventSink;

impl TerminalEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TerminalEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for TerminalEventSink {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn write<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            let line = serde_json::to_string(event)?;
            info!(target: "streamgate::audit", "{line}");
            Ok(())
        })
    }
}

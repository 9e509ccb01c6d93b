use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, trace, warn};

use super::types::{ChatRecord, Event};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Durable destination for audit records.
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn write<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;
}

/// Audit fan-out. Every finished chat request produces one record, seen by
/// live subscribers and handed to each sink on its own task so a slow or
/// failing sink never holds up the request.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        debug!(sink = sink.name(), "audit sink registered");
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn record_chat(&self, record: ChatRecord) {
        debug!(
            request_id = %record.request_id,
            serving_model = record.serving_model.as_deref().unwrap_or(""),
            attempts = record.attempts,
            tool_calls = record.tool_calls.len(),
            failed = record.error.is_some(),
            "chat finished"
        );
        self.emit(Event::Chat(record)).await;
    }

    async fn emit(&self, event: Event) {
        if self.inner.tx.send(event.clone()).is_err() {
            trace!(request_id = %event.request_id(), "no live audit subscribers");
        }
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(err) = sink.write(&event).await {
                    warn!(
                        sink = sink.name(),
                        request_id = %event.request_id(),
                        error = %err,
                        "audit sink write failed"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use tokio::sync::mpsc;

    use super::*;
    use crate::events::LatencyRecord;

    struct FailingSink;

    impl EventSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn write<'a>(
            &'a self,
            _event: &'a Event,
        ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
            Box::pin(async { Err(SinkError::Unavailable("disk full".to_string())) })
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<String>);

    impl EventSink for ChannelSink {
        fn name(&self) -> &'static str {
            "channel"
        }

        fn write<'a>(
            &'a self,
            event: &'a Event,
        ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
            Box::pin(async move {
                self.0
                    .send(event.request_id().to_string())
                    .map_err(|_| SinkError::Unavailable("receiver gone".to_string()))
            })
        }
    }

    fn record(request_id: &str) -> ChatRecord {
        ChatRecord {
            request_id: request_id.to_string(),
            at: SystemTime::now(),
            requested_model: "auto".to_string(),
            serving_model: Some("m1".to_string()),
            stream: true,
            attempts: 1,
            latency: LatencyRecord::default(),
            usage: None,
            tool_calls: Vec::new(),
            response_headers: Vec::new(),
            response_content: "hi".to_string(),
            error: None,
        }
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_others() {
        let hub = EventHub::new(4);
        let mut live = hub.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_sink(Arc::new(FailingSink)).await;
        hub.add_sink(Arc::new(ChannelSink(tx))).await;

        hub.record_chat(record("r1")).await;

        let Event::Chat(seen) = live.recv().await.unwrap();
        assert_eq!(seen.request_id, "r1");
        let written = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(written.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn records_without_subscribers_are_dropped_quietly() {
        let hub = EventHub::new(0);
        hub.record_chat(record("r2")).await;
        let mut late = hub.subscribe();
        assert!(late.try_recv().is_err());
    }
}

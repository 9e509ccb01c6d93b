use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use streamgate_common::{GatewayConfig, Headers, header_get, header_set};
use streamgate_protocol::chat::ChatCompletionRequest;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::events::{ChatRecord, EventHub, LatencyRecord};
use crate::orchestrator::{Orchestrator, RetryPolicy};
use crate::pipeline::{
    CompletionAttempt, PipelineSettings, StreamingPipeline, UpstreamTarget,
};
use crate::routing::{HEADER_SELECT_LLM, ModelPlan, ModelRouter, plan_models};
use crate::timeout::IdleTracker;
use crate::tools::ToolExecutor;
use crate::upstream::{UpstreamClient, UpstreamReader};
use crate::usage::TokenCounter;
use crate::writer::{ResponseHead, SseWriter};

/// Inbound headers that never reach the upstream.
const DROPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "accept-encoding",
];

pub enum ChatOutcome {
    Json {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    Stream {
        head: oneshot::Receiver<ResponseHead>,
        body: mpsc::Receiver<Bytes>,
    },
}

impl ChatOutcome {
    pub fn error(err: &GatewayError) -> Self {
        let body = serde_json::to_vec(&err.envelope()).unwrap_or_default();
        Self::Json {
            status: err.status().as_u16(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body),
        }
    }
}

/// The chat service. Built once at startup and shared by every request.
pub struct Gateway {
    config: GatewayConfig,
    reader: UpstreamReader,
    tools: Option<Arc<dyn ToolExecutor>>,
    router: Option<Arc<dyn ModelRouter>>,
    counter: Arc<dyn TokenCounter>,
    events: EventHub,
    orchestrator: Orchestrator,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        client: Arc<dyn UpstreamClient>,
        counter: Arc<dyn TokenCounter>,
        events: EventHub,
    ) -> Self {
        let orchestrator = Orchestrator::new(RetryPolicy::from_config(&config));
        Self {
            config,
            reader: UpstreamReader::new(client),
            tools: None,
            router: None,
            counter,
            events,
            orchestrator,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn ModelRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Serves one chat completion. Streaming requests return as soon as the
    /// work is spawned; the head resolves before the first frame.
    pub async fn chat(
        self: &Arc<Self>,
        request: ChatCompletionRequest,
        headers: Headers,
        cancel: CancellationToken,
    ) -> ChatOutcome {
        let request_id = Uuid::new_v4().to_string();
        let plan = plan_models(self.router.as_deref(), &headers, &request).await;
        let target = UpstreamTarget {
            url: self.config.upstream_chat_url(),
            headers: self.upstream_headers(&headers, &plan.upstream_headers),
            routed: plan.routed,
        };
        info!(
            request_id = %request_id,
            model = %request.model,
            stream = request.stream,
            candidates = ?plan.models,
            "chat request"
        );

        if request.stream {
            let (writer, channels) = SseWriter::new(self.config.forward_response_headers.clone());
            let gateway = self.clone();
            tokio::spawn(async move {
                gateway
                    .serve_stream(request_id, request, plan, target, writer, cancel)
                    .await;
            });
            ChatOutcome::Stream {
                head: channels.head,
                body: channels.body,
            }
        } else {
            self.serve_buffered(request_id, request, plan, target, cancel)
                .await
        }
    }

    async fn serve_stream(
        &self,
        request_id: String,
        request: ChatCompletionRequest,
        plan: ModelPlan,
        target: UpstreamTarget,
        writer: SseWriter,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let requested_model = request.model.clone();
        let tracker = Arc::new(IdleTracker::new(self.config.total_idle_timeout));
        let mut pipeline = StreamingPipeline::new(
            writer,
            self.reader.clone(),
            request,
            target,
            PipelineSettings::from_config(&self.config),
            self.counter.clone(),
        );
        if let Some(tools) = &self.tools {
            pipeline = pipeline.with_tools(tools.clone());
        }

        let outcome = self
            .orchestrator
            .run(&plan.models, tracker, &cancel, &mut pipeline)
            .await;
        let (serving_model, attempts, error) = match outcome {
            Ok(served) => (Some(served.model), served.attempts, None),
            Err(exhausted) => {
                warn!(
                    request_id = %request_id,
                    error = %exhausted.error,
                    committed = exhausted.committed,
                    attempts = exhausted.attempts,
                    "stream request failed"
                );
                if exhausted.error != GatewayError::Downstream {
                    if let Err(err) = pipeline.writer_mut().send_error(&exhausted.error).await {
                        debug!(request_id = %request_id, error = %err, "client gone before error frame");
                    }
                }
                let serving = exhausted.model.filter(|_| exhausted.committed);
                (serving, exhausted.attempts, Some(exhausted.error.to_string()))
            }
        };

        let (writer, report) = pipeline.into_parts();
        let record = ChatRecord {
            request_id,
            at: SystemTime::now(),
            requested_model,
            serving_model,
            stream: true,
            attempts,
            latency: LatencyRecord {
                first_token_ms: report.first_token.map(millis),
                window_ms: report.first_window.map(millis),
                total_ms: millis(started.elapsed()),
            },
            usage: report.usage,
            tool_calls: report.tool_calls,
            response_headers: writer.forwarded_headers().clone(),
            response_content: report.content,
            error,
        };
        drop(writer);
        self.events.record_chat(record).await;
    }

    async fn serve_buffered(
        &self,
        request_id: String,
        request: ChatCompletionRequest,
        plan: ModelPlan,
        target: UpstreamTarget,
        cancel: CancellationToken,
    ) -> ChatOutcome {
        let started = Instant::now();
        let requested_model = request.model.clone();
        let tracker = Arc::new(IdleTracker::new(self.config.total_idle_timeout));
        let mut attempt =
            CompletionAttempt::new(self.reader.clone(), request, target, self.counter.clone());

        let mut record = ChatRecord {
            request_id: request_id.clone(),
            at: SystemTime::now(),
            requested_model,
            serving_model: None,
            stream: false,
            attempts: 0,
            latency: LatencyRecord::default(),
            usage: None,
            tool_calls: Vec::new(),
            response_headers: Vec::new(),
            response_content: String::new(),
            error: None,
        };

        let outcome = match self
            .orchestrator
            .run(&plan.models, tracker, &cancel, &mut attempt)
            .await
        {
            Ok(served) => {
                record.attempts = served.attempts;
                let report = served.value;
                let mut headers: Headers =
                    vec![("content-type".to_string(), "application/json".to_string())];
                for name in &self.config.forward_response_headers {
                    if let Some(value) = header_get(&report.headers, name).filter(|v| !v.is_empty()) {
                        header_set(&mut headers, name.clone(), value);
                        header_set(&mut record.response_headers, name.clone(), value);
                    }
                }
                header_set(&mut headers, HEADER_SELECT_LLM, served.model.clone());

                match serde_json::to_vec(&report.response) {
                    Ok(body) => {
                        record.serving_model = Some(served.model);
                        record.usage = report.response.usage;
                        record.response_content = report.response.content();
                        ChatOutcome::Json {
                            status: 200,
                            headers,
                            body: Bytes::from(body),
                        }
                    }
                    Err(err) => {
                        let err = GatewayError::Encode(err.to_string());
                        record.error = Some(err.to_string());
                        ChatOutcome::error(&err)
                    }
                }
            }
            Err(exhausted) => {
                warn!(
                    request_id = %request_id,
                    error = %exhausted.error,
                    attempts = exhausted.attempts,
                    "request failed"
                );
                record.attempts = exhausted.attempts;
                record.error = Some(exhausted.error.to_string());
                ChatOutcome::error(&exhausted.error)
            }
        };

        record.latency.total_ms = millis(started.elapsed());
        self.events.record_chat(record).await;
        outcome
    }

    fn upstream_headers(&self, inbound: &Headers, routed: &Headers) -> Headers {
        let mut headers: Headers = inbound
            .iter()
            .filter(|(name, _)| {
                !DROPPED_HEADERS
                    .iter()
                    .any(|dropped| name.eq_ignore_ascii_case(dropped))
            })
            .cloned()
            .collect();
        for (name, value) in routed {
            header_set(&mut headers, name.clone(), value.clone());
        }
        header_set(&mut headers, "content-type", "application/json");
        if let Some(key) = self.config.upstream_api_key.as_deref() {
            header_set(&mut headers, "authorization", format!("Bearer {key}"));
        }
        headers
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

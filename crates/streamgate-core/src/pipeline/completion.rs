use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use streamgate_common::Headers;
use streamgate_protocol::chat::{ChatCompletionRequest, ChatCompletionResponse};
use tracing::debug;

use super::UpstreamTarget;
use crate::error::GatewayError;
use crate::orchestrator::{AttemptCtx, AttemptFailure, AttemptRunner};
use crate::upstream::{UpstreamReader, UpstreamRequest};
use crate::usage::{TokenCounter, prompt_text, synthesize_usage};

#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub headers: Headers,
    pub response: ChatCompletionResponse,
    pub usage_synthesized: bool,
}

/// Buffered request: one upstream call per attempt, usage filled in when
/// the upstream left it out.
pub struct CompletionAttempt {
    reader: UpstreamReader,
    request: ChatCompletionRequest,
    target: UpstreamTarget,
    counter: Arc<dyn TokenCounter>,
}

impl CompletionAttempt {
    pub fn new(
        reader: UpstreamReader,
        request: ChatCompletionRequest,
        target: UpstreamTarget,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        Self {
            reader,
            request,
            target,
            counter,
        }
    }
}

#[async_trait]
impl AttemptRunner for CompletionAttempt {
    type Output = CompletionReport;

    async fn run(&mut self, ctx: AttemptCtx<'_>) -> Result<CompletionReport, AttemptFailure> {
        let payload = self
            .request
            .for_upstream(ctx.model, &self.request.messages, false);
        let body = serde_json::to_vec(&payload)
            .map_err(|err| AttemptFailure::uncommitted(GatewayError::Encode(err.to_string())))?;
        let req = UpstreamRequest {
            url: self.target.url.clone(),
            headers: self.target.headers_for(ctx.model),
            body: Bytes::from(body),
        };

        let timer = ctx.start_timer();
        let (headers, mut response) = self
            .reader
            .complete(req, &timer)
            .await
            .map_err(AttemptFailure::uncommitted)?;
        timer.stop();

        let usage_synthesized = !response.has_usage();
        if usage_synthesized {
            debug!(model = %ctx.model, "upstream reported no usage, synthesizing");
            response.usage = Some(synthesize_usage(
                self.counter.as_ref(),
                &prompt_text(&self.request.messages),
                &response.content(),
            ));
        }
        Ok(CompletionReport {
            headers,
            response,
            usage_synthesized,
        })
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use streamgate_protocol::chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatMessage, ContentPart, PromptMode, Usage,
};
use streamgate_protocol::sse::{StreamLine, parse_stream_line};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ANALYZING, ContentWindow, PipelineSettings, SEARCH_END, SEARCH_START, UpstreamTarget,
    summarize_instruction, truncate_tool_result,
};
use crate::error::GatewayError;
use crate::events::{ToolCallRecord, ToolStatus};
use crate::orchestrator::{AttemptCtx, AttemptFailure, AttemptRunner};
use crate::routing::HEADER_SELECT_LLM;
use crate::timeout::IdleTimer;
use crate::tools::{ToolExecutor, opening_tag};
use crate::upstream::{UpstreamReader, UpstreamRequest};
use crate::usage::{TokenCounter, prompt_text, synthesize_usage};
use crate::writer::SseWriter;

/// What a streaming request produced, for the audit record.
#[derive(Debug, Clone, Default)]
pub struct StreamReport {
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Option<Usage>,
    pub first_token: Option<Duration>,
    pub first_window: Option<Duration>,
    /// Content frames the client received, placeholders excluded.
    pub content: String,
}

/// State of one upstream call inside an attempt.
struct Round {
    window: ContentWindow,
    tool: Option<String>,
    content: String,
    template: ChatCompletionChunk,
    usage: Option<Usage>,
    first_token: bool,
}

impl Round {
    fn new(window_size: usize, template: ChatCompletionChunk) -> Self {
        Self {
            window: ContentWindow::new(window_size),
            tool: None,
            content: String::new(),
            template,
            usage: None,
            first_token: true,
        }
    }
}

/// Streams one request to the client, executing inline tools between
/// upstream rounds. Each orchestrator attempt runs the rounds for one model;
/// the conversation grows by an assistant/user pair per executed tool.
pub struct StreamingPipeline {
    writer: SseWriter,
    reader: UpstreamReader,
    tools: Option<Arc<dyn ToolExecutor>>,
    counter: Arc<dyn TokenCounter>,
    settings: PipelineSettings,
    target: UpstreamTarget,
    request: ChatCompletionRequest,
    request_id: String,
    started: Instant,
    report: StreamReport,
}

impl StreamingPipeline {
    pub fn new(
        writer: SseWriter,
        reader: UpstreamReader,
        request: ChatCompletionRequest,
        target: UpstreamTarget,
        settings: PipelineSettings,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        Self {
            writer,
            reader,
            tools: None,
            counter,
            settings,
            target,
            request,
            request_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            started: Instant::now(),
            report: StreamReport::default(),
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn writer_mut(&mut self) -> &mut SseWriter {
        &mut self.writer
    }

    pub fn report(&self) -> &StreamReport {
        &self.report
    }

    pub fn into_parts(self) -> (SseWriter, StreamReport) {
        (self.writer, self.report)
    }

    async fn run_rounds(&mut self, ctx: &AttemptCtx<'_>) -> Result<(), GatewayError> {
        let mut messages = self.request.messages.clone();
        let mut depth = self.settings.max_tool_depth;
        loop {
            let mut round = self.stream_round(ctx, &messages, depth).await?;
            let Some(name) = round.tool.take() else {
                return self.complete(round, &messages).await;
            };
            self.execute_tool(ctx.cancel, &name, round, &mut messages)
                .await?;
            depth = depth.saturating_sub(1);
            info!(remaining_depth = depth, "continuing after tool call");
        }
    }

    async fn stream_round(
        &mut self,
        ctx: &AttemptCtx<'_>,
        messages: &[ChatMessage],
        depth: u32,
    ) -> Result<Round, GatewayError> {
        let req = self.upstream_request(ctx.model, messages)?;
        let detector = self
            .tools
            .clone()
            .filter(|_| !self.settings.tools_disabled && depth > 0);
        let tags: Vec<String> = detector
            .as_ref()
            .map(|tools| tools.tool_names().into_iter().map(|name| opening_tag(&name)).collect())
            .unwrap_or_default();
        let mut round = Round::new(
            self.settings.window_size,
            ChatCompletionChunk::placeholder(&self.request_id, ctx.model),
        );

        let timer = ctx.start_timer();
        let mut lines = self.reader.open_stream(req, &timer).await?;
        self.writer.forward_headers(lines.headers());

        while let Some(line) = lines.next_line().await? {
            match parse_stream_line(&line) {
                StreamLine::Done => {}
                StreamLine::Chunk(chunk) => {
                    if let Some(usage) = chunk.usage.filter(|usage| !usage.is_empty()) {
                        round.usage = Some(usage);
                    }
                    match chunk.content().map(str::to_string) {
                        Some(content) => {
                            round.template = *chunk;
                            self.on_content(&timer, &mut round, content, detector.as_deref(), &tags)
                                .await?;
                        }
                        None if round.tool.is_none() => {
                            self.writer.send_passthrough(&line).await?;
                        }
                        None => {}
                    }
                }
                StreamLine::Other if round.tool.is_none() => {
                    self.writer.send_passthrough(&line).await?;
                }
                StreamLine::Other => {}
            }
        }
        timer.stop();
        Ok(round)
    }

    async fn on_content(
        &mut self,
        timer: &IdleTimer,
        round: &mut Round,
        content: String,
        detector: Option<&dyn ToolExecutor>,
        tags: &[String],
    ) -> Result<(), GatewayError> {
        if round.first_token {
            round.first_token = false;
            timer.mark_first_content();
            if self.report.first_token.is_none() {
                let latency = self.started.elapsed();
                self.report.first_token = Some(latency);
                info!(
                    model = %round.template.model,
                    latency_ms = latency.as_millis() as u64,
                    "first token received"
                );
            }
        }

        round.content.push_str(&content);
        round.window.push(content);
        if round.tool.is_some() {
            return Ok(());
        }

        if let Some(detector) = detector {
            let joined = round.window.joined();
            if let Some(name) = detector.detect_tool(&joined).await {
                let at = joined.find(&opening_tag(&name)).unwrap_or(0);
                self.flush(&round.template, &joined[..at]).await?;
                round.window.reset_to(&joined[at..]);
                info!(tool = %name, "tool call detected");
                round.tool = Some(name);
                return Ok(());
            }
        }

        while let Some(ready) = round.window.pop_ready(tags) {
            self.flush(&round.template, &ready).await?;
        }
        Ok(())
    }

    async fn flush(
        &mut self,
        template: &ChatCompletionChunk,
        text: &str,
    ) -> Result<(), GatewayError> {
        if text.is_empty() {
            return Ok(());
        }
        self.writer.send_content(template, text, None).await?;
        self.report.content.push_str(text);
        self.note_first_window();
        Ok(())
    }

    fn note_first_window(&mut self) {
        if self.report.first_window.is_none() {
            let latency = self.started.elapsed();
            self.report.first_window = Some(latency);
            info!(latency_ms = latency.as_millis() as u64, "first window sent to client");
        }
    }

    async fn execute_tool(
        &mut self,
        cancel: &CancellationToken,
        name: &str,
        mut round: Round,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<(), GatewayError> {
        let Some(tools) = self.tools.clone() else {
            return Ok(());
        };
        let input = round.window.drain_joined();
        let template = &round.template;

        self.writer
            .send_content(template, &format!("{SEARCH_START}`{name}` {SEARCH_END}"), None)
            .await?;
        for _ in 0..self.settings.placeholder_ticks {
            self.writer.send_content(template, ".", None).await?;
            pause(cancel, self.settings.placeholder_tick).await?;
        }

        info!(tool = %name, "calling tool");
        let started = Instant::now();
        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            executed = tools.execute(name, &input) => executed,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let (output, status, error) = match executed {
            Ok(result) => {
                info!(tool = %name, result_len = result.len(), latency_ms, "tool execute succeeded");
                if result.chars().count() > self.settings.max_tool_result_chars {
                    warn!(tool = %name, "tool result truncated due to excessive length");
                }
                (
                    truncate_tool_result(result, self.settings.max_tool_result_chars),
                    ToolStatus::Success,
                    None,
                )
            }
            Err(err) => {
                warn!(tool = %name, error = %err, "tool execute failed");
                (
                    format!("{name} execute failed, err: {err}"),
                    ToolStatus::Failed,
                    Some(err.to_string()),
                )
            }
        };

        self.report.tool_calls.push(ToolCallRecord {
            tool_name: name.to_string(),
            input,
            output: output.clone(),
            status,
            latency_ms,
            error,
        });
        messages.push(ChatMessage::assistant(round.content));
        messages.push(ChatMessage::user_parts(vec![
            ContentPart::text(format!("[{name}] Result:")),
            ContentPart::text(output),
            ContentPart::text(summarize_instruction(&tools.list_tools())),
        ]));

        self.writer.send_content(template, ANALYZING, None).await?;
        for _ in 0..self.settings.analyzing_ticks {
            pause(cancel, self.settings.analyzing_tick).await?;
            self.writer.send_content(template, ".", None).await?;
        }
        self.writer.send_content(template, "\n", None).await
    }

    async fn complete(
        &mut self,
        mut round: Round,
        messages: &[ChatMessage],
    ) -> Result<(), GatewayError> {
        let rest = round.window.drain_joined();
        if !rest.is_empty() || round.usage.is_some() {
            self.writer
                .send_content(&round.template, &rest, round.usage)
                .await?;
            self.report.content.push_str(&rest);
            self.note_first_window();
        }
        self.writer.send_done().await?;

        let usage = match round.usage {
            Some(usage) => usage,
            None => {
                debug!("upstream reported no usage, synthesizing");
                synthesize_usage(
                    self.counter.as_ref(),
                    &prompt_text(messages),
                    &round.content,
                )
            }
        };
        self.report.usage = Some(usage);
        Ok(())
    }

    /// Forwards every upstream line untouched, with no window or detection.
    async fn run_raw(&mut self, ctx: &AttemptCtx<'_>) -> Result<(), GatewayError> {
        let req = self.upstream_request(ctx.model, &self.request.messages)?;
        let timer = ctx.start_timer();
        let mut lines = self.reader.open_stream(req, &timer).await?;
        self.writer.forward_headers(lines.headers());

        let mut content = String::new();
        let mut usage = None;
        while let Some(line) = lines.next_line().await? {
            if self.report.first_token.is_none() {
                timer.mark_first_content();
                let latency = self.started.elapsed();
                self.report.first_token = Some(latency);
                info!(latency_ms = latency.as_millis() as u64, "first token received");
            }
            match parse_stream_line(&line) {
                StreamLine::Chunk(chunk) => {
                    if let Some(text) = chunk.content() {
                        content.push_str(text);
                    }
                    if let Some(reported) = chunk.usage.filter(|usage| !usage.is_empty()) {
                        usage = Some(reported);
                    }
                }
                StreamLine::Done | StreamLine::Other => {}
            }
            self.writer.send_verbatim(&line).await?;
        }
        timer.stop();
        if !self.writer.terminated() {
            self.writer.send_done().await?;
        }

        self.report.usage = Some(usage.unwrap_or_else(|| {
            synthesize_usage(
                self.counter.as_ref(),
                &prompt_text(&self.request.messages),
                &content,
            )
        }));
        self.report.content = content;
        Ok(())
    }

    fn upstream_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<UpstreamRequest, GatewayError> {
        let payload = self.request.for_upstream(model, messages, true);
        let body =
            serde_json::to_vec(&payload).map_err(|err| GatewayError::Encode(err.to_string()))?;
        Ok(UpstreamRequest {
            url: self.target.url.clone(),
            headers: self.target.headers_for(model),
            body: Bytes::from(body),
        })
    }
}

#[async_trait]
impl AttemptRunner for StreamingPipeline {
    type Output = ();

    async fn run(&mut self, ctx: AttemptCtx<'_>) -> Result<(), AttemptFailure> {
        if self.target.routed {
            self.writer.set_header(HEADER_SELECT_LLM, ctx.model);
        }
        self.report.usage = None;
        let result = if self.request.prompt_mode() == PromptMode::Raw {
            self.run_raw(&ctx).await
        } else {
            self.run_rounds(&ctx).await
        };
        result.map_err(|error| AttemptFailure {
            error,
            committed: self.writer.committed(),
        })
    }
}

async fn pause(cancel: &CancellationToken, period: Duration) -> Result<(), GatewayError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        _ = tokio::time::sleep(period) => Ok(()),
    }
}

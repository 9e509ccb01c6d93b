use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::StreamExt;
use streamgate_common::Headers;
use streamgate_protocol::chat::ChatCompletionResponse;
use streamgate_protocol::sse::LineSplitter;
use tracing::warn;

use super::{ByteStream, TransportError, UpstreamClient, UpstreamRequest, UpstreamResponse};
use crate::error::GatewayError;
use crate::timeout::IdleTimer;

/// Cap on how much of a failed response body is kept for logs and errors.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Performs single upstream calls under an attempt's [`IdleTimer`], resetting
/// it on every sign of progress and turning failures into [`GatewayError`]s.
#[derive(Clone)]
pub struct UpstreamReader {
    client: Arc<dyn UpstreamClient>,
}

impl UpstreamReader {
    pub fn new(client: Arc<dyn UpstreamClient>) -> Self {
        Self { client }
    }

    /// Opens a streaming call. Lines are pulled with [`LineStream::next_line`].
    pub async fn open_stream<'t>(
        &self,
        req: UpstreamRequest,
        timer: &'t IdleTimer,
    ) -> Result<LineStream<'t>, GatewayError> {
        let resp = self.send(req, timer).await?;
        Ok(LineStream {
            headers: resp.headers,
            body: resp.body,
            splitter: LineSplitter::new(),
            pending: VecDeque::new(),
            timer,
            finished: false,
        })
    }

    /// Performs a buffered call and decodes the whole body as one completion.
    pub async fn complete(
        &self,
        req: UpstreamRequest,
        timer: &IdleTimer,
    ) -> Result<(Headers, ChatCompletionResponse), GatewayError> {
        let UpstreamResponse {
            headers, mut body, ..
        } = self.send(req, timer).await?;

        let mut buf = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = timer.scope().cancelled() => {
                    return Err(GatewayError::from_fired(timer.fired_reason()));
                }
                item = body.next() => item,
            };
            match next {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    timer.reset();
                    if buf.is_empty() {
                        timer.mark_first_content();
                    }
                    buf.extend_from_slice(&chunk);
                }
                Some(Err(err)) => return Err(read_error(err, timer)),
                None => break,
            }
        }

        let response = serde_json::from_slice::<ChatCompletionResponse>(&buf)
            .map_err(|err| GatewayError::Decode(err.to_string()))?;
        Ok((headers, response))
    }

    async fn send(
        &self,
        req: UpstreamRequest,
        timer: &IdleTimer,
    ) -> Result<UpstreamResponse, GatewayError> {
        let url = req.url.clone();
        let sent = tokio::select! {
            biased;
            _ = timer.scope().cancelled() => {
                return Err(GatewayError::from_fired(timer.fired_reason()));
            }
            sent = self.client.send(req) => sent,
        };
        let resp = match sent {
            Ok(resp) => resp,
            Err(err) => {
                if timer.is_cancelled() {
                    return Err(GatewayError::from_fired(timer.fired_reason()));
                }
                warn!(url = %url, kind = ?err.kind, error = %err.message, "upstream connect failed");
                return Err(GatewayError::ModelServiceUnavailable(err.message));
            }
        };
        timer.reset();

        if !(200..300).contains(&resp.status) {
            let status = resp.status;
            let body = read_error_body(resp.body, timer).await;
            warn!(
                url = %url,
                status,
                body = %String::from_utf8_lossy(&body),
                "upstream returned error status"
            );
            return Err(GatewayError::from_upstream_status(status, &body));
        }
        Ok(resp)
    }
}

async fn read_error_body(mut body: ByteStream, timer: &IdleTimer) -> Vec<u8> {
    let mut buf = Vec::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = timer.scope().cancelled() => break,
            item = body.next() => item,
        };
        let Some(Ok(chunk)) = next else {
            break;
        };
        timer.reset();
        let room = MAX_ERROR_BODY_BYTES.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() >= MAX_ERROR_BODY_BYTES {
            break;
        }
    }
    buf
}

fn read_error(err: TransportError, timer: &IdleTimer) -> GatewayError {
    if timer.is_cancelled() {
        return GatewayError::from_fired(timer.fired_reason());
    }
    warn!(kind = ?err.kind, error = %err.message, "upstream read failed");
    GatewayError::Network(err.message)
}

/// Body of a streaming call, split into non-blank lines.
pub struct LineStream<'t> {
    headers: Headers,
    body: ByteStream,
    splitter: LineSplitter,
    pending: VecDeque<String>,
    timer: &'t IdleTimer,
    finished: bool,
}

impl LineStream<'_> {
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Next line carrying data, or `None` at end of stream. Structural blank
    /// lines reset the timer but are not returned.
    pub async fn next_line(&mut self) -> Result<Option<String>, GatewayError> {
        let timer = self.timer;
        loop {
            while let Some(line) = self.pending.pop_front() {
                timer.reset();
                if !line.trim().is_empty() {
                    return Ok(Some(line));
                }
            }
            if self.finished {
                return Ok(None);
            }

            let next = tokio::select! {
                biased;
                _ = timer.scope().cancelled() => {
                    return Err(GatewayError::from_fired(timer.fired_reason()));
                }
                item = self.body.next() => item,
            };
            match next {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    timer.reset();
                    let lines = self
                        .splitter
                        .push(&chunk)
                        .map_err(|err| GatewayError::Network(err.to_string()))?;
                    self.pending.extend(lines);
                }
                Some(Err(err)) => return Err(read_error(err, timer)),
                None => {
                    self.finished = true;
                    self.pending.extend(self.splitter.finish());
                }
            }
        }
    }
}

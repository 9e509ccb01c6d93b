use bytes::Bytes;
use streamgate_common::{Headers, header_get, header_set};
use streamgate_protocol::chat::{ChatCompletionChunk, Usage};
use streamgate_protocol::sse::{
    StreamLine, encode_data, encode_done, encode_raw_line, encode_verbatim_line, parse_stream_line,
};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::error::GatewayError;

const STREAM_BUFFER: usize = 32;

/// Status and headers of a streaming response, released before the first
/// frame so forwarded upstream headers can still be added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn event_stream() -> Self {
        Self {
            status: 200,
            headers: vec![(
                "content-type".to_string(),
                "text/event-stream".to_string(),
            )],
        }
    }
}

/// Client side of one streaming request.
///
/// `committed` turns true on the first content frame and never goes back.
/// A failed write means the client is gone; it surfaces as
/// [`GatewayError::Downstream`].
pub struct SseWriter {
    tx: mpsc::Sender<Bytes>,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    head: ResponseHead,
    forward: Vec<String>,
    forwarded: Headers,
    committed: bool,
    terminated: bool,
}

pub struct SseChannels {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<Bytes>,
}

impl SseWriter {
    pub fn new(forward: Vec<String>) -> (Self, SseChannels) {
        let (tx, body) = mpsc::channel::<Bytes>(STREAM_BUFFER);
        let (head_tx, head) = oneshot::channel();
        let writer = Self {
            tx,
            head_tx: Some(head_tx),
            head: ResponseHead::event_stream(),
            forward,
            forwarded: Vec::new(),
            committed: false,
            terminated: false,
        };
        (writer, SseChannels { head, body })
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Headers copied from upstream responses so far, for the audit record.
    pub fn forwarded_headers(&self) -> &Headers {
        &self.forwarded
    }

    /// Copies the configured headers from an upstream response. The first
    /// non-empty value seen for a name wins for the rest of the request.
    pub fn forward_headers(&mut self, upstream: &Headers) {
        for name in &self.forward {
            let Some(value) = header_get(upstream, name).filter(|v| !v.is_empty()) else {
                continue;
            };
            if header_get(&self.forwarded, name).is_some() {
                continue;
            }
            header_set(&mut self.forwarded, name.clone(), value);
            if self.head_tx.is_some() && header_get(&self.head.headers, name).is_none() {
                header_set(&mut self.head.headers, name.clone(), value);
                info!(header = %name, value = %value, "response header set");
            }
        }
    }

    /// Overrides a response header; ignored once the head has been sent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if self.head_tx.is_some() {
            header_set(&mut self.head.headers, name, value);
        }
    }

    /// Passes an upstream line that carries no content (role, usage,
    /// comments). Does not commit the stream.
    pub async fn send_passthrough(&mut self, line: &str) -> Result<(), GatewayError> {
        self.write(encode_raw_line(line)).await
    }

    /// Writes an upstream line untouched. Used by raw mode; commits. A
    /// forwarded `[DONE]` counts as the terminal emission.
    pub async fn send_verbatim(&mut self, line: &str) -> Result<(), GatewayError> {
        self.write(encode_verbatim_line(line)).await?;
        self.committed = true;
        if matches!(parse_stream_line(line), StreamLine::Done) {
            self.terminated = true;
        }
        Ok(())
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Sends one content frame built on `template`'s envelope; commits.
    pub async fn send_content(
        &mut self,
        template: &ChatCompletionChunk,
        content: &str,
        usage: Option<Usage>,
    ) -> Result<(), GatewayError> {
        let frame = template.with_content(content, usage);
        let bytes = encode_data(&frame).map_err(|err| GatewayError::Encode(err.to_string()))?;
        self.write(bytes).await?;
        self.committed = true;
        Ok(())
    }

    pub async fn send_done(&mut self) -> Result<(), GatewayError> {
        self.write(encode_done()).await?;
        self.terminated = true;
        Ok(())
    }

    /// Emits the error frame followed by `[DONE]`. Only the first terminal
    /// emission reaches the client.
    pub async fn send_error(&mut self, err: &GatewayError) -> Result<(), GatewayError> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        let frame =
            encode_data(&err.envelope()).map_err(|err| GatewayError::Encode(err.to_string()))?;
        self.write(frame).await?;
        self.write(encode_done()).await
    }

    fn release_head(&mut self) {
        if let Some(head_tx) = self.head_tx.take() {
            let _ = head_tx.send(self.head.clone());
        }
    }

    async fn write(&mut self, bytes: Bytes) -> Result<(), GatewayError> {
        self.release_head();
        self.tx
            .send(bytes)
            .await
            .map_err(|_| GatewayError::Downstream)
    }
}

impl Drop for SseWriter {
    fn drop(&mut self) {
        self.release_head();
    }
}

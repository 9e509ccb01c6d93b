#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use streamgate_core::tools::{ToolError, ToolExecutor, opening_tag};
use streamgate_core::upstream::{
    ByteStream, TransportError, TransportErrorKind, UpstreamClient, UpstreamRequest,
    UpstreamResponse,
};

/// One scripted upstream reply.
pub enum Script {
    Status(u16, String),
    Json(String),
    /// Body chunks delivered as fast as they are polled.
    Chunks(Vec<String>),
    /// Body chunks each preceded by a delay.
    Delayed(Vec<(Duration, String)>),
    /// Body chunks followed by silence that never ends.
    Stall(Vec<String>),
    /// Body chunks followed by a dropped connection.
    Broken(Vec<String>),
    ConnectError,
}

impl Script {
    pub fn status(status: u16, body: &str) -> Self {
        Self::Status(status, body.to_string())
    }

    /// SSE body built from content deltas, one chunk per delta, terminated
    /// by a usage chunk and `[DONE]`.
    pub fn sse(deltas: &[&str]) -> Self {
        let mut chunks: Vec<String> = deltas.iter().map(|delta| content_line(delta)).collect();
        chunks.push(
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":4,\"total_tokens\":7}}\n\n"
                .to_string(),
        );
        chunks.push("data: [DONE]\n\n".to_string());
        Self::Chunks(chunks)
    }

    /// SSE body with no usage chunk.
    pub fn sse_without_usage(deltas: &[&str]) -> Self {
        let mut chunks: Vec<String> = deltas.iter().map(|delta| content_line(delta)).collect();
        chunks.push("data: [DONE]\n\n".to_string());
        Self::Chunks(chunks)
    }

    fn into_response(self) -> Result<UpstreamResponse, TransportError> {
        let (status, body): (u16, ByteStream) = match self {
            Script::Status(status, body) => (status, chunks(vec![body])),
            Script::Json(body) => (200, chunks(vec![body])),
            Script::Chunks(parts) => (200, chunks(parts)),
            Script::Delayed(parts) => (
                200,
                Box::pin(stream::iter(parts).then(|(delay, part)| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, TransportError>(Bytes::from(part))
                })) as ByteStream,
            ),
            Script::Stall(parts) => (
                200,
                Box::pin(chunks(parts).chain(stream::pending())) as ByteStream,
            ),
            Script::Broken(parts) => (
                200,
                Box::pin(chunks(parts).chain(stream::once(async {
                    Err(TransportError::new(
                        TransportErrorKind::Other,
                        "connection reset by peer",
                    ))
                }))) as ByteStream,
            ),
            Script::ConnectError => {
                return Err(TransportError::new(
                    TransportErrorKind::Connect,
                    "connection refused",
                ));
            }
        };
        Ok(UpstreamResponse {
            status,
            headers: vec![
                ("content-type".to_string(), "text/event-stream".to_string()),
                ("x-oneapi-request-id".to_string(), "upstream-1".to_string()),
            ],
            body,
        })
    }
}

pub fn content_line(delta: &str) -> String {
    let chunk = serde_json::json!({
        "id": "c1",
        "object": "chat.completion.chunk",
        "created": 1,
        "model": "m",
        "choices": [{"index": 0, "delta": {"content": delta}}]
    });
    format!("data: {chunk}\n\n")
}

fn chunks(parts: Vec<String>) -> ByteStream {
    Box::pin(stream::iter(
        parts
            .into_iter()
            .map(|part| Ok::<_, TransportError>(Bytes::from(part))),
    ))
}

/// Upstream that replays scripts in order and remembers every request.
#[derive(Default)]
pub struct ScriptedUpstream {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedUpstream {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// `model` field of every request body, in call order.
    pub fn models(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|req| {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                body["model"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }
}

impl UpstreamClient for ScriptedUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(req);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Script::status(500, "no script left"));
            script.into_response()
        })
    }
}

/// Tool executor that recognizes a fixed set of tags and returns a canned
/// result, counting executions.
pub struct FakeTools {
    names: Vec<String>,
    result: Result<String, ToolError>,
    inputs: Mutex<Vec<String>>,
}

impl FakeTools {
    pub fn new(names: &[&str], result: Result<&str, ToolError>) -> Arc<Self> {
        Arc::new(Self {
            names: names.iter().map(|name| name.to_string()).collect(),
            result: result.map(str::to_string),
            inputs: Mutex::new(Vec::new()),
        })
    }

    pub fn executions(&self) -> usize {
        self.inputs.lock().unwrap().len()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for FakeTools {
    async fn detect_tool(&self, text: &str) -> Option<String> {
        self.names
            .iter()
            .find(|name| text.contains(&opening_tag(name)))
            .cloned()
    }

    async fn execute(&self, _name: &str, input: &str) -> Result<String, ToolError> {
        self.inputs.lock().unwrap().push(input.to_string());
        self.result.clone()
    }

    fn list_tools(&self) -> String {
        self.names.join(", ")
    }

    fn tool_names(&self) -> Vec<String> {
        self.names.clone()
    }
}

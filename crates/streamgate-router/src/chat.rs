use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use streamgate_common::Headers;
use streamgate_core::{ChatOutcome, Gateway, GatewayError, ResponseHead};
use streamgate_protocol::chat::ChatCompletionRequest;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ChatState {
    pub gateway: Arc<Gateway>,
}

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";

pub fn gateway_router(gateway: Arc<Gateway>) -> Router {
    let state = ChatState { gateway };

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn chat_completions(
    State(state): State<ChatState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "invalid chat request body");
            let err = GatewayError::Client(format!("invalid request body: {err}"));
            return to_axum_response(ChatOutcome::error(&err), None).await;
        }
    };

    // Cancels the request when this future or the response body is dropped.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let outcome = state
        .gateway
        .chat(request, headers_to_vec(&headers), cancel)
        .await;
    to_axum_response(outcome, Some(guard)).await
}

async fn to_axum_response(outcome: ChatOutcome, guard: Option<DropGuard>) -> Response {
    match outcome {
        ChatOutcome::Json {
            status,
            headers,
            body,
        } => build_response(status, &headers, Body::from(body)),
        ChatOutcome::Stream { head, body } => stream_response(head, body, guard).await,
    }
}

/// Waits for the head, which is released right before the first frame.
async fn stream_response(
    head: oneshot::Receiver<ResponseHead>,
    body: mpsc::Receiver<Bytes>,
    guard: Option<DropGuard>,
) -> Response {
    let head = head.await.unwrap_or_else(|_| {
        debug!("stream ended before a head was released");
        ResponseHead::event_stream()
    });
    let rx = wrap_sse_stream_with_heartbeat(body);
    let stream = ReceiverStream::new(rx).map(move |chunk| {
        let _held = &guard;
        Ok::<_, Infallible>(chunk)
    });
    let mut response = build_response(head.status, &head.headers, Body::from_stream(stream));
    // Hint common reverse proxies to avoid buffering SSE responses.
    let h = response.headers_mut();
    h.entry(header::CACHE_CONTROL)
        .or_insert(HeaderValue::from_static("no-cache"));
    h.entry(HeaderName::from_static("x-accel-buffering"))
        .or_insert(HeaderValue::from_static("no"));
    response
}

fn build_response(status: u16, headers: &Headers, body: Body) -> Response {
    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        for (k, v) in headers {
            // Drop hop-by-hop and framing headers. Hyper sets framing itself.
            if is_hop_by_hop_or_framing_header(k) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                h.append(name, value);
            }
        }
    }

    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

fn wrap_sse_stream_with_heartbeat(mut upstream_rx: mpsc::Receiver<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate tick; first heartbeat should be sent after the interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                maybe_chunk = upstream_rx.recv() => {
                    let Some(chunk) = maybe_chunk else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    let mut out: Headers = Vec::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            out.push((name.as_str().to_string(), v.to_string()));
        }
    }
    out
}

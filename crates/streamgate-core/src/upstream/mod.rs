mod client;
mod reader;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;
use streamgate_common::Headers;

pub use client::{UpstreamClientConfig, WreqUpstreamClient};
pub use reader::{LineStream, UpstreamReader};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: ByteStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One HTTP exchange with an LLM backend. The body is returned unread so the
/// caller can drive it under its own idle timer.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>>;
}

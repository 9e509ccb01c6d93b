pub mod error;
pub mod events;
pub mod gateway;
pub mod orchestrator;
pub mod pipeline;
pub mod routing;
pub mod timeout;
pub mod tools;
pub mod upstream;
pub mod usage;
pub mod writer;

pub use error::{ApiError, ApiErrorSubtype, GatewayError};
pub use events::{EventHub, EventSink, SinkError, TerminalEventSink};
pub use gateway::{ChatOutcome, Gateway};
pub use orchestrator::{AttemptCtx, AttemptFailure, AttemptRunner, Orchestrator, RetryPolicy};
pub use pipeline::{PipelineSettings, StreamingPipeline, UpstreamTarget};
pub use routing::{ModelRouter, RouteDecision, RouteError, StaticRouter};
pub use timeout::{FiredReason, IdleTimer, IdleTracker};
pub use tools::{HttpToolExecutor, ToolError, ToolExecutor};
pub use upstream::{UpstreamClient, UpstreamReader, WreqUpstreamClient};
pub use usage::{TiktokenCounter, TokenCounter};
pub use writer::{ResponseHead, SseWriter};

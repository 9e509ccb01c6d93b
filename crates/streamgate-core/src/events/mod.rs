mod hub;
mod terminal_sink;
mod types;

pub use hub::{EventHub, EventSink, SinkError};
pub use terminal_sink::TerminalEventSink;
pub use types::{ChatRecord, Event, LatencyRecord, ToolCallRecord, ToolStatus};

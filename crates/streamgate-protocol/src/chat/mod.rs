mod request;
mod response;
mod stream;
mod types;

pub use request::{AUTO_MODEL, ChatCompletionRequest};
pub use response::{ChatCompletionChoice, ChatCompletionResponse, ResponseMessage};
pub use stream::{ChatCompletionChunk, ChunkChoice, ChunkDelta};
pub use types::{
    ChatMessage, ContentPart, ExtraBody, MessageContent, PromptMode, Role, StreamOptions, Usage,
};

pub mod chat;
pub mod error;
pub mod sse;

pub use error::{ErrorBody, ErrorEnvelope};

mod chat;

pub use chat::{ChatState, gateway_router};

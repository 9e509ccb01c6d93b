use streamgate_protocol::chat::{ChatMessage, Usage};
use tiktoken_rs::{CoreBPE, get_bpe_from_model, o200k_base};
use tracing::warn;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> u64;
}

/// BPE token counter. Falls back to a four-characters-per-token estimate if
/// no encoding could be loaded.
pub struct TiktokenCounter {
    bpe: Option<CoreBPE>,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        Self::for_model("")
    }

    pub fn for_model(model: &str) -> Self {
        let bpe = get_bpe_from_model(model).or_else(|_| o200k_base());
        match bpe {
            Ok(bpe) => Self { bpe: Some(bpe) },
            Err(err) => {
                warn!(model = %model, error = %err, "tokenizer unavailable, estimating from length");
                Self { bpe: None }
            }
        }
    }
}

impl Default for TiktokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> u64 {
        match &self.bpe {
            Some(bpe) => bpe.encode_ordinary(text).len() as u64,
            None => estimate_tokens(text),
        }
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Text the prompt side of usage is counted from.
pub fn prompt_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(ChatMessage::text)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Usage for responses that did not report one.
pub fn synthesize_usage(counter: &dyn TokenCounter, prompt: &str, completion: &str) -> Usage {
    let prompt_tokens = counter.count(prompt);
    let completion_tokens = counter.count(completion);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CharCounter;

    impl TokenCounter for CharCounter {
        fn count(&self, text: &str) -> u64 {
            text.chars().count() as u64
        }
    }

    #[test]
    fn synthesis_is_deterministic_and_sums() {
        let first = synthesize_usage(&CharCounter, "hello there", "hi");
        let second = synthesize_usage(&CharCounter, "hello there", "hi");
        assert_eq!(first, second);
        assert_eq!(first.prompt_tokens, 11);
        assert_eq!(first.completion_tokens, 2);
        assert_eq!(first.total_tokens, first.prompt_tokens + first.completion_tokens);
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}

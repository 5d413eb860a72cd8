//! Prompt/completion token counting via `tiktoken-rs`, used by the runner
//! when a provider doesn't report usage itself and by the cost engine's
//! tiered-rate threshold checks.

use tiktoken_rs::CoreBPE;

use crate::domain::Message;

/// Tokenizers take time to build on first use; loading them outside the
/// request path avoids paying that cost inside a user's first completion.
pub fn preload() {
    let _ = tiktoken_rs::cl100k_base_singleton();
}

fn bpe() -> &'static CoreBPE {
    tiktoken_rs::cl100k_base_singleton()
}

pub fn count_text_tokens(text: &str) -> u32 {
    bpe().encode_with_special_tokens(text).len() as u32
}

/// Approximate prompt token count for a full message list, following the
/// OpenAI chat-completion counting convention: three tokens of per-message
/// overhead, one for the role, the encoded text, plus three for the
/// assistant reply priming.
pub fn count_message_tokens(messages: &[Message]) -> u32 {
    let mut total = 0u32;

    for message in messages {
        total += 3;
        total += 1; // role
        total += count_text_tokens(&message.text_content());
    }

    total + 3
}

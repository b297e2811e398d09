use parley_db::Turn;

use crate::providers::{ChatMessage, ChatRole};

/// Per-message framing overhead used by the token estimate.
const TOKENS_PER_MESSAGE: usize = 4;

/// Compose the request turns: the persona as `system`, each stored turn as a
/// `user`/`assistant` pair in order, then the new message as the final `user`.
pub fn build_prompt(persona: &str, history: &[Turn], new_message: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() * 2 + 2);
    messages.push(ChatMessage::new(ChatRole::System, persona));

    for turn in history {
        messages.push(ChatMessage::new(ChatRole::User, turn.user.as_str()));
        messages.push(ChatMessage::new(ChatRole::Assistant, turn.bot.as_str()));
    }

    messages.push(ChatMessage::new(ChatRole::User, new_message));
    messages
}

/// Rough token estimate: ~4 characters per token plus per-message framing.
/// Only used when the upstream does not report usage.
pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u32 {
    let tokens: usize = messages
        .iter()
        .map(|m| TOKENS_PER_MESSAGE + m.content.chars().count() / 4)
        .sum();
    (tokens + 2) as u32
}

pub fn estimate_answer_tokens(answer: &str) -> u32 {
    (1 + answer.chars().count() / 4) as u32
}

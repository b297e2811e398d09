use std::sync::Arc;

use parley_common::{Error, Result};
use parley_config::CompletionOptions;
use parley_db::Turn;
use tracing::{debug, instrument, warn};

use crate::prompt::{build_prompt, estimate_answer_tokens, estimate_prompt_tokens};
use crate::providers::{ChatMessage, LlmProvider, LlmRequest, LlmResponse};

/// A finished completion with the usage it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub answer: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// How many of the oldest history turns were left out to fit the context.
    pub trimmed_turns: usize,
}

/// Outcome of a single upstream attempt.
enum Attempt {
    Answered(LlmResponse),
    Overflow(String),
    Failed(Error),
}

impl From<Result<LlmResponse>> for Attempt {
    fn from(result: Result<LlmResponse>) -> Self {
        match result {
            Ok(response) => Attempt::Answered(response),
            Err(Error::ContextOverflow(reason)) => Attempt::Overflow(reason),
            Err(e) => Attempt::Failed(e),
        }
    }
}

/// Completion call with a bounded trim-and-retry loop for context overflow.
pub struct CompletionClient {
    provider: Arc<dyn LlmProvider>,
    options: CompletionOptions,
}

impl CompletionClient {
    pub fn new(provider: Arc<dyn LlmProvider>, options: CompletionOptions) -> Self {
        Self { provider, options }
    }

    /// Ask the provider to answer `new_message` given `persona` and `history`.
    ///
    /// On overflow the oldest turn is dropped and the request is retried, so
    /// a history of `K` turns costs at most `K + 1` calls. Once the history is
    /// exhausted the error is `PromptTooLarge`. The new message is always sent.
    #[instrument(skip(self, persona, history, new_message), fields(history_len = history.len()))]
    pub async fn complete(
        &self,
        model: &str,
        persona: &str,
        history: &[Turn],
        new_message: &str,
    ) -> Result<Completion> {
        let mut skip = 0usize;
        loop {
            let messages = build_prompt(persona, &history[skip..], new_message);
            let request = self.request(model, messages);

            match Attempt::from(self.provider.complete(&request).await) {
                Attempt::Answered(response) => {
                    let answer = response.content.trim().to_string();
                    let (input_tokens, output_tokens) = match response.usage {
                        Some(usage) => (usage.input_tokens, usage.output_tokens),
                        None => (
                            estimate_prompt_tokens(&request.messages),
                            estimate_answer_tokens(&answer),
                        ),
                    };
                    debug!(
                        input_tokens,
                        output_tokens, trimmed = skip, "completion finished"
                    );
                    return Ok(Completion {
                        answer,
                        input_tokens,
                        output_tokens,
                        trimmed_turns: skip,
                    });
                }
                Attempt::Overflow(reason) => {
                    if skip >= history.len() {
                        warn!("prompt overflows even without history: {reason}");
                        return Err(Error::PromptTooLarge);
                    }
                    skip += 1;
                    debug!(
                        remaining = history.len() - skip,
                        "context overflow, dropping oldest turn"
                    );
                }
                Attempt::Failed(e) => return Err(e),
            }
        }
    }

    fn request(&self, model: &str, messages: Vec<ChatMessage>) -> LlmRequest {
        LlmRequest {
            model: model.to_string(),
            messages,
            max_tokens: Some(self.options.max_tokens),
            temperature: Some(self.options.temperature),
            top_p: Some(self.options.top_p),
            frequency_penalty: Some(self.options.frequency_penalty),
            presence_penalty: Some(self.options.presence_penalty),
            timeout: Some(self.options.request_timeout()),
        }
    }
}

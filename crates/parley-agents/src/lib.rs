pub mod completion;
pub mod conversation;
pub mod openai;
pub mod prompt;
pub mod providers;

pub use completion::{Completion, CompletionClient};
pub use conversation::{ControllerSettings, ConversationController, Outcome, SlotState};
pub use openai::OpenAiProvider;
pub use prompt::build_prompt;
pub use providers::{ChatMessage, ChatRole, LlmProvider, LlmRequest, LlmResponse, Usage};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("prompt too large: the message alone exceeds the model context")]
    PromptTooLarge,

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short, user-facing description of a failed exchange.
    pub fn user_notice(&self) -> String {
        match self {
            Error::PromptTooLarge => {
                "Your message is too long for me to answer, please shorten it.".to_string()
            }
            Error::Cancelled => "Canceled".to_string(),
            Error::Upstream(_) | Error::ContextOverflow(_) => {
                "Something went wrong while talking to the model, please try again.".to_string()
            }
            _ => "Something went wrong, please try again.".to_string(),
        }
    }
}

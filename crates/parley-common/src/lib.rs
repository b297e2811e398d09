pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{ChatKind, InboundMessage, UserProfile};
pub use types::{ChatId, DialogId, UserId};

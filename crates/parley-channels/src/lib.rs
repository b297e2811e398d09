pub mod commands;
pub mod telegram_html;
pub mod traits;

#[cfg(feature = "telegram")]
pub mod telegram;

pub use commands::{BotCommand, HELP_TEXT, is_command, parse_command};
pub use telegram_html::{MAX_MESSAGE_CHARS, escape_html, truncate_html};
pub use traits::{ChannelLifecycle, ChannelStatus, ChatTransport, SentMessage};

#[cfg(feature = "telegram")]
pub use telegram::{OnCommandFn, OnMessageFn, TelegramChannel, TelegramHandlers, TelegramTransport};

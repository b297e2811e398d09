/// Slash commands understood by the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    /// First contact; registers the user and starts a dialog.
    Start,
    /// Start a fresh dialog.
    New,
    /// Cancel the in-flight reply.
    Cancel,
    Help,
}

impl BotCommand {
    pub fn name(self) -> &'static str {
        match self {
            BotCommand::Start => "start",
            BotCommand::New => "new",
            BotCommand::Cancel => "cancel",
            BotCommand::Help => "help",
        }
    }
}

pub const HELP_TEXT: &str = "Commands:\n\
⚪ /new – Start a new dialog\n\
⚪ /cancel – Cancel the current reply\n\
⚪ /help – Show this message";

/// Parse a leading `/command` or `/command@botname`.
///
/// Commands addressed to a different bot, unknown commands, and plain text
/// all return `None`.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<BotCommand> {
    let first = text.split_whitespace().next()?;
    let body = first.strip_prefix('/')?;

    let (name, target) = match body.split_once('@') {
        Some((name, target)) => (name, Some(target)),
        None => (body, None),
    };

    if let (Some(target), Some(me)) = (target, bot_username)
        && !target.eq_ignore_ascii_case(me)
    {
        return None;
    }

    match name.to_ascii_lowercase().as_str() {
        "start" => Some(BotCommand::Start),
        "new" => Some(BotCommand::New),
        "cancel" => Some(BotCommand::Cancel),
        "help" => Some(BotCommand::Help),
        _ => None,
    }
}

/// Whether `text` is shaped like a slash command, known or not.
pub fn is_command(text: &str) -> bool {
    text.trim_start().starts_with('/')
}

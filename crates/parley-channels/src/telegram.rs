use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, Message, MessageId, ParseMode, ReplyParameters};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::commands::{BotCommand, is_command, parse_command};
use crate::telegram_html::html_to_plain;
use crate::traits::{ChannelLifecycle, ChannelStatus, ChatTransport, SentMessage};
use parley_common::{ChatKind, Error, InboundMessage, Result, UserProfile};

/// Callback invoked for every text message the bot should answer.
pub type OnMessageFn =
    Arc<dyn Fn(InboundMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback invoked for recognised slash commands.
pub type OnCommandFn = Arc<
    dyn Fn(BotCommand, InboundMessage) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct TelegramHandlers {
    pub on_message: OnMessageFn,
    pub on_command: OnCommandFn,
}

/// Who the bot is, needed to recognise mentions and replies in groups.
#[derive(Debug, Clone)]
struct BotIdentity {
    id: u64,
    username: String,
}

pub struct TelegramChannel {
    bot: Bot,
    display: String,
    status: ChannelStatus,
    handlers: Option<TelegramHandlers>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl TelegramChannel {
    pub fn new(bot_token: &str) -> Self {
        Self {
            bot: Bot::new(bot_token),
            display: "Telegram".to_string(),
            status: ChannelStatus::Disconnected,
            handlers: None,
            shutdown_tx: None,
        }
    }

    pub fn with_handlers(mut self, handlers: TelegramHandlers) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// A send-only handle sharing this channel's bot client.
    pub fn create_transport(&self) -> TelegramTransport {
        TelegramTransport {
            bot: self.bot.clone(),
        }
    }
}

/// Build an inbound message from a Telegram update.
/// Returns None if the message should be ignored (e.g. from a bot or missing sender).
fn extract_inbound(msg: &Message, text: &str) -> Option<InboundMessage> {
    // Ignore messages without a sender (e.g. channel posts)
    let user = msg.from.as_ref()?;

    // Telegram "Group Anonymous Bot" ID used for anonymous admins.
    const ANONYMOUS_BOT_ID: u64 = 1087968824;

    if user.is_bot && user.id.0 != ANONYMOUS_BOT_ID {
        return None;
    }

    let chat_kind = if msg.chat.is_private() {
        ChatKind::Direct
    } else {
        ChatKind::Group
    };

    let inbound = InboundMessage::text(
        user.id.0.to_string().as_str().into(),
        parley_common::ChatId(msg.chat.id.0),
        chat_kind,
        text,
    )
    .with_profile(UserProfile {
        username: user.username.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
    })
    .with_reply_to(msg.id.0);

    Some(inbound)
}

/// Direct chats are always answered; in groups the bot must be mentioned by
/// `@username` or the message must reply to one of the bot's messages.
fn should_respond(msg: &Message, text: &str, me: &BotIdentity) -> bool {
    if msg.chat.is_private() {
        return true;
    }

    let mention = format!("@{}", me.username);
    if text.to_lowercase().contains(&mention.to_lowercase()) {
        return true;
    }

    msg.reply_to_message()
        .and_then(|reply| reply.from.as_ref())
        .is_some_and(|author| author.id.0 == me.id)
}

fn dispatch(handlers: &TelegramHandlers, me: &BotIdentity, msg: Message, text: String) {
    let Some(inbound) = extract_inbound(&msg, &text) else {
        return;
    };

    if let Some(command) = parse_command(&text, Some(me.username.as_str())) {
        info!(
            "telegram command /{} from uid={} (chat {})",
            command.name(),
            inbound.user_id,
            inbound.chat_id
        );
        tokio::spawn((handlers.on_command)(command, inbound));
        return;
    }
    if is_command(&text) {
        debug!("ignoring unrecognised command in chat {}", inbound.chat_id);
        return;
    }

    if !should_respond(&msg, &text, me) {
        debug!("ignoring unaddressed group message in chat {}", inbound.chat_id);
        return;
    }

    info!(
        "telegram message from {} [uid={}] (chat {}): {} chars",
        inbound.profile.display_name(),
        inbound.user_id,
        inbound.chat_id,
        text.len()
    );
    // Each message runs on its own task so /cancel is never queued behind a reply.
    tokio::spawn((handlers.on_message)(inbound));
}

#[async_trait]
impl ChannelLifecycle for TelegramChannel {
    fn display_name(&self) -> &str {
        &self.display
    }

    async fn connect(&mut self) -> Result<()> {
        let handlers = self
            .handlers
            .clone()
            .ok_or_else(|| Error::Channel("telegram handlers not configured".into()))?;

        self.status = ChannelStatus::Connecting;
        let me = self
            .bot
            .get_me()
            .await
            .map_err(|e| Error::Channel(format!("telegram getMe failed: {e}")))?;
        let identity = BotIdentity {
            id: me.id.0,
            username: me.username().to_string(),
        };
        info!("telegram bot authorised as @{}", identity.username);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        let bot = self.bot.clone();

        tokio::spawn(async move {
            let handler = Update::filter_message()
                .filter_map(|msg: Message| {
                    let text = msg.text()?.to_string();
                    Some((msg, text))
                })
                .endpoint(move |(msg, text): (Message, String)| {
                    let handlers = handlers.clone();
                    let identity = identity.clone();
                    async move {
                        dispatch(&handlers, &identity, msg, text);
                        respond(())
                    }
                });

            let mut dispatcher = Dispatcher::builder(bot, handler)
                .default_handler(|upd| async move {
                    tracing::trace!("unhandled update: {:?}", upd.kind);
                })
                .build();

            let token = dispatcher.shutdown_token();
            tokio::spawn(async move {
                let mut rx = shutdown_rx;
                while rx.changed().await.is_ok() {
                    if *rx.borrow() {
                        if let Err(e) = token.shutdown() {
                            warn!("telegram shutdown token error: {e:?}");
                        }
                        break;
                    }
                }
            });

            info!("telegram bot polling started");
            dispatcher.dispatch().await;
            info!("telegram bot polling stopped");
        });

        self.status = ChannelStatus::Connected;
        info!("telegram channel connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        self.status = ChannelStatus::Disconnected;
        info!("telegram channel disconnected");
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        self.status.clone()
    }
}

/// Outbound Telegram client used by the conversation controller.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(
        &self,
        chat_id: parley_common::ChatId,
        text: &str,
        reply_to: Option<i32>,
    ) -> Result<SentMessage> {
        let chat = ChatId(chat_id.0);
        let reply = reply_to.map(|id| ReplyParameters::new(MessageId(id)));

        let mut request = self.bot.send_message(chat, text).parse_mode(ParseMode::Html);
        if let Some(reply) = reply.clone() {
            request = request.reply_parameters(reply);
        }

        let sent = match request.await {
            Ok(sent) => sent,
            Err(e) => {
                warn!("telegram html send failed, retrying as plain text: {e}");
                let mut plain = self.bot.send_message(chat, html_to_plain(text));
                if let Some(reply) = reply {
                    plain = plain.reply_parameters(reply);
                }
                plain
                    .await
                    .map_err(|e| Error::Channel(format!("telegram send failed: {e}")))?
            }
        };

        Ok(SentMessage {
            chat_id,
            message_id: sent.id.0,
        })
    }

    async fn edit_text(&self, message: &SentMessage, text: &str) -> Result<()> {
        let chat = ChatId(message.chat_id.0);
        let id = MessageId(message.message_id);
        let edit_result = self
            .bot
            .edit_message_text(chat, id, text)
            .parse_mode(ParseMode::Html)
            .await;
        if let Err(e) = edit_result {
            warn!("telegram html edit failed, retrying as plain text: {e}");
            self.bot
                .edit_message_text(chat, id, html_to_plain(text))
                .await
                .map_err(|e| Error::Channel(format!("telegram edit failed: {e}")))?;
        }
        Ok(())
    }

    async fn send_typing(&self, chat_id: parley_common::ChatId) -> Result<()> {
        self.bot
            .send_chat_action(ChatId(chat_id.0), ChatAction::Typing)
            .await
            .map_err(|e| Error::Channel(format!("telegram chat action failed: {e}")))?;
        Ok(())
    }
}

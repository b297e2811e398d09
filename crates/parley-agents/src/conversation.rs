use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parley_channels::{ChatTransport, MAX_MESSAGE_CHARS, SentMessage, escape_html, truncate_html};
use parley_common::{ChatId, Error, InboundMessage, Result, UserId};
use parley_config::AppConfig;
use parley_db::{DialogStore, DialogStoreExt, NewUser, Turn};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::completion::CompletionClient;

pub const PLACEHOLDER_TEXT: &str = "...";
pub const BUSY_NOTICE: &str = "⏳ Wait a sec, I'm still replying to your previous message~";
pub const IDLE_RESET_NOTICE: &str = "It's been a while! Starting a fresh conversation 💞";
pub const NEW_DIALOG_NOTICE: &str = "Starting a new dialog ✅";
pub const WELCOME_NOTICE: &str = "Hi! Send me a message and I'll reply. Type /help for commands.";
pub const CANCELED_NOTICE: &str = "✅ Canceled";
pub const NOTHING_TO_CANCEL_NOTICE: &str = "<i>Nothing to cancel</i>";

/// Values the controller reads from configuration at startup.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub default_model: String,
    pub default_chat_mode: String,
    /// Chat mode name to persona (system prompt) text.
    pub personas: HashMap<String, String>,
    pub idle_timeout: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let default_model = config
            .default_model()
            .ok_or_else(|| Error::Config("no text model configured".into()))?
            .to_string();

        Ok(Self {
            default_model,
            default_chat_mode: config.default_chat_mode.clone(),
            personas: config
                .chat_modes
                .iter()
                .map(|(name, mode)| (name.clone(), mode.prompt_start.clone()))
                .collect(),
            idle_timeout: config.dialog_idle_timeout(),
        })
    }

    /// Persona for `chat_mode`, falling back to the default mode.
    fn persona(&self, chat_mode: &str) -> &str {
        self.personas
            .get(chat_mode)
            .or_else(|| self.personas.get(&self.default_chat_mode))
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The exchange completed and this answer was delivered.
    Answered(String),
    /// Another exchange for the user was in flight; the message was dropped.
    Busy,
    /// The exchange was cancelled before its turn was persisted.
    Cancelled,
    /// The exchange failed; the user was shown this notice.
    Failed(String),
}

/// Observable per-user controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
    Cancelling,
}

/// Per-user exclusive permit plus the handle of the exchange holding it.
#[derive(Default)]
struct UserSlot {
    permit: Arc<AsyncMutex<()>>,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl UserSlot {
    fn in_flight(&self) -> Option<CancellationToken> {
        self.in_flight.lock().ok().and_then(|token| token.clone())
    }

    fn set_in_flight(&self, token: Option<CancellationToken>) {
        if let Ok(mut current) = self.in_flight.lock() {
            *current = token;
        }
    }
}

/// Owns a user's permit for one exchange. The in-flight handle is cleared
/// before the permit is released.
struct InFlight {
    slot: Arc<UserSlot>,
    _permit: OwnedMutexGuard<()>,
}

impl InFlight {
    /// Make the exchange cancellable through `/cancel`.
    fn publish(&self) -> CancellationToken {
        let token = CancellationToken::new();
        self.slot.set_in_flight(Some(token.clone()));
        token
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.slot.set_in_flight(None);
    }
}

/// Runs conversations: one exchange at a time per user, any number of users
/// concurrently.
pub struct ConversationController {
    store: Arc<dyn DialogStore>,
    completion: Arc<CompletionClient>,
    transport: Arc<dyn ChatTransport>,
    settings: ControllerSettings,
    slots: DashMap<UserId, Arc<UserSlot>>,
}

impl ConversationController {
    pub fn new(
        store: Arc<dyn DialogStore>,
        completion: Arc<CompletionClient>,
        transport: Arc<dyn ChatTransport>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            completion,
            transport,
            settings,
            slots: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn state(&self, user_id: &UserId) -> SlotState {
        let token = self.slots.get(user_id).and_then(|slot| slot.in_flight());
        match token {
            None => SlotState::Idle,
            Some(token) if token.is_cancelled() => SlotState::Cancelling,
            Some(_) => SlotState::Busy,
        }
    }

    /// Answer one inbound text message.
    ///
    /// A message for a user with an exchange already in flight is dropped
    /// after a "still working" notice.
    #[instrument(skip(self, message), fields(user_id = %message.user_id, chat_id = %message.chat_id))]
    pub async fn handle_message(&self, message: InboundMessage) -> Result<Outcome> {
        let Some(guard) = self.try_acquire(&message.user_id) else {
            debug!("exchange already in flight, dropping message");
            self.notify(message.chat_id, BUSY_NOTICE, message.reply_to)
                .await;
            return Ok(Outcome::Busy);
        };
        let token = guard.publish();

        let (model, persona) = match self.prepare(&message).await {
            Ok(prepared) => prepared,
            Err(e @ Error::UnknownUser(_)) => return Err(e),
            Err(e) => {
                warn!("failed to prepare exchange: {e}");
                let notice = e.user_notice();
                self.notify(message.chat_id, &escape_html(&notice), message.reply_to)
                    .await;
                return Ok(Outcome::Failed(notice));
            }
        };

        let exchange = Exchange {
            store: Arc::clone(&self.store),
            completion: Arc::clone(&self.completion),
            transport: Arc::clone(&self.transport),
            message,
            model,
            persona,
            token,
        };

        let handle = tokio::spawn(async move {
            let _guard = guard;
            exchange.run().await
        });

        match handle.await {
            Ok(Ok(answer)) => Ok(Outcome::Answered(answer)),
            Ok(Err(Error::Cancelled)) => Ok(Outcome::Cancelled),
            Ok(Err(e @ Error::UnknownUser(_))) => Err(e),
            Ok(Err(e)) => Ok(Outcome::Failed(e.user_notice())),
            Err(e) => Err(Error::Internal(format!("exchange task failed: {e}"))),
        }
    }

    /// Request cancellation of the user's in-flight exchange.
    ///
    /// Returns `false`, after telling the user, when nothing is in flight.
    #[instrument(skip(self, message), fields(user_id = %message.user_id))]
    pub async fn cancel(&self, message: &InboundMessage) -> bool {
        let token = self
            .slots
            .get(&message.user_id)
            .and_then(|slot| slot.in_flight());

        match token {
            Some(token) => {
                token.cancel();
                info!("cancellation requested");
                true
            }
            None => {
                self.notify(message.chat_id, NOTHING_TO_CANCEL_NOTICE, message.reply_to)
                    .await;
                false
            }
        }
    }

    /// Start a fresh dialog on request (`/new`).
    pub async fn reset_dialog(&self, message: &InboundMessage) -> Result<bool> {
        self.restart(message, NEW_DIALOG_NOTICE).await
    }

    /// First contact (`/start`): register and open a fresh dialog.
    pub async fn start(&self, message: &InboundMessage) -> Result<bool> {
        self.restart(message, WELCOME_NOTICE).await
    }

    #[instrument(skip(self, message, notice), fields(user_id = %message.user_id))]
    async fn restart(&self, message: &InboundMessage, notice: &str) -> Result<bool> {
        // Holds the permit without publishing a handle: there is nothing
        // for /cancel to interrupt here.
        let Some(_guard) = self.try_acquire(&message.user_id) else {
            self.notify(message.chat_id, BUSY_NOTICE, message.reply_to)
                .await;
            return Ok(false);
        };

        let result = self.open_fresh_dialog(message).await;
        match &result {
            Ok(()) => self.notify(message.chat_id, notice, message.reply_to).await,
            Err(Error::UnknownUser(_)) => {}
            Err(e) => {
                warn!("failed to reset dialog: {e}");
                self.notify(message.chat_id, &escape_html(&e.user_notice()), message.reply_to)
                    .await;
            }
        }
        result.map(|()| true)
    }

    async fn open_fresh_dialog(&self, message: &InboundMessage) -> Result<()> {
        // A user registered just now already has an empty dialog.
        if !self.register_user(message).await? {
            let dialog_id = self.store.start_new_dialog(&message.user_id).await?;
            info!(%dialog_id, "dialog reset on request");
        }
        Ok(())
    }

    /// Take the user's permit without waiting. `None` when the user is busy.
    fn try_acquire(&self, user_id: &UserId) -> Option<InFlight> {
        let slot = Arc::clone(&self.slots.entry(user_id.clone()).or_default());
        let permit = Arc::clone(&slot.permit).try_lock_owned().ok()?;
        Some(InFlight {
            slot,
            _permit: permit,
        })
    }

    /// Registration, idle reset and bookkeeping ahead of an exchange.
    /// Returns the model and persona to answer with.
    async fn prepare(&self, message: &InboundMessage) -> Result<(String, String)> {
        self.register_user(message).await?;
        self.reset_if_idle(message).await?;
        self.store.touch(&message.user_id, Utc::now()).await?;
        self.model_and_persona(&message.user_id).await
    }

    /// Create the user if missing and make sure an active dialog exists.
    /// Returns whether a dialog was opened.
    async fn register_user(&self, message: &InboundMessage) -> Result<bool> {
        let user_id = &message.user_id;
        if !self.store.user_exists(user_id).await? {
            self.store
                .create_user(NewUser {
                    id: user_id.clone(),
                    chat_id: message.chat_id,
                    profile: message.profile.clone(),
                    chat_mode: self.settings.default_chat_mode.clone(),
                    model: self.settings.default_model.clone(),
                })
                .await?;
        }

        if self.store.current_dialog_id(user_id).await?.is_some() {
            return Ok(false);
        }
        let dialog_id = self.store.start_new_dialog(user_id).await?;
        debug!(%dialog_id, "opened first dialog");
        Ok(true)
    }

    /// Replace the active dialog when the user has been silent for longer
    /// than the idle timeout. Returns whether a reset happened.
    async fn reset_if_idle(&self, message: &InboundMessage) -> Result<bool> {
        let user_id = &message.user_id;
        let idle = match self.store.last_interaction(user_id).await? {
            Some(last) => (Utc::now() - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed > self.settings.idle_timeout),
            None => true,
        };
        if !idle {
            return Ok(false);
        }

        let dialog_id = self.store.start_new_dialog(user_id).await?;
        info!(%dialog_id, "idle timeout elapsed, started new dialog");
        self.notify(message.chat_id, IDLE_RESET_NOTICE, message.reply_to)
            .await;
        Ok(true)
    }

    async fn model_and_persona(&self, user_id: &UserId) -> Result<(String, String)> {
        let model: String = self
            .store
            .typed_attribute(user_id, "current_model")
            .await?
            .unwrap_or_else(|| self.settings.default_model.clone());
        let chat_mode: String = self
            .store
            .typed_attribute(user_id, "current_chat_mode")
            .await?
            .unwrap_or_else(|| self.settings.default_chat_mode.clone());
        Ok((model, self.settings.persona(&chat_mode).to_string()))
    }

    async fn notify(&self, chat_id: ChatId, text: &str, reply_to: Option<i32>) {
        if let Err(e) = self.transport.send_text(chat_id, text, reply_to).await {
            warn!("failed to send notice to chat {chat_id}: {e}");
        }
    }
}

/// One build-prompt, complete, persist cycle, run on its own task.
struct Exchange {
    store: Arc<dyn DialogStore>,
    completion: Arc<CompletionClient>,
    transport: Arc<dyn ChatTransport>,
    message: InboundMessage,
    model: String,
    persona: String,
    token: CancellationToken,
}

impl Exchange {
    async fn run(self) -> Result<String> {
        let chat_id = self.message.chat_id;
        let placeholder = self
            .transport
            .send_text(chat_id, PLACEHOLDER_TEXT, self.message.reply_to)
            .await?;
        if let Err(e) = self.transport.send_typing(chat_id).await {
            debug!("typing indicator failed: {e}");
        }

        let result = self.exchange().await;
        let text = match &result {
            Ok(answer) => truncate_html(&escape_html(answer), MAX_MESSAGE_CHARS),
            Err(Error::Cancelled) => {
                info!("exchange cancelled");
                CANCELED_NOTICE.to_string()
            }
            Err(e) => {
                warn!("exchange failed: {e}");
                escape_html(&e.user_notice())
            }
        };
        self.deliver(&placeholder, &text).await;
        result
    }

    async fn exchange(&self) -> Result<String> {
        let user_id = &self.message.user_id;
        let history = self.store.get_dialog_messages(user_id, None).await?;

        self.check_cancelled()?;
        let completion = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(Error::Cancelled),
            result = self.completion.complete(
                &self.model,
                &self.persona,
                &history,
                &self.message.text,
            ) => result?,
        };

        // Last chance to cancel; past this point the turn is written in full.
        self.check_cancelled()?;
        let mut turns = history;
        turns.push(Turn::new(
            self.message.text.clone(),
            completion.answer.clone(),
        ));
        self.store.set_dialog_messages(user_id, turns, None).await?;

        if let Err(e) = self
            .store
            .record_token_usage(
                user_id,
                &self.model,
                u64::from(completion.input_tokens),
                u64::from(completion.output_tokens),
            )
            .await
        {
            warn!("failed to record token usage: {e}");
        }

        Ok(completion.answer)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn deliver(&self, placeholder: &SentMessage, text: &str) {
        if let Err(e) = self.transport.edit_text(placeholder, text).await {
            warn!("failed to deliver reply to chat {}: {e}", placeholder.chat_id);
        }
    }
}

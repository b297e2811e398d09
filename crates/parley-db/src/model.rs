use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parley_common::{ChatId, DialogId, UserId, UserProfile};
use serde::{Deserialize, Serialize};

/// One completed exchange: the user's message and the bot's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub user: String,
    pub bot: String,
    pub date: DateTime<Utc>,
}

impl Turn {
    pub fn new(user: impl Into<String>, bot: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            bot: bot.into(),
            date: Utc::now(),
        }
    }
}

/// Cumulative token counters for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub n_input_tokens: u64,
    pub n_output_tokens: u64,
}

/// Fields needed to register a user on first contact.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: UserId,
    pub chat_id: ChatId,
    pub profile: UserProfile,
    pub chat_mode: String,
    pub model: String,
}

/// Persisted user document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub chat_id: ChatId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    pub last_interaction: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub current_dialog_id: Option<DialogId>,
    pub current_chat_mode: String,
    pub current_model: String,
    #[serde(default)]
    pub n_used_tokens: BTreeMap<String, TokenUsage>,
}

impl UserRecord {
    pub fn from_new(user: NewUser, now: DateTime<Utc>) -> Self {
        Self {
            id: user.id,
            chat_id: user.chat_id,
            username: user.profile.username,
            first_name: user.profile.first_name,
            last_name: user.profile.last_name,
            last_interaction: now,
            first_seen: now,
            current_dialog_id: None,
            current_chat_mode: user.chat_mode,
            current_model: user.model,
            n_used_tokens: BTreeMap::new(),
        }
    }
}

/// Persisted dialog document. Only the user's active dialog is appended to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialog {
    #[serde(rename = "_id")]
    pub id: DialogId,
    pub user_id: UserId,
    pub chat_mode: String,
    pub model: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Turn>,
}

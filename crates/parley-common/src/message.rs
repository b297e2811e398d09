use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChatId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
}

impl UserProfile {
    pub fn display_name(&self) -> &str {
        if self.first_name.is_empty() {
            self.username.as_deref().unwrap_or("")
        } else {
            &self.first_name
        }
    }
}

/// A text message delivered by a messaging transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub chat_kind: ChatKind,
    pub profile: UserProfile,
    pub text: String,
    /// Platform message id, used to thread replies.
    pub reply_to: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn text(
        user_id: UserId,
        chat_id: ChatId,
        chat_kind: ChatKind,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            chat_id,
            chat_kind,
            profile: UserProfile::default(),
            text: text.into(),
            reply_to: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_profile(mut self, profile: UserProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_reply_to(mut self, message_id: i32) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

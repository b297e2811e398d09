use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::{DialogId, Error, Result, UserId};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::model::{NewUser, TokenUsage, Turn};

/// Persistence for user profiles and their dialog history.
///
/// Every method is a single-document read-modify-write and is atomic with
/// respect to itself. Nothing is transactional across users and dialogs.
#[async_trait]
pub trait DialogStore: Send + Sync {
    async fn user_exists(&self, user_id: &UserId) -> Result<bool>;

    /// Register a user. No-op when the user already exists.
    async fn create_user(&self, user: NewUser) -> Result<()>;

    /// Create an empty dialog stamped with the user's current chat mode and
    /// model, and make it the user's active dialog.
    async fn start_new_dialog(&self, user_id: &UserId) -> Result<DialogId>;

    /// Read one field of the user document. Unknown keys read as `null`.
    async fn get_attribute(&self, user_id: &UserId, key: &str) -> Result<Value>;

    async fn set_attribute(&self, user_id: &UserId, key: &str, value: Value) -> Result<()>;

    /// Turns of `dialog_id`, or of the active dialog when `None`.
    async fn get_dialog_messages(
        &self,
        user_id: &UserId,
        dialog_id: Option<&DialogId>,
    ) -> Result<Vec<Turn>>;

    /// Replace the turn list of `dialog_id`, or of the active dialog when `None`.
    async fn set_dialog_messages(
        &self,
        user_id: &UserId,
        turns: Vec<Turn>,
        dialog_id: Option<&DialogId>,
    ) -> Result<()>;

    /// Add to the per-model token counters, starting a missing model at zero.
    async fn record_token_usage(
        &self,
        user_id: &UserId,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<()>;
}

/// Typed accessors layered on the attribute API.
#[async_trait]
pub trait DialogStoreExt: DialogStore {
    async fn typed_attribute<T: DeserializeOwned + Send>(
        &self,
        user_id: &UserId,
        key: &str,
    ) -> Result<Option<T>> {
        let value = self.get_attribute(user_id, key).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::Database(format!("attribute '{key}' has unexpected shape: {e}")))
    }

    async fn current_dialog_id(&self, user_id: &UserId) -> Result<Option<DialogId>> {
        self.typed_attribute(user_id, "current_dialog_id").await
    }

    async fn last_interaction(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>> {
        self.typed_attribute(user_id, "last_interaction").await
    }

    async fn touch(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<()> {
        self.set_attribute(user_id, "last_interaction", serde_json::to_value(now)?)
            .await
    }

    async fn token_usage(&self, user_id: &UserId, model: &str) -> Result<TokenUsage> {
        let usage: Option<std::collections::BTreeMap<String, TokenUsage>> =
            self.typed_attribute(user_id, "n_used_tokens").await?;
        Ok(usage
            .and_then(|map| map.get(model).copied())
            .unwrap_or_default())
    }

    /// Append one turn to the active dialog.
    async fn append_turn(&self, user_id: &UserId, turn: Turn) -> Result<()> {
        let mut turns = self.get_dialog_messages(user_id, None).await?;
        turns.push(turn);
        self.set_dialog_messages(user_id, turns, None).await
    }
}

impl<T: DialogStore + ?Sized> DialogStoreExt for T {}

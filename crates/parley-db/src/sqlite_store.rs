use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use parley_common::{DialogId, Error, Result, UserId};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::{debug, info};

use crate::dialog_store::DialogStore;
use crate::model::{Dialog, NewUser, TokenUsage, Turn, UserRecord};

/// Document store on SQLite: each user and each dialog is one JSON document
/// keyed by its id.
pub struct SqliteDialogStore {
    conn: Mutex<Connection>,
}

impl SqliteDialogStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening dialog store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    doc TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS dialogs (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    doc TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_dialogs_user
                    ON dialogs(user_id, created_at);",
            )
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("dialog store connection mutex poisoned".into()))
    }

    /// Number of stored user documents.
    pub fn count_users(&self) -> Result<usize> {
        let count: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .map_err(|e| Error::Database(format!("failed to count users: {e}")))?;
        Ok(count as usize)
    }

    /// All dialogs of a user, oldest first, including superseded ones.
    pub fn list_dialogs(&self, user_id: &UserId) -> Result<Vec<Dialog>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT doc FROM dialogs WHERE user_id = ?1 ORDER BY created_at, rowid")
            .map_err(|e| Error::Database(format!("failed to prepare dialog query: {e}")))?;

        let rows = stmt
            .query_map(params![user_id.as_str()], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Database(format!("failed to load dialogs: {e}")))?;

        let mut dialogs = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| Error::Database(format!("failed to read dialog row: {e}")))?;
            dialogs.push(serde_json::from_str(&raw)?);
        }
        Ok(dialogs)
    }

    pub fn get_user(&self, user_id: &UserId) -> Result<UserRecord> {
        let conn = self.lock()?;
        load_user(&conn, user_id)
    }
}

fn load_user_doc(conn: &Connection, user_id: &UserId) -> Result<Value> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT doc FROM users WHERE id = ?1",
            params![user_id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load user: {e}")))?;

    match raw {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Err(Error::UnknownUser(user_id.to_string())),
    }
}

fn load_user(conn: &Connection, user_id: &UserId) -> Result<UserRecord> {
    let doc = load_user_doc(conn, user_id)?;
    serde_json::from_value(doc)
        .map_err(|e| Error::Database(format!("corrupt user document for {user_id}: {e}")))
}

fn save_user_doc(conn: &Connection, user_id: &UserId, doc: &Value) -> Result<()> {
    conn.execute(
        "UPDATE users SET doc = ?1 WHERE id = ?2",
        params![doc.to_string(), user_id.as_str()],
    )
    .map_err(|e| Error::Database(format!("failed to update user: {e}")))?;
    Ok(())
}

fn load_dialog(conn: &Connection, user_id: &UserId, dialog_id: &DialogId) -> Result<Dialog> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT doc FROM dialogs WHERE id = ?1 AND user_id = ?2",
            params![dialog_id.as_str(), user_id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load dialog: {e}")))?;

    let raw = raw.ok_or_else(|| {
        Error::Database(format!("dialog {dialog_id} not found for user {user_id}"))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Resolve an explicit dialog id, or fall back to the user's active dialog.
fn resolve_dialog_id(
    conn: &Connection,
    user_id: &UserId,
    dialog_id: Option<&DialogId>,
) -> Result<Option<DialogId>> {
    match dialog_id {
        Some(id) => Ok(Some(id.clone())),
        None => Ok(load_user(conn, user_id)?.current_dialog_id),
    }
}

#[async_trait]
impl DialogStore for SqliteDialogStore {
    async fn user_exists(&self, user_id: &UserId) -> Result<bool> {
        let count: i64 = self
            .lock()?
            .query_row(
                "SELECT COUNT(*) FROM users WHERE id = ?1",
                params![user_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to check user: {e}")))?;
        Ok(count > 0)
    }

    async fn create_user(&self, user: NewUser) -> Result<()> {
        let user_id = user.id.clone();
        let record = UserRecord::from_new(user, Utc::now());
        let doc = serde_json::to_string(&record)?;
        let inserted = self
            .lock()?
            .execute(
                "INSERT INTO users (id, doc) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
                params![user_id.as_str(), doc],
            )
            .map_err(|e| Error::Database(format!("failed to create user: {e}")))?;
        if inserted > 0 {
            info!("registered user {}", user_id);
        }
        Ok(())
    }

    async fn start_new_dialog(&self, user_id: &UserId) -> Result<DialogId> {
        let mut conn = self.lock()?;
        let mut user = load_user_doc(&conn, user_id)?;
        let record: UserRecord = serde_json::from_value(user.clone())
            .map_err(|e| Error::Database(format!("corrupt user document for {user_id}: {e}")))?;

        let dialog = Dialog {
            id: DialogId::new(),
            user_id: user_id.clone(),
            chat_mode: record.current_chat_mode,
            model: record.current_model,
            start_time: Utc::now(),
            messages: Vec::new(),
        };
        user["current_dialog_id"] = Value::String(dialog.id.to_string());

        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        tx.execute(
            "INSERT INTO dialogs (id, user_id, doc) VALUES (?1, ?2, ?3)",
            params![
                dialog.id.as_str(),
                user_id.as_str(),
                serde_json::to_string(&dialog)?
            ],
        )
        .map_err(|e| Error::Database(format!("failed to insert dialog: {e}")))?;
        save_user_doc(&tx, user_id, &user)?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit new dialog: {e}")))?;

        debug!("started dialog {} for user {}", dialog.id, user_id);
        Ok(dialog.id)
    }

    async fn get_attribute(&self, user_id: &UserId, key: &str) -> Result<Value> {
        let doc = load_user_doc(&*self.lock()?, user_id)?;
        Ok(doc.get(key).cloned().unwrap_or(Value::Null))
    }

    async fn set_attribute(&self, user_id: &UserId, key: &str, value: Value) -> Result<()> {
        let conn = self.lock()?;
        let mut doc = load_user_doc(&conn, user_id)?;
        match doc.as_object_mut() {
            Some(map) => {
                map.insert(key.to_string(), value);
            }
            None => {
                return Err(Error::Database(format!(
                    "user document for {user_id} is not an object"
                )));
            }
        }
        save_user_doc(&conn, user_id, &doc)
    }

    async fn get_dialog_messages(
        &self,
        user_id: &UserId,
        dialog_id: Option<&DialogId>,
    ) -> Result<Vec<Turn>> {
        let conn = self.lock()?;
        match resolve_dialog_id(&conn, user_id, dialog_id)? {
            Some(id) => Ok(load_dialog(&conn, user_id, &id)?.messages),
            None => Ok(Vec::new()),
        }
    }

    async fn set_dialog_messages(
        &self,
        user_id: &UserId,
        turns: Vec<Turn>,
        dialog_id: Option<&DialogId>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let id = resolve_dialog_id(&conn, user_id, dialog_id)?
            .ok_or_else(|| Error::Database(format!("user {user_id} has no active dialog")))?;

        let mut dialog = load_dialog(&conn, user_id, &id)?;
        dialog.messages = turns;
        conn.execute(
            "UPDATE dialogs SET doc = ?1 WHERE id = ?2",
            params![serde_json::to_string(&dialog)?, id.as_str()],
        )
        .map_err(|e| Error::Database(format!("failed to update dialog: {e}")))?;
        Ok(())
    }

    async fn record_token_usage(
        &self,
        user_id: &UserId,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<()> {
        let conn = self.lock()?;
        let mut doc = load_user_doc(&conn, user_id)?;

        let mut usage: std::collections::BTreeMap<String, TokenUsage> =
            match doc.get("n_used_tokens") {
                Some(Value::Null) | None => Default::default(),
                Some(value) => serde_json::from_value(value.clone())?,
            };
        let entry = usage.entry(model.to_string()).or_default();
        entry.n_input_tokens += input_tokens;
        entry.n_output_tokens += output_tokens;

        doc["n_used_tokens"] = serde_json::to_value(&usage)?;
        save_user_doc(&conn, user_id, &doc)
    }
}

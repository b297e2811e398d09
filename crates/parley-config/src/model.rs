use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use parley_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Top-level application configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub telegram_token: String,

    #[serde(default)]
    pub openai_api_key: String,

    #[serde(default)]
    pub openai_api_base: Option<String>,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default = "default_chat_modes")]
    pub chat_modes: HashMap<String, ChatModeConfig>,

    #[serde(default = "default_chat_mode")]
    pub default_chat_mode: String,

    /// Dialogs idle for longer than this are replaced by a fresh one.
    #[serde(default = "default_idle_timeout_secs")]
    pub dialog_idle_timeout_secs: u64,

    #[serde(default)]
    pub completion: CompletionOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_models")]
    pub available_text_models: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            available_text_models: default_models(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatModeConfig {
    pub name: String,
    pub prompt_start: String,
}

/// Fixed option bag sent with every completion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionOptions {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub frequency_penalty: f64,
    #[serde(default)]
    pub presence_penalty: f64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl CompletionOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            telegram_token: String::new(),
            openai_api_key: String::new(),
            openai_api_base: None,
            database_path: default_database_path(),
            models: ModelsConfig::default(),
            chat_modes: default_chat_modes(),
            default_chat_mode: default_chat_mode(),
            dialog_idle_timeout_secs: default_idle_timeout_secs(),
            completion: CompletionOptions::default(),
        }
    }
}

impl AppConfig {
    /// The first available model is the one new users start with.
    pub fn default_model(&self) -> Option<&str> {
        self.models.available_text_models.first().map(String::as_str)
    }

    pub fn dialog_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.dialog_idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram_token.trim().is_empty() {
            return Err(Error::Config("telegram_token is not set".into()));
        }
        if self.openai_api_key.trim().is_empty() {
            return Err(Error::Config("openai_api_key is not set".into()));
        }
        if self.models.available_text_models.is_empty() {
            return Err(Error::Config(
                "models.available_text_models must list at least one model".into(),
            ));
        }
        if !self.chat_modes.contains_key(&self.default_chat_mode) {
            return Err(Error::Config(format!(
                "default_chat_mode '{}' is not defined in chat_modes",
                self.default_chat_mode
            )));
        }
        Ok(())
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("parley.db")
}

fn default_models() -> Vec<String> {
    vec!["gpt-3.5-turbo".to_string()]
}

fn default_chat_mode() -> String {
    "zara".to_string()
}

fn default_chat_modes() -> HashMap<String, ChatModeConfig> {
    let mut modes = HashMap::new();
    modes.insert(
        "zara".to_string(),
        ChatModeConfig {
            name: "Zara".to_string(),
            prompt_start: "You are Zara, a friendly and playful assistant.".to_string(),
        },
    );
    modes
}

fn default_idle_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_top_p() -> f64 {
    1.0
}

fn default_request_timeout_secs() -> u64 {
    60
}

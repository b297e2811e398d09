use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parley_common::{Error, Result};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::model::{AppConfig, ChatModeConfig, ModelsConfig};

const CONFIG_FILE: &str = "config.yml";
const CHAT_MODES_FILE: &str = "chat_modes.yml";
const MODELS_FILE: &str = "models.yml";
const ENV_FILE: &str = "config.env";

/// Environment variables that override values from the YAML files.
const ENV_TELEGRAM_TOKEN: &str = "PARLEY_TELEGRAM_TOKEN";
const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
const ENV_OPENAI_API_BASE: &str = "OPENAI_API_BASE";
const ENV_DATABASE_PATH: &str = "PARLEY_DATABASE_PATH";

/// Loads `AppConfig` from a config directory.
///
/// Layout:
/// - `config.yml` (required): main settings
/// - `chat_modes.yml` (optional): replaces `chat_modes`
/// - `models.yml` (optional): replaces `models`
/// - `config.env` (optional): `KEY=value` pairs, overridden by the process environment
pub struct ConfigLoader {
    dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn load(&self) -> Result<AppConfig> {
        let env_file = self.read_env_file()?;
        self.load_with_env(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| env_file.get(key).cloned())
        })
    }

    /// Load using `lookup` to resolve environment overrides.
    pub fn load_with_env(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<AppConfig> {
        let config_path = self.dir.join(CONFIG_FILE);
        info!("loading config from {}", config_path.display());
        let mut config: AppConfig = read_yaml(&config_path)?;

        let modes_path = self.dir.join(CHAT_MODES_FILE);
        if modes_path.exists() {
            let modes: HashMap<String, ChatModeConfig> = read_yaml(&modes_path)?;
            debug!("loaded {} chat modes from {}", modes.len(), modes_path.display());
            config.chat_modes = modes;
        }

        let models_path = self.dir.join(MODELS_FILE);
        if models_path.exists() {
            let models: ModelsConfig = read_yaml(&models_path)?;
            config.models = models;
        }

        apply_env_overrides(&mut config, lookup);
        Ok(config)
    }

    fn read_env_file(&self) -> Result<HashMap<String, String>> {
        let path = self.dir.join(ENV_FILE);
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let mut values = HashMap::new();
        let iter = dotenvy::from_path_iter(&path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        for item in iter {
            let (key, value) = item
                .map_err(|e| Error::Config(format!("invalid line in {}: {e}", path.display())))?;
            values.insert(key, value);
        }
        Ok(values)
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
}

fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(token) = lookup(ENV_TELEGRAM_TOKEN).filter(|v| !v.is_empty()) {
        config.telegram_token = token;
    }
    if let Some(key) = lookup(ENV_OPENAI_API_KEY).filter(|v| !v.is_empty()) {
        config.openai_api_key = key;
    }
    if let Some(base) = lookup(ENV_OPENAI_API_BASE).filter(|v| !v.is_empty()) {
        config.openai_api_base = Some(base);
    }
    if let Some(path) = lookup(ENV_DATABASE_PATH).filter(|v| !v.is_empty()) {
        config.database_path = PathBuf::from(path);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use padbot_common::{AccessLevel, DurationUnit, MacroDef, User};

/// Magic header on the binary bot_data cache
const DATA_CACHE_MAGIC: u32 = 0x0B07_DA7A;

/// Persistence failures
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("cache error: {0}")]
    Cache(String),
}

/// Login document; missing or malformed is fatal at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    pub bot_name: String,
    pub password: String,
    pub channel_name: String,
}

/// Bot settings document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub message_cooldown_ms: u64,
    pub main_thread_sleep_ms: u64,
    pub bot_message_char_limit: usize,
    /// `{0}` is the bot name, `{1}` the command sigil
    pub connect_message: String,
    pub auto_whitelist_enabled: bool,
    pub auto_whitelist_input_count: u64,
    /// `{0}` is the promoted user
    pub auto_whitelist_msg: String,
    pub use_chat_bot: bool,
    pub credits_time_ms: u64,
    pub credits_amount: u64,
    pub command_sigil: String,
    pub joystick_count: usize,
    pub default_duration: u32,
    pub default_duration_unit: DurationUnit,
    pub frame_ms: u32,
    pub max_input_duration_ms: u64,
    pub max_simultaneous_duration_ms: u64,
    pub input_queue_depth: usize,
    pub outbound_queue_cap: usize,
    pub hold_grace_ms: u64,
    pub max_drain_timeout_ms: u64,
    /// Input name -> minimum access level required to use it
    pub blacklist: HashMap<String, AccessLevel>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut blacklist = HashMap::new();
        blacklist.insert("start".to_string(), AccessLevel::Moderator);
        blacklist.insert("select".to_string(), AccessLevel::Moderator);

        Self {
            message_cooldown_ms: 1_000,
            main_thread_sleep_ms: 50,
            bot_message_char_limit: 500,
            connect_message: "{0} online! Type inputs in chat, {1}help for commands".to_string(),
            auto_whitelist_enabled: true,
            auto_whitelist_input_count: 50,
            auto_whitelist_msg: "{0} has proven themselves and is now whitelisted!".to_string(),
            use_chat_bot: false,
            credits_time_ms: 600_000,
            credits_amount: 10,
            command_sigil: "!".to_string(),
            joystick_count: 2,
            default_duration: 200,
            default_duration_unit: DurationUnit::Millis,
            frame_ms: 17,
            max_input_duration_ms: 5_000,
            max_simultaneous_duration_ms: 15_000,
            input_queue_depth: 8,
            outbound_queue_cap: 64,
            hold_grace_ms: 500,
            max_drain_timeout_ms: 3_000,
            blacklist,
        }
    }
}

/// Persisted bot data: users, memes, macros and pool bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotData {
    pub users: HashMap<String, User>,
    pub memes: HashMap<String, String>,
    pub macros: Vec<MacroDef>,
    pub last_controller_type: String,
    pub joystick_count: usize,
}

/// Configuration manager for the padbot daemon
///
/// Documents are YAML; bot_data additionally keeps a bincode cache behind a
/// magic header which is preferred on load. Every save goes through one
/// mutex so concurrent mutations cannot truncate files mid-write.
pub struct ConfigManager {
    pub login_path: PathBuf,
    pub settings_path: PathBuf,
    pub data_path: PathBuf,
    pub cache_path: PathBuf,
    save_lock: Mutex<()>,
}

impl ConfigManager {
    pub fn new(dir: &Path) -> Self {
        Self {
            login_path: dir.join("login.yaml"),
            settings_path: dir.join("settings.yaml"),
            data_path: dir.join("bot_data.yaml"),
            cache_path: dir.join("bot_data.bin"),
            save_lock: Mutex::new(()),
        }
    }

    pub async fn ensure_dirs(&self) -> Result<(), PersistenceError> {
        if let Some(parent) = self.login_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load the login document; there is no sensible default to fall back to
    pub async fn load_login(&self) -> Result<LoginConfig, PersistenceError> {
        info!("Loading login from {}", self.login_path.display());
        let content = fs::read_to_string(&self.login_path).await?;
        let login: LoginConfig = serde_yaml::from_str(&content)?;
        Ok(login)
    }

    /// Load settings, writing defaults back when the file is missing
    pub async fn load_settings(&self) -> Result<Settings, PersistenceError> {
        if self.settings_path.exists() {
            let content = fs::read_to_string(&self.settings_path).await?;
            let settings = serde_yaml::from_str(&content)?;
            debug!("Loaded settings from disk");
            Ok(settings)
        } else {
            warn!("Settings file not found, using defaults");
            let settings = Settings::default();
            self.save_settings(&settings).await?;
            Ok(settings)
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), PersistenceError> {
        let _guard = self.save_lock.lock().await;
        let content = serde_yaml::to_string(settings)?;
        fs::write(&self.settings_path, content).await?;
        debug!("Settings saved");
        Ok(())
    }

    /// Load bot data, preferring the binary cache over YAML
    pub async fn load_data(&self) -> Result<BotData, PersistenceError> {
        if self.cache_path.exists() {
            match self.load_data_from_cache().await {
                Ok(data) => {
                    debug!("Loaded bot data from cache");
                    return Ok(data);
                }
                Err(e) => {
                    warn!("Failed to load bot data cache: {}", e);
                }
            }
        }

        if self.data_path.exists() {
            let content = fs::read_to_string(&self.data_path).await?;
            let data = serde_yaml::from_str(&content)?;
            debug!("Loaded bot data from YAML");
            Ok(data)
        } else {
            info!("No bot data found, starting fresh");
            let data = BotData::default();
            self.save_data(&data).await?;
            Ok(data)
        }
    }

    async fn load_data_from_cache(&self) -> Result<BotData, PersistenceError> {
        let content = fs::read(&self.cache_path).await?;
        if content.len() < 4 {
            return Err(PersistenceError::Cache("cache file too short".into()));
        }
        let magic = u32::from_le_bytes([content[0], content[1], content[2], content[3]]);
        if magic != DATA_CACHE_MAGIC {
            return Err(PersistenceError::Cache("bad cache magic number".into()));
        }
        padbot_common::deserialize(&content[4..])
            .map_err(|e| PersistenceError::Cache(e.to_string()))
    }

    /// Save bot data to both the cache and YAML
    pub async fn save_data(&self, data: &BotData) -> Result<(), PersistenceError> {
        let _guard = self.save_lock.lock().await;

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&DATA_CACHE_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&padbot_common::serialize(data));
        fs::write(&self.cache_path, bytes).await?;

        let content = serde_yaml::to_string(data)?;
        fs::write(&self.data_path, content).await?;

        debug!("Saved bot data to cache and YAML");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_settings_roundtrip_with_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path());

        // Missing file writes defaults back
        let settings = manager.load_settings().await.unwrap();
        assert!(manager.settings_path.exists());
        assert_eq!(settings.message_cooldown_ms, 1_000);

        let loaded = manager.load_settings().await.unwrap();
        assert_eq!(loaded.joystick_count, settings.joystick_count);
        assert_eq!(loaded.blacklist.get("start"), Some(&AccessLevel::Moderator));
    }

    #[tokio::test]
    async fn test_missing_login_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path());
        assert!(manager.load_login().await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_login_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path());
        fs::write(&manager.login_path, "not: [valid")
            .await
            .unwrap();
        assert!(manager.load_login().await.is_err());
    }

    #[tokio::test]
    async fn test_bot_data_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path());

        let mut data = BotData::default();
        data.users.insert("viewer".into(), User::new("viewer"));
        data.memes.insert("gg".into(), "gg wp".into());
        data.macros.push(MacroDef {
            key: "#combo".into(),
            body: "a+b".into(),
            params: 0,
        });
        data.last_controller_type = "uinput".into();
        data.joystick_count = 2;

        manager.save_data(&data).await.unwrap();

        let loaded = manager.load_data().await.unwrap();
        assert!(loaded.users.contains_key("viewer"));
        assert_eq!(loaded.memes.get("gg").unwrap(), "gg wp");
        assert_eq!(loaded.macros[0].key, "#combo");
    }

    #[tokio::test]
    async fn test_corrupt_cache_falls_back_to_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path());

        let mut data = BotData::default();
        data.memes.insert("hi".into(), "hello".into());
        manager.save_data(&data).await.unwrap();

        // Clobber the cache; YAML still has the data
        fs::write(&manager.cache_path, b"garbage").await.unwrap();
        let loaded = manager.load_data().await.unwrap();
        assert_eq!(loaded.memes.get("hi").unwrap(), "hello");
    }
}

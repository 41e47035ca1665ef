use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{errors::Error, messaging::throttled::ThrottleConfig, Result};

/// Process-level settings, read from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    pub bot_token: String,
    pub config_path: PathBuf,
    pub temp_dir: PathBuf,
    pub dead_letter_path: Option<PathBuf>,
    pub throttle: ThrottleConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let bot_token = env_str("TGMIRROR_BOT_TOKEN").unwrap_or_default();
        let config_path = env_path("TGMIRROR_CONFIG").unwrap_or_else(|| "tgmirror.json".into());
        let temp_dir = env_path("TGMIRROR_TEMP_DIR").unwrap_or_else(|| "/tmp/tgmirror".into());
        let dead_letter_path = env_path("TGMIRROR_DEAD_LETTER_PATH");

        let defaults = ThrottleConfig::default();
        let throttle = ThrottleConfig {
            global_min_interval: env_u64("TGMIRROR_THROTTLE_GLOBAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.global_min_interval),
            per_chat_min_interval: env_u64("TGMIRROR_THROTTLE_PER_CHAT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.per_chat_min_interval),
        };

        fs::create_dir_all(&temp_dir)?;

        Ok(Self {
            bot_token,
            config_path,
            temp_dir,
            dead_letter_path,
            throttle,
        })
    }

    /// Pre-flight check run before any processing starts.
    pub fn validate(&self, forward: &ForwardConfig) -> Result<()> {
        if self.bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TGMIRROR_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        if !forward.connections.iter().any(|c| c.enabled) {
            return Err(Error::Config(
                "at least one enabled connection is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Forwarding rules and tuning, persisted as JSON.
///
/// The core only ever writes back `Connection::offset`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub connections: Vec<Connection>,
    pub past: PastSettings,
    pub live: LiveSettings,
    pub delivery: DeliverySettings,
    pub comments: CommentSettings,
    /// Stage name -> stage configuration. Unknown names are reported and ignored.
    pub plugins: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub name: String,
    pub source: String,
    pub dest: Vec<String>,
    /// Last successfully processed source message id.
    #[serde(default)]
    pub offset: i32,
    #[serde(default)]
    pub end: Option<i32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub comments: CommentPolicy,
}

impl Connection {
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.source
        } else {
            &self.name
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentPolicy {
    pub enabled: bool,
    /// Source discussion group; resolved from the channel's linked group when unset.
    pub source_group: Option<String>,
    pub dest_mode: CommentDestMode,
    pub filters: CommentFilters,
}

/// Where mirrored comments are attached on the destination side.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "group")]
pub enum CommentDestMode {
    /// Reply under the destination post's own discussion-thread message.
    #[default]
    Discussion,
    /// Reply under the thread message found in a manually configured group.
    Group(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentFilters {
    pub skip_bots: bool,
    pub media_only: bool,
    pub text_only: bool,
    /// Case-insensitive substrings; matching comments are dropped.
    pub blacklist: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PastSettings {
    pub delay_min_secs: u64,
    pub delay_max_secs: u64,
    pub page_size: usize,
}

impl Default for PastSettings {
    fn default() -> Self {
        Self {
            delay_min_secs: 60,
            delay_max_secs: 300,
            page_size: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    pub sequential_updates: bool,
    pub delete_sync: bool,
    pub group_timeout_ms: u64,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            sequential_updates: false,
            delete_sync: false,
            group_timeout_ms: 1500,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub flood_margin_secs: u64,
    /// Upper bound on consecutive rate-limit waits for one unit.
    pub max_rate_limit_waits: u32,
    pub preserve_attribution: bool,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_secs: 5,
            backoff_cap_secs: 300,
            flood_margin_secs: 5,
            max_rate_limit_waits: 50,
            preserve_attribution: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentSettings {
    pub parent_wait_secs: u64,
    pub discovery_passes: u32,
    pub discovery_delay_secs: u64,
    pub scan_limit: usize,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for CommentSettings {
    fn default() -> Self {
        Self {
            parent_wait_secs: 120,
            discovery_passes: 3,
            discovery_delay_secs: 10,
            scan_limit: 200,
            jitter_min_ms: 1000,
            jitter_max_ms: 3000,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Persistence for `ForwardConfig`. Durability and transport are up to the implementation.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<ForwardConfig>;
    fn save(&self, config: &ForwardConfig) -> Result<()>;
}

/// JSON file store; writes go to a sibling temp file that is then renamed into place.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<ForwardConfig> {
        if !self.path.exists() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                self.path.display()
            )));
        }
        let txt = fs::read_to_string(&self.path)?;
        if txt.trim().is_empty() {
            return Ok(ForwardConfig::default());
        }
        Ok(serde_json::from_str(&txt)?)
    }

    fn save(&self, config: &ForwardConfig) -> Result<()> {
        let txt = serde_json::to_string_pretty(config)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, txt)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

//! Configuration management for Reelcast

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::types::Platform;

pub const DEFAULT_GRAPH_API_BASE: &str = "https://graph.facebook.com/v18.0";
pub const DEFAULT_TIKTOK_API_BASE: &str = "https://open.tiktokapis.com/v2";
pub const DEFAULT_TOKEN_KEY_ENV: &str = "REELCAST_TOKEN_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub instagram: GraphApiConfig,
    #[serde(default)]
    pub facebook: GraphApiConfig,
    #[serde(default)]
    pub tiktok: TikTokConfig,
    #[serde(default)]
    pub captions: CaptionsConfig,
}

/// Per-platform caption length overrides, e.g. `instagram = 2000`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptionsConfig {
    #[serde(default)]
    pub instagram: Option<usize>,
    #[serde(default)]
    pub facebook: Option<usize>,
    #[serde(default)]
    pub tiktok: Option<usize>,
    #[serde(default)]
    pub linkedin: Option<usize>,
    #[serde(default)]
    pub youtube: Option<usize>,
}

impl CaptionsConfig {
    pub fn limit_for(&self, platform: Platform) -> Option<usize> {
        match platform {
            Platform::Instagram => self.instagram,
            Platform::Facebook => self.facebook,
            Platform::Tiktok => self.tiktok,
            Platform::Linkedin => self.linkedin,
            Platform::Youtube => self.youtube,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    #[default]
    Development,
    Test,
}

impl std::str::FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            other => Err(ConfigError::InvalidValue {
                field: "scheduler.environment".to_string(),
                reason: format!("unknown environment '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Sub-posts processed per trigger invocation
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Sub-posts attempted at the same time within one run
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Seconds between polls when running as a daemon
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Secret sent by the platform cron provider in its header
    #[serde(default)]
    pub cron_secret: Option<String>,
    /// Secret expected as `Authorization: Bearer <secret>` from external crons
    #[serde(default)]
    pub scheduler_secret: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            cron_secret: None,
            scheduler_secret: None,
        }
    }
}

fn default_batch_size() -> u32 {
    10
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Name of the environment variable holding the base64 token key
    #[serde(default = "default_token_key_env")]
    pub token_key_env: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token_key_env: default_token_key_env(),
        }
    }
}

fn default_token_key_env() -> String {
    DEFAULT_TOKEN_KEY_ENV.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphApiConfig {
    #[serde(default = "default_graph_api_base")]
    pub graph_api_base: String,
}

impl Default for GraphApiConfig {
    fn default() -> Self {
        Self {
            graph_api_base: default_graph_api_base(),
        }
    }
}

fn default_graph_api_base() -> String {
    DEFAULT_GRAPH_API_BASE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TikTokConfig {
    #[serde(default = "default_tiktok_api_base")]
    pub api_base: String,
    /// Send uploads to the creator's inbox (drafts) instead of publishing directly
    #[serde(default)]
    pub post_to_inbox: bool,
    /// App client key; together with the secret it enables token refresh
    #[serde(default)]
    pub client_key: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl Default for TikTokConfig {
    fn default() -> Self {
        Self {
            api_base: default_tiktok_api_base(),
            post_to_inbox: false,
            client_key: None,
            client_secret: None,
        }
    }
}

fn default_tiktok_api_base() -> String {
    DEFAULT_TIKTOK_API_BASE.to_string()
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML and apply environment overrides
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/reelcast/reelcast.db".to_string(),
            },
            scheduler: SchedulerConfig::default(),
            security: SecurityConfig::default(),
            http: HttpConfig::default(),
            instagram: GraphApiConfig::default(),
            facebook: GraphApiConfig::default(),
            tiktok: TikTokConfig::default(),
            captions: CaptionsConfig::default(),
        }
    }

    /// Secrets and the environment may come from env vars so they stay out of
    /// the config file.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(env) = std::env::var("REELCAST_ENV") {
            self.scheduler.environment = env.parse()?;
        }
        if let Ok(secret) = std::env::var("REELCAST_CRON_SECRET") {
            self.scheduler.cron_secret = Some(secret);
        }
        if let Ok(secret) = std::env::var("REELCAST_SCHEDULER_SECRET") {
            self.scheduler.scheduler_secret = Some(secret);
        }
        if let Ok(path) = std::env::var("REELCAST_DB_PATH") {
            self.database.path = path;
        }
        if let Ok(key) = std::env::var("REELCAST_TIKTOK_CLIENT_KEY") {
            self.tiktok.client_key = Some(key);
        }
        if let Ok(secret) = std::env::var("REELCAST_TIKTOK_CLIENT_SECRET") {
            self.tiktok.client_secret = Some(secret);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.batch_size".to_string(),
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        if self.scheduler.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.concurrency".to_string(),
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        if let Some(platform) = Platform::ALL
            .into_iter()
            .find(|p| self.captions.limit_for(*p) == Some(0))
        {
            return Err(ConfigError::InvalidValue {
                field: format!("captions.{}", platform),
                reason: "caption limit must be greater than zero".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Database path with `~` expanded
    pub fn database_path(&self) -> String {
        shellexpand::tilde(&self.database.path).to_string()
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("REELCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("reelcast").join("config.toml"))
}

//! Configuration loading and management
//!
//! Handles parsing of `config.toml` in the store directory.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::identity::SELF_TOKEN;

const CONFIG_FILENAME: &str = "config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sync server addressing
    #[serde(default)]
    pub server: ServerConfig,

    /// Identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Partition layout
    #[serde(default)]
    pub partitions: PartitionsConfig,

    /// Permission bootstrap behavior
    #[serde(default)]
    pub permissions: PermissionsConfig,

    /// Presence heartbeat
    #[serde(default)]
    pub presence: PresenceConfig,
}

/// Sync server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// URL scheme used for partition URLs
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Sync host
    #[serde(default = "default_host")]
    pub host: String,

    /// Sync port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

fn default_scheme() -> String {
    "realm".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9080
}

fn default_app_name() -> String {
    "SharedTasks".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: default_host(),
            port: default_port(),
            app_name: default_app_name(),
        }
    }
}

/// Identity-related configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Identity used when none is given or persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Partition layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionsConfig {
    /// Path template of a user's private task partition
    #[serde(default = "default_tasks_template")]
    pub tasks_template: String,

    /// Token in the template replaced by the owner's identity
    #[serde(default = "default_self_token")]
    pub self_token: String,

    /// Path of the shared people directory
    #[serde(default = "default_directory")]
    pub directory: String,
}

fn default_tasks_template() -> String {
    "/~/MyTasks".to_string()
}

fn default_self_token() -> String {
    SELF_TOKEN.to_string()
}

fn default_directory() -> String {
    "/SharedTasks-CommonRealm".to_string()
}

impl Default for PartitionsConfig {
    fn default() -> Self {
        Self {
            tasks_template: default_tasks_template(),
            self_token: default_self_token(),
            directory: default_directory(),
        }
    }
}

/// Permission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Admins grant everyone write access to the people directory on start
    #[serde(default = "default_true")]
    pub bootstrap_directory: bool,

    /// Identities treated as server administrators
    #[serde(default)]
    pub admins: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            bootstrap_directory: true,
            admins: Vec::new(),
        }
    }
}

/// Presence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Minimum time between presence writes
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    /// A person is online if seen within this window
    #[serde(default = "default_online_window")]
    pub online_window: String,
}

fn default_heartbeat_interval() -> String {
    "5m".to_string()
}

fn default_online_window() -> String {
    "15m".to_string()
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            online_window: default_online_window(),
        }
    }
}

impl PresenceConfig {
    pub fn heartbeat(&self) -> Result<Duration> {
        parse_duration(&self.heartbeat_interval)
    }

    pub fn window(&self) -> Result<Duration> {
        parse_duration(&self.online_window)
    }
}

impl PartitionsConfig {
    fn validate(&self) -> Result<()> {
        let token = self.self_token.trim();
        if token.is_empty() {
            return Err(Error::InvalidConfig(
                "partitions.self_token cannot be empty".to_string(),
            ));
        }
        if !self.tasks_template.starts_with('/') {
            return Err(Error::InvalidConfig(
                "partitions.tasks_template must start with '/'".to_string(),
            ));
        }
        let occurrences = self
            .tasks_template
            .split('/')
            .filter(|segment| *segment == token)
            .count();
        if occurrences != 1 {
            return Err(Error::InvalidConfig(format!(
                "partitions.tasks_template must contain '{token}' exactly once as a path segment"
            )));
        }
        if !self.directory.starts_with('/') {
            return Err(Error::InvalidConfig(
                "partitions.directory must start with '/'".to_string(),
            ));
        }
        if self.directory.split('/').any(|segment| segment == token) {
            return Err(Error::InvalidConfig(
                "partitions.directory cannot be a per-user path".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a store directory, or return defaults
    pub fn load_from_dir(store_root: &Path) -> Self {
        let config_path = Self::path_in(store_root);
        if config_path.exists() {
            match Self::load(&config_path) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "ignoring invalid config");
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }

    /// Location of the config file inside a store directory
    pub fn path_in(store_root: &Path) -> PathBuf {
        store_root.join(CONFIG_FILENAME)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Whether `identity` is listed as a server administrator
    pub fn is_admin(&self, identity: &str) -> bool {
        self.permissions
            .admins
            .iter()
            .any(|admin| admin.trim() == identity)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(Error::InvalidConfig("server.host cannot be empty".to_string()));
        }
        if self.server.port == 0 {
            return Err(Error::InvalidConfig("server.port must be > 0".to_string()));
        }
        self.partitions.validate()?;
        let heartbeat = self.presence.heartbeat()?;
        let window = self.presence.window()?;
        if heartbeat > window {
            return Err(Error::InvalidConfig(
                "presence.heartbeat_interval cannot exceed presence.online_window".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a duration string like "30s", "5m", "2h", "1d"
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();

    if s.is_empty() {
        return Err(Error::InvalidArgument("Duration cannot be empty".to_string()));
    }

    let (num_str, unit) = if let Some(pos) = s.find(|c: char| !c.is_ascii_digit()) {
        (&s[..pos], &s[pos..])
    } else {
        // Assume minutes if no unit
        (s, "m")
    };

    let num: i64 = num_str
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("Invalid duration number: {}", num_str)))?;

    let duration = match unit.to_lowercase().as_str() {
        "s" | "sec" | "second" | "seconds" => Duration::try_seconds(num),
        "m" | "min" | "minute" | "minutes" => Duration::try_minutes(num),
        "h" | "hr" | "hour" | "hours" => Duration::try_hours(num),
        "d" | "day" | "days" => Duration::try_days(num),
        _ => {
            return Err(Error::InvalidArgument(format!(
                "Invalid duration unit '{}'. Expected: s, m, h, d",
                unit
            )));
        }
    };

    duration.ok_or_else(|| Error::InvalidArgument(format!("Duration out of range: {}", s)))
}

//! TOML Configuration File Support
//!
//! Client configuration loaded from `~/.config/marki/client.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`MARKI_API_URL`, `MARKI_PERSONALITY`,
//!    `MARKI_HISTORY_LIMIT`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [api]
//! base_url = "https://chat.example.com"
//! stream_path = "/api/chat/stream"
//! request_timeout_secs = 30
//!
//! [chat]
//! history_limit = 40
//! message_page_size = 8
//! conversation_page_size = 20
//! default_personality = "markiai"
//!
//! [guest]
//! persist_history = true
//! history_path = "/home/me/.local/share/marki/guest_history.json"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::DEFAULT_REQUEST_TIMEOUT;
use crate::exchange::DEFAULT_HISTORY_LIMIT;
use crate::personality::DEFAULT_PERSONALITY_SLUG;
use crate::transport::DEFAULT_STREAM_PATH;

/// Default backend URL
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Messages fetched per history page
pub const DEFAULT_MESSAGE_PAGE_SIZE: usize = 8;

/// Conversations fetched per index page
pub const DEFAULT_CONVERSATION_PAGE_SIZE: usize = 20;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// API section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiToml {
    /// Backend base URL
    pub base_url: Option<String>,

    /// Path of the streaming endpoint
    pub stream_path: Option<String>,

    /// Timeout for REST requests in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Chat section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatToml {
    /// Messages of guest history sent per exchange
    pub history_limit: Option<usize>,

    /// Messages per history page
    pub message_page_size: Option<usize>,

    /// Conversations per index page
    pub conversation_page_size: Option<usize>,

    /// Personality for new conversations
    pub default_personality: Option<String>,
}

/// Guest section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestToml {
    /// Keep guest conversations across restarts
    pub persist_history: Option<bool>,

    /// Where to keep them
    pub history_path: Option<PathBuf>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// API section
    pub api: ApiToml,

    /// Chat section
    pub chat: ChatToml,

    /// Guest section
    pub guest: GuestToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved client configuration
///
/// Use [`load_config`] to load it with proper priority handling.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Backend base URL
    pub base_url: String,

    /// Path of the streaming endpoint
    pub stream_path: String,

    /// Timeout for REST requests
    pub request_timeout: Duration,

    /// Messages of guest history sent per exchange
    pub history_limit: usize,

    /// Messages per history page
    pub message_page_size: usize,

    /// Conversations per index page
    pub conversation_page_size: usize,

    /// Personality for new conversations
    pub default_personality: String,

    /// Keep guest conversations across restarts
    pub persist_guest_history: bool,

    /// Where to keep them (`None` = data directory default)
    pub guest_history_path: Option<PathBuf>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of each value that did not come from the defaults
    sources: HashMap<&'static str, ConfigSource>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
            message_page_size: DEFAULT_MESSAGE_PAGE_SIZE,
            conversation_page_size: DEFAULT_CONVERSATION_PAGE_SIZE,
            default_personality: DEFAULT_PERSONALITY_SLUG.to_string(),
            persist_guest_history: false,
            guest_history_path: None,
            config_file_path: None,
            sources: HashMap::new(),
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the value of `key` (e.g. `"base_url"`) came from
    #[must_use]
    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.sources
            .get(key)
            .copied()
            .unwrap_or(ConfigSource::Default)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an empty URL or a zero
    /// page size or history limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "base_url must not be empty".to_string(),
            ));
        }
        if !self.stream_path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "stream_path must start with '/': {}",
                self.stream_path
            )));
        }
        for (name, value) in [
            ("history_limit", self.history_limit),
            ("message_page_size", self.message_page_size),
            ("conversation_page_size", self.conversation_page_size),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.default_personality.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "default_personality must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn record(&mut self, key: &'static str, source: ConfigSource) {
        self.sources.insert(key, source);
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/marki/client.toml` or
/// `~/.config/marki/client.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("marki").join("client.toml"))
}

/// Load configuration from the default path, the environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting values are invalid. A missing config file is not an error.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the resulting values are invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ClientToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ClientConfig, toml: ClientToml) {
    if let Some(url) = toml.api.base_url {
        config.base_url = url;
        config.record("base_url", ConfigSource::File);
    }
    if let Some(path) = toml.api.stream_path {
        config.stream_path = path;
        config.record("stream_path", ConfigSource::File);
    }
    if let Some(secs) = toml.api.request_timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
        config.record("request_timeout", ConfigSource::File);
    }

    if let Some(limit) = toml.chat.history_limit {
        config.history_limit = limit;
        config.record("history_limit", ConfigSource::File);
    }
    if let Some(size) = toml.chat.message_page_size {
        config.message_page_size = size;
        config.record("message_page_size", ConfigSource::File);
    }
    if let Some(size) = toml.chat.conversation_page_size {
        config.conversation_page_size = size;
        config.record("conversation_page_size", ConfigSource::File);
    }
    if let Some(slug) = toml.chat.default_personality {
        config.default_personality = slug;
        config.record("default_personality", ConfigSource::File);
    }

    if let Some(persist) = toml.guest.persist_history {
        config.persist_guest_history = persist;
        config.record("persist_guest_history", ConfigSource::File);
    }
    if toml.guest.history_path.is_some() {
        config.guest_history_path = toml.guest.history_path;
        config.record("guest_history_path", ConfigSource::File);
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut ClientConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(url) = var("MARKI_API_URL") {
        config.base_url = url;
        config.record("base_url", ConfigSource::Env);
    }
    if let Some(slug) = var("MARKI_PERSONALITY") {
        config.default_personality = slug;
        config.record("default_personality", ConfigSource::Env);
    }
    if let Some(limit) = var("MARKI_HISTORY_LIMIT") {
        match limit.parse::<usize>() {
            Ok(n) => {
                config.history_limit = n;
                config.record("history_limit", ConfigSource::Env);
            }
            Err(_) => tracing::warn!(value = %limit, "Ignoring invalid MARKI_HISTORY_LIMIT"),
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,

    /// Default personality override
    pub default_personality: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set default personality override
    #[must_use]
    pub fn with_default_personality(mut self, slug: String) -> Self {
        self.default_personality = Some(slug);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(ref url) = self.base_url {
            config.base_url = url.clone();
            config.record("base_url", ConfigSource::Cli);
        }
        if let Some(ref slug) = self.default_personality {
            config.default_personality = slug.clone();
            config.record("default_personality", ConfigSource::Cli);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

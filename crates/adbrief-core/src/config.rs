//! Configuration management for adbrief.
//!
//! Loads configuration from ${ADBRIEF_HOME}/config.toml with sensible defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Default upstream for the auth proxy.
pub const DEFAULT_UPSTREAM_URL: &str = "https://api.anthropic.com";

const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const UPSTREAM_URL_ENV: &str = "ADBRIEF_UPSTREAM_URL";

/// Returns the default config template.
///
/// This is embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for adbrief configuration and data files.
    //!
    //! ADBRIEF_HOME resolution order:
    //! 1. ADBRIEF_HOME environment variable (if set)
    //! 2. ~/.config/adbrief (default)

    use std::path::PathBuf;

    /// Returns the adbrief home directory.
    pub fn adbrief_home() -> PathBuf {
        if let Ok(home) = std::env::var("ADBRIEF_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .map_or_else(|| PathBuf::from(".adbrief"), |h| h.join(".config").join("adbrief"))
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        adbrief_home().join("config.toml")
    }

    /// Returns the directory log files are written to.
    pub fn logs_dir() -> PathBuf {
        adbrief_home().join("logs")
    }

    /// Returns the default document store path.
    pub fn documents_path() -> PathBuf {
        adbrief_home().join("documents.json")
    }
}

/// Which agent implementation drives a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Streaming Messages API over HTTP
    #[default]
    Messages,
    /// Long-lived `claude` subprocess in stream-json mode
    ClaudeCli,
}

/// Agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub backend: BackendKind,
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    /// Executable for the `claude-cli` backend
    pub cli_path: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            model: AgentConfig::DEFAULT_MODEL.to_string(),
            max_tokens: AgentConfig::DEFAULT_MAX_TOKENS,
            system_prompt: None,
            cli_path: None,
        }
    }
}

impl AgentConfig {
    const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
    const DEFAULT_MAX_TOKENS: u32 = 8192;

    pub fn effective_system_prompt(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn effective_cli_path(&self) -> PathBuf {
        self.cli_path
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map_or_else(|| PathBuf::from("claude"), PathBuf::from)
    }
}

/// Auth proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Optional upstream override (for gateways).
    pub upstream_url: Option<String>,
    /// Optional API key (overrides environment variable).
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub auth_scheme: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            upstream_url: None,
            api_key: None,
            api_key_header: adbrief_providers::proxy::DEFAULT_KEY_HEADER.to_string(),
            auth_scheme: adbrief_providers::proxy::DEFAULT_AUTH_SCHEME.to_string(),
        }
    }
}

impl ProxySettings {
    /// Returns the effective API key if set and non-empty.
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Returns the effective upstream URL if set and non-empty.
    pub fn effective_upstream_url(&self) -> Option<&str> {
        self.upstream_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds to wait for a terminal event after an interrupt (0 = default)
    pub stall_timeout_secs: u64,
    pub event_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: SessionConfig::DEFAULT_STALL_TIMEOUT_SECS,
            event_channel_capacity: SessionConfig::DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl SessionConfig {
    const DEFAULT_STALL_TIMEOUT_SECS: u64 = 60;
    const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

    pub fn stall_timeout(&self) -> Duration {
        if self.stall_timeout_secs == 0 {
            Duration::from_secs(Self::DEFAULT_STALL_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.stall_timeout_secs)
        }
    }

    pub fn channel_capacity(&self) -> usize {
        self.event_channel_capacity.max(1)
    }
}

/// Document store settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DocumentsConfig {
    pub path: Option<String>,
}

/// A skill declared in config rather than built in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomSkillConfig {
    /// Fence language tag, e.g. `media-plan`
    pub name: String,
    #[serde(default)]
    pub required_keys: Vec<String>,
    /// Default target document section
    pub section: String,
    /// Fields written to another section, `field = "section"`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_sections: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SkillsConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom: Vec<CustomSkillConfig>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub proxy: ProxySettings,
    pub session: SessionConfig,
    pub documents: DocumentsConfig,
    pub skills: SkillsConfig,
}

impl Config {
    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    ///
    /// # Errors
    /// Returns an error if the file exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        write_config(path, default_config_template())
    }

    /// Resolves the API key: config value first, then `ANTHROPIC_API_KEY`.
    ///
    /// # Errors
    /// Returns a remediation message if neither is set.
    pub fn api_key(&self) -> Result<String> {
        resolve_api_key(
            self.proxy.effective_api_key(),
            std::env::var(API_KEY_ENV).ok().as_deref(),
        )
    }

    /// Resolves the proxy upstream: `ADBRIEF_UPSTREAM_URL`, then config,
    /// then the default.
    ///
    /// # Errors
    /// Returns an error if the chosen URL is malformed.
    pub fn upstream_url(&self) -> Result<Url> {
        resolve_upstream_url(
            std::env::var(UPSTREAM_URL_ENV).ok().as_deref(),
            self.proxy.effective_upstream_url(),
        )
    }

    pub fn documents_path(&self) -> PathBuf {
        self.documents
            .path
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map_or_else(paths::documents_path, PathBuf::from)
    }
}

/// Resolves an API key with precedence: config > env.
///
/// # Errors
/// Returns an error with remediation text if no key is available.
pub fn resolve_api_key(config_key: Option<&str>, env_key: Option<&str>) -> Result<String> {
    [config_key, env_key]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|k| !k.is_empty())
        .map(str::to_string)
        .with_context(|| {
            format!(
                "No API key configured. Set {API_KEY_ENV} or api_key in [proxy] in the settings file ({}).",
                paths::config_path().display()
            )
        })
}

/// Resolves the upstream URL with precedence: env > config > default.
///
/// # Errors
/// Returns an error if the chosen URL is malformed.
pub fn resolve_upstream_url(env_url: Option<&str>, config_url: Option<&str>) -> Result<Url> {
    let chosen = [env_url, config_url]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|u| !u.is_empty())
        .unwrap_or(DEFAULT_UPSTREAM_URL);
    Url::parse(chosen).with_context(|| format!("Invalid upstream URL: {chosen}"))
}

fn write_config(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, content)
        .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })
}

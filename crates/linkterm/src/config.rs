//! Configuration management for LinkTerm.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/linkterm/config.toml`.
//! Command-line flags are layered on top of the loaded file by the binary;
//! one [`Config`] value is built per invocation and passed down by reference.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::proxy::Proxy;
use crate::session::shell_exists;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("grace_period_ms must be between 1 and 60000, got {0}")]
    InvalidGracePeriod(u64),

    #[error("read_buffer_size must be between 1 and 1048576, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("handshake_timeout_secs must be between 1 and 300, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("invalid proxy URL {url}: {reason}")]
    InvalidProxy { url: String, reason: String },

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for the forced-termination grace period.
const MAX_GRACE_PERIOD_MS: u64 = 60_000;

/// Upper bound for the PTY read buffer.
const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Upper bound for the client handshake timeout.
const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 300;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Server role settings.
    pub server: ServerConfig,

    /// Client role settings.
    pub client: ClientConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Server role configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Shell to spawn for each session. Detected when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// How long a shell gets to exit after SIGTERM before it is killed.
    pub grace_period_ms: u64,

    /// Size of one PTY read.
    pub read_buffer_size: usize,
}

/// Client role configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address. Bare hosts and http(s) URLs are accepted.
    pub url: String,

    /// Optional `socks5://` or `http://` proxy to dial through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Bound on connecting plus the WebSocket handshake.
    pub handshake_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Write logs to this file instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: protocol::DEFAULT_PORT,
            shell: None,
            shell_args: Vec::new(),
            grace_period_ms: 1000,
            read_buffer_size: 1024,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://localhost:{}", protocol::DEFAULT_PORT),
            proxy: None,
            handshake_timeout_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl ServerConfig {
    /// `host:port` string to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Grace period before a forced kill.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl ClientConfig {
    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("linkterm")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - LINKTERM_SHELL: Override the server shell
    /// - LINKTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Runs before logging is set up, so the applied overrides are returned
    /// as `(variable, value)` pairs for the caller to log.
    pub fn apply_env_overrides(&mut self) -> Vec<(&'static str, String)> {
        let mut applied = Vec::new();

        if let Ok(shell) = std::env::var("LINKTERM_SHELL") {
            if !shell.is_empty() {
                self.server.shell = Some(shell.clone());
                applied.push(("LINKTERM_SHELL", shell));
            }
        }

        if let Ok(level) = std::env::var("LINKTERM_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level.clone();
                applied.push(("LINKTERM_LOG_LEVEL", level));
            }
        }

        applied
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort(self.server.port));
        }

        let grace = self.server.grace_period_ms;
        if grace == 0 || grace > MAX_GRACE_PERIOD_MS {
            return Err(ConfigError::InvalidGracePeriod(grace));
        }

        let buffer = self.server.read_buffer_size;
        if buffer == 0 || buffer > MAX_READ_BUFFER_SIZE {
            return Err(ConfigError::InvalidReadBufferSize(buffer));
        }

        let timeout = self.client.handshake_timeout_secs;
        if timeout == 0 || timeout > MAX_HANDSHAKE_TIMEOUT_SECS {
            return Err(ConfigError::InvalidHandshakeTimeout(timeout));
        }

        if let Some(shell) = &self.server.shell {
            if !shell_exists(shell) {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        if let Some(proxy) = &self.client.proxy {
            Proxy::parse(proxy).map_err(|e| ConfigError::InvalidProxy {
                url: proxy.clone(),
                reason: e.to_string(),
            })?;
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

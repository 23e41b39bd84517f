mod paths;

pub use paths::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level server configuration (termhub.toml)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory for persisted per-user tab state (default: ~/.termhub/tabs)
    pub data_dir: Option<String>,
    /// Origin allowed to make credentialed cross-site requests, e.g. a
    /// frontend dev server. Unset disables CORS entirely.
    pub allowed_origin: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            allowed_origin: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Base URL of the auth service. Credentials on incoming connections are
    /// verified by forwarding the cookie to `<base_url>/me`.
    #[serde(default = "default_auth_url")]
    pub base_url: String,
    /// Timeout for auth service calls (ms)
    #[serde(default = "default_auth_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_auth_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_auth_timeout_ms() -> u64 {
    5000
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: default_auth_url(),
            timeout_ms: default_auth_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminalConfig {
    /// Shell command spawned for each tab
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Geometry used until the client sends its first resize
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Replay buffer kept per tab for delivery after reconnect (bytes)
    #[serde(default = "default_replay_buffer_bytes")]
    pub replay_buffer_bytes: usize,
    /// Capacity of the per-tab output fan-out channel (chunks)
    #[serde(default = "default_output_channel_capacity")]
    pub output_channel_capacity: usize,
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_cols() -> u16 {
    120
}

fn default_rows() -> u16 {
    40
}

fn default_replay_buffer_bytes() -> usize {
    64 * 1024
}

fn default_output_channel_capacity() -> usize {
    256
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            replay_buffer_bytes: default_replay_buffer_bytes(),
            output_channel_capacity: default_output_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// How long PTY processes survive after the last connection drops (secs)
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Maximum number of tabs per session
    #[serde(default = "default_max_tabs")]
    pub max_tabs: usize,
}

fn default_grace_period_secs() -> u64 {
    30
}

fn default_max_tabs() -> usize {
    16
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            max_tabs: default_max_tabs(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, or defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.session.grace_period_secs)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.server.data_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => paths::tabs_dir(),
        }
    }
}

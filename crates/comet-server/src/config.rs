//! Server configuration: TOML file + CLI overrides.

use comet_core::{CometError, CometResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub extensions: ExtensionsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request path the Bayeux endpoint is mounted on.
    #[serde(default = "default_path")]
    pub path: String,
    /// Default poll timeout when a client does not ask for one.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Advised pause between a poll reply and the next poll.
    #[serde(default)]
    pub interval_ms: u64,
    /// How long past its poll timeout a silent client is kept.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            timeout_ms: default_timeout_ms(),
            interval_ms: 0,
            max_interval_ms: default_max_interval_ms(),
            max_sessions: default_max_sessions(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// `[extensions]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtensionsSection {
    #[serde(default)]
    pub timestamp: bool,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_path() -> String {
    "/cometd".to_string()
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_interval_ms() -> u64 {
    10_000
}
fn default_max_sessions() -> usize {
    10_000
}
fn default_sweep_interval_secs() -> u64 {
    5
}
fn default_max_body_size() -> usize {
    1024 * 1024
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub path: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub max_interval: Duration,
    pub max_sessions: usize,
    pub sweep_interval: Duration,
    pub max_body_size: usize,
    pub timestamp_extension: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_timeout_ms: Option<u64>,
        cli_max_sessions: Option<usize>,
    ) -> CometResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file_config);
        if let Some(port) = cli_port {
            config.port = port;
        }
        if let Some(ms) = cli_timeout_ms {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(max) = cli_max_sessions {
            config.max_sessions = max;
        }
        Ok(config)
    }

    fn parse(content: &str) -> CometResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| CometError::Config(format!("config parse error: {e}")))
    }

    fn from_file(file: ConfigFile) -> Self {
        let server = file.server;
        Self {
            bind: server.bind,
            port: server.port,
            path: server.path,
            timeout: Duration::from_millis(server.timeout_ms),
            interval: Duration::from_millis(server.interval_ms),
            max_interval: Duration::from_millis(server.max_interval_ms),
            max_sessions: server.max_sessions,
            sweep_interval: Duration::from_secs(server.sweep_interval_secs.max(1)),
            max_body_size: server.max_body_size,
            timestamp_extension: file.extensions.timestamp,
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

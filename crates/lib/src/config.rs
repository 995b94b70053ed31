//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.streamchat/config.json`) and environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::session::{ReconnectPolicy, SessionPolicy};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Chat server (HTTP base URL and WebSocket endpoint).
    #[serde(default)]
    pub server: ServerConfig,

    /// Chat defaults (model, search hint).
    #[serde(default)]
    pub chat: ChatConfig,

    /// Reconnection, watchdog and request timing.
    #[serde(default)]
    pub session: SessionSettings,
}

/// Where the chat server lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// HTTP base URL (default "http://127.0.0.1:8000"). Overridden by STREAMCHAT_SERVER_URL env.
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Path of the streaming endpoint on the server (default "/api/ws").
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Full WebSocket URL. When set, `url` + `wsPath` is not used for streaming.
    #[serde(default)]
    pub ws_url: Option<String>,
}

fn default_server_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_ws_path() -> String {
    "/api/ws".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            ws_path: default_ws_path(),
            ws_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    /// Model selected on startup; use the exact name reported by `streamchat models`.
    pub default_model: Option<String>,
    /// Ask the server to ground every turn with a web search.
    #[serde(default)]
    pub web_search: bool,
}

/// Timing knobs. All durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// How long a streamed turn may go without a terminal frame.
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
    /// How long a text submission waits for the connection to open.
    #[serde(default = "default_open_wait_ms")]
    pub open_wait_ms: u64,
    /// HTTP timeout for one-shot and persistence calls.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_watchdog_ms() -> u64 {
    30_000
}

fn default_open_wait_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            watchdog_ms: default_watchdog_ms(),
            open_wait_ms: default_open_wait_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl SessionSettings {
    pub fn policy(&self) -> SessionPolicy {
        SessionPolicy {
            reconnect: ReconnectPolicy {
                max_attempts: self.max_reconnect_attempts,
                base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            },
            watchdog: Duration::from_millis(self.watchdog_ms),
            open_wait: Duration::from_millis(self.open_wait_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Resolve the server URL: env STREAMCHAT_SERVER_URL overrides config.
pub fn resolve_server_url(config: &Config) -> String {
    std::env::var("STREAMCHAT_SERVER_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| config.server.url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve the WebSocket URL: explicit `wsUrl`, else derived from the server URL.
pub fn resolve_ws_url(config: &Config) -> String {
    match config
        .server
        .ws_url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(url) => url.to_string(),
        None => ws_url_for(&resolve_server_url(config), &config.server.ws_path),
    }
}

/// Map an HTTP base URL to its WebSocket counterpart (http→ws, https→wss) and append `path`.
pub fn ws_url_for(server_url: &str, path: &str) -> String {
    let base = server_url.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{}", base)
    };
    let path = path.trim();
    if path.is_empty() {
        base
    } else if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("STREAMCHAT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".streamchat").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Create the config directory and write a default `config.json` if none exists.
pub fn init_config(path: &std::path::Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating config directory {}", dir.display()))?;
    }
    if path.exists() {
        log::debug!("config already exists at {}, skipping", path.display());
        return Ok(());
    }
    std::fs::write(path, b"{}")
        .with_context(|| format!("writing default config to {}", path.display()))?;
    log::info!("created default config at {}", path.display());
    Ok(())
}

//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.conductor/config.json`) and environment.
//! The gateway URL and token can be overridden with `CONDUCTOR_GATEWAY_URL` and
//! `CONDUCTOR_GATEWAY_TOKEN`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::gateway::ReconnectPolicy;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway endpoint and auth token.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Identity, role and scopes sent in the connect handshake.
    #[serde(default)]
    pub client: ClientConfig,

    /// Reconnect scheduling after an abnormal close.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// History loading options.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Where the open-tabs cache is stored (default ~/.conductor/state.json).
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

/// Gateway URL and auth token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// WebSocket URL (default "ws://127.0.0.1:18789").
    #[serde(default = "default_gateway_url")]
    pub url: String,

    /// Opaque auth token. Overridden by CONDUCTOR_GATEWAY_TOKEN env.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_gateway_url() -> String {
    "ws://127.0.0.1:18789".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            token: None,
        }
    }
}

/// Client identity for the connect handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_client_id")]
    pub id: String,
    #[serde(default = "default_client_version")]
    pub version: String,
    #[serde(default = "default_client_platform")]
    pub platform: String,
    #[serde(default = "default_operator")]
    pub mode: String,
    #[serde(default = "default_operator")]
    pub role: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_protocol")]
    pub min_protocol: u32,
    #[serde(default = "default_protocol")]
    pub max_protocol: u32,
}

fn default_client_id() -> String {
    "conductor".to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_client_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_operator() -> String {
    "operator".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["operator.read".to_string(), "operator.write".to_string()]
}

fn default_protocol() -> u32 {
    crate::gateway::PROTOCOL_VERSION
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: default_client_id(),
            version: default_client_version(),
            platform: default_client_platform(),
            mode: default_operator(),
            role: default_operator(),
            scopes: default_scopes(),
            min_protocol: default_protocol(),
            max_protocol: default_protocol(),
        }
    }
}

/// Reconnect policy kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectKind {
    /// Same delay before every attempt.
    #[default]
    Fixed,
    /// Delay doubles per failed attempt up to maxDelayMs.
    Exponential,
}

/// Reconnect settings. Retries are never capped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default)]
    pub policy: ReconnectKind,
    /// Base delay in milliseconds (default 3000).
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,
    /// Upper bound for the exponential policy (default 30000).
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_reconnect_delay_ms() -> u64 {
    3_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectKind::default(),
            delay_ms: default_reconnect_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    /// Build the retry-scheduling policy described by this config.
    pub fn policy(&self) -> ReconnectPolicy {
        let delay = Duration::from_millis(self.delay_ms);
        match self.policy {
            ReconnectKind::Fixed => ReconnectPolicy::Fixed { delay },
            ReconnectKind::Exponential => ReconnectPolicy::Exponential {
                initial: delay,
                max: Duration::from_millis(self.max_delay_ms.max(self.delay_ms)),
            },
        }
    }
}

/// History loading options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    /// Page size for chat.history (default 100).
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

fn default_history_limit() -> u32 {
    100
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            limit: default_history_limit(),
        }
    }
}

fn non_blank_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the gateway token: env CONDUCTOR_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    non_blank_env("CONDUCTOR_GATEWAY_TOKEN").or_else(|| {
        config
            .gateway
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the gateway URL: env CONDUCTOR_GATEWAY_URL overrides config.
pub fn resolve_gateway_url(config: &Config) -> String {
    non_blank_env("CONDUCTOR_GATEWAY_URL").unwrap_or_else(|| config.gateway.url.trim().to_string())
}

fn conductor_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".conductor"))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CONDUCTOR_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            conductor_dir()
                .map(|d| d.join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Resolve the tab cache path: config override or ~/.conductor/state.json.
pub fn resolve_cache_path(config: &Config) -> PathBuf {
    config
        .cache_path
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .or_else(|| conductor_dir().map(|d| d.join("state.json")))
        .unwrap_or_else(|| PathBuf::from("state.json"))
}

/// Load config from the given path (or the default path). Missing file => default config.
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

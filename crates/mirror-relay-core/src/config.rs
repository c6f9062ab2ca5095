//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level Mirror Relay configuration, read from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<HostConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot: Option<BotConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Relay server ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<RelayAuthConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    /// Serve the embedded phone UI (default: true).
    #[serde(default = "default_true")]
    pub ui: bool,
}

fn default_port() -> u16 {
    3000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            auth: None,
            rate_limit: None,
            ui: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAuthConfig {
    /// Shared secret exchanged for a session token. No password = auth disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Key used to sign session tokens. Random per process when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_secret_env: Option<String>,

    /// Session token lifetime in days (default: 30).
    #[serde(default = "default_session_days")]
    pub session_max_age_days: u32,
}

fn default_session_days() -> u32 {
    30
}

impl RelayAuthConfig {
    pub fn resolve_password(&self) -> Option<String> {
        resolve_secret_field(&self.password, &self.password_env)
    }

    pub fn resolve_session_secret(&self) -> Option<String> {
        resolve_secret_field(&self.session_secret, &self.session_secret_env)
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Max WebSocket connections per IP per minute (default: 30).
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,
}

fn default_max_connections_per_ip() -> u32 {
    30
}

// --- Host link ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Address the host's debug endpoint listens on (default: 127.0.0.1).
    #[serde(default = "default_host_address")]
    pub address: String,

    /// Candidate debug ports, probed in order.
    #[serde(default = "default_host_ports")]
    pub ports: Vec<u16>,

    /// URL/title fragments identifying the main surface.
    #[serde(default = "default_main_patterns")]
    pub main_patterns: Vec<String>,

    /// URL/title fragments accepted when no main surface is found.
    #[serde(default = "default_fallback_patterns")]
    pub fallback_patterns: Vec<String>,

    /// CSS selector of the mirrored conversation surface.
    #[serde(default = "default_surface_selector")]
    pub surface_selector: String,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Per-port timeout for the `/json/list` probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Delay after connecting so initial context events arrive.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_rediscover_interval")]
    pub rediscover_interval_ms: u64,

    #[serde(default = "default_capture_interval")]
    pub capture_interval_ms: u64,

    /// Upper bound on contexts probed per command.
    #[serde(default = "default_max_contexts")]
    pub max_contexts_per_command: usize,
}

fn default_host_address() -> String {
    "127.0.0.1".into()
}

fn default_host_ports() -> Vec<u16> {
    vec![9000, 9001, 9002, 9003]
}

fn default_main_patterns() -> Vec<String> {
    vec!["workbench.html".into()]
}

fn default_fallback_patterns() -> Vec<String> {
    vec!["jetski".into(), "Launchpad".into()]
}

fn default_surface_selector() -> String {
    "#cascade".into()
}

fn default_call_timeout() -> u64 {
    30_000
}

fn default_probe_timeout() -> u64 {
    2_000
}

fn default_settle_delay() -> u64 {
    1_000
}

fn default_rediscover_interval() -> u64 {
    2_000
}

fn default_capture_interval() -> u64 {
    1_000
}

fn default_max_contexts() -> usize {
    8
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            address: default_host_address(),
            ports: default_host_ports(),
            main_patterns: default_main_patterns(),
            fallback_patterns: default_fallback_patterns(),
            surface_selector: default_surface_selector(),
            call_timeout_ms: default_call_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            settle_delay_ms: default_settle_delay(),
            rediscover_interval_ms: default_rediscover_interval(),
            capture_interval_ms: default_capture_interval(),
            max_contexts_per_command: default_max_contexts(),
        }
    }
}

// --- Cloud bridge ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Public relay to bridge to (e.g. `wss://relay.example.com/bridge`).
    /// When unset this relay only accepts inbound bridges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Shared token; required on both ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(default = "default_bridge_reconnect")]
    pub reconnect_delay_ms: u64,

    /// How long the public relay waits for a bridged command result.
    #[serde(default = "default_call_timeout")]
    pub request_timeout_ms: u64,
}

fn default_bridge_reconnect() -> u64 {
    3_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            token_env: None,
            reconnect_delay_ms: default_bridge_reconnect(),
            request_timeout_ms: default_call_timeout(),
        }
    }
}

impl BridgeConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

// --- Bot adapter ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Relay the bot talks to (default: http://127.0.0.1:3000).
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_password: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_password_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramConfig>,

    /// Capacity of the recently-seen message id set (default: 256).
    #[serde(default = "default_recent_ids")]
    pub recent_ids_capacity: usize,

    #[serde(default = "default_bridge_reconnect")]
    pub reconnect_delay_ms: u64,
}

fn default_relay_url() -> String {
    "http://127.0.0.1:3000".into()
}

fn default_recent_ids() -> usize {
    256
}

impl BotConfig {
    pub fn resolve_relay_password(&self) -> Option<String> {
        resolve_secret_field(&self.relay_password, &self.relay_password_env)
    }
}

/// Telegram channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token_env: Option<String>,

    /// Chat ids allowed to control the host. Empty = allow all.
    #[serde(default)]
    pub allowed_chats: Vec<String>,

    #[serde(default = "default_telegram_api")]
    pub api_url: String,

    /// Long-poll timeout for `getUpdates` (default: 25s).
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".into()
}

fn default_poll_timeout() -> u64 {
    25
}

impl TelegramConfig {
    /// Resolve the bot token: check `bot_token` first, then `bot_token_env` environment variable.
    pub fn resolve_bot_token(&self) -> Option<String> {
        resolve_secret_field(&self.bot_token, &self.bot_token_env)
    }
}

// --- Logging ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "mirror_relay_host=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::RelayError::Io)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Relay listen port.
    pub fn relay_port(&self) -> u16 {
        self.relay.as_ref().map(|r| r.port).unwrap_or(3000)
    }

    /// Relay bind address.
    pub fn relay_bind(&self) -> String {
        self.relay
            .as_ref()
            .and_then(|r| r.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn ui_enabled(&self) -> bool {
        self.relay.as_ref().map(|r| r.ui).unwrap_or(true)
    }

    /// Shared login secret, if authentication is enabled.
    pub fn relay_password(&self) -> Option<String> {
        self.relay
            .as_ref()
            .and_then(|r| r.auth.as_ref())
            .and_then(|a| a.resolve_password())
    }

    pub fn session_max_age_days(&self) -> u32 {
        self.relay
            .as_ref()
            .and_then(|r| r.auth.as_ref())
            .map(|a| a.session_max_age_days)
            .unwrap_or(30)
    }

    /// Host link settings, with defaults when the section is absent.
    pub fn host(&self) -> HostConfig {
        self.host.clone().unwrap_or_default()
    }

    /// Shared bridge token, if configured.
    pub fn bridge_token(&self) -> Option<String> {
        self.bridge.as_ref().and_then(|b| b.resolve_token())
    }

    /// Get a config value by dotted path (e.g. "relay.port", "host.ports").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(relay) = &self.relay {
            if relay.port == 0 {
                errors.push("Relay port cannot be 0".to_string());
            }
        }

        if self.relay_password().is_none() {
            warnings.push(
                "No relay password configured; only local-network clients should reach this relay"
                    .to_string(),
            );
        }

        let host = self.host();
        if host.ports.is_empty() {
            errors.push("host.ports must list at least one candidate port".to_string());
        }
        if host.call_timeout_ms == 0 {
            errors.push("host.call_timeout_ms cannot be 0".to_string());
        }
        if host.capture_interval_ms == 0 || host.rediscover_interval_ms == 0 {
            errors.push("host intervals cannot be 0".to_string());
        }
        if host.max_contexts_per_command == 0 {
            errors.push("host.max_contexts_per_command cannot be 0".to_string());
        }

        if let Some(bridge) = &self.bridge {
            if bridge.url.is_some() && bridge.resolve_token().is_none() {
                errors.push("bridge.url is set but no bridge token is configured".to_string());
            }
            if let Some(url) = &bridge.url {
                if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                    errors.push(format!("bridge.url must be a ws:// or wss:// URL: {url}"));
                }
            }
        }

        if let Some(bot) = &self.bot {
            match &bot.telegram {
                Some(tg) if tg.resolve_bot_token().is_none() => {
                    warnings.push("Telegram bot configured without a bot token".to_string());
                }
                Some(tg) if tg.allowed_chats.is_empty() => {
                    warnings.push(
                        "Telegram bot accepts commands from every chat (allowed_chats is empty)"
                            .to_string(),
                    );
                }
                _ => {}
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Mirror Relay data: `~/.mirror_relay/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mirror_relay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_MR_KEY", "pw-123") };
        let input = r#"{"key": "${TEST_MR_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("pw-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_MR_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_MR_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay_port(), 3000);
        assert_eq!(config.relay_bind(), "0.0.0.0");
        assert!(config.ui_enabled());
        assert!(config.relay_password().is_none());

        let host = config.host();
        assert_eq!(host.ports, vec![9000, 9001, 9002, 9003]);
        assert_eq!(host.call_timeout_ms, 30_000);
        assert_eq!(host.capture_interval_ms, 1_000);
        assert_eq!(host.rediscover_interval_ms, 2_000);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.relay_port(), 3000);
    }

    #[test]
    fn test_load_json5_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine in JSON5
                relay: { port: 4100, auth: { password: "hunter2" } },
                host: { ports: [9222], capture_interval_ms: 500 },
                bridge: { url: "wss://relay.example.com/bridge", token: "t0k" },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.relay_port(), 4100);
        assert_eq!(config.relay_password().as_deref(), Some("hunter2"));
        assert_eq!(config.session_max_age_days(), 30);

        let host = config.host();
        assert_eq!(host.ports, vec![9222]);
        assert_eq!(host.capture_interval_ms, 500);
        // Unspecified fields keep their defaults.
        assert_eq!(host.surface_selector, "#cascade");
        assert_eq!(host.max_contexts_per_command, 8);

        assert_eq!(config.bridge_token().as_deref(), Some("t0k"));
        let (_warnings, errors) = config.validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn test_telegram_resolve_bot_token() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_MR_TG_TOKEN", "bot-token-123") };
        let tg = TelegramConfig {
            bot_token: None,
            bot_token_env: Some("TEST_MR_TG_TOKEN".into()),
            allowed_chats: vec![],
            api_url: default_telegram_api(),
            poll_timeout_secs: 25,
        };
        assert_eq!(tg.resolve_bot_token(), Some("bot-token-123".into()));
        unsafe { std::env::remove_var("TEST_MR_TG_TOKEN") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let json_str = r#"{ "logging": {} }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_get_path() {
        let config: Config = json5::from_str(r#"{ relay: { port: 8080 } }"#).unwrap();
        assert_eq!(config.get_path("relay.port"), Some(serde_json::json!(8080)));
        assert!(config.get_path("relay.nope").is_none());
    }

    #[test]
    fn test_validate_bridge_without_token_errors() {
        let config = Config {
            bridge: Some(BridgeConfig {
                url: Some("wss://relay.example.com/bridge".into()),
                ..Default::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("token")),
            "Expected an error about the bridge token, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_bad_bridge_scheme() {
        let config = Config {
            bridge: Some(BridgeConfig {
                url: Some("http://relay.example.com".into()),
                token: Some("t".into()),
                ..Default::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("ws://")));
    }

    #[test]
    fn test_validate_warns_without_password() {
        let (warnings, errors) = Config::default().validate();
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.contains("password")));
    }
}

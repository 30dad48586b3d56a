//! Configuration loading and lookups.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level relaychat configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<SessionsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatConfig>,

    #[serde(default)]
    pub profile: Profile,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Deployment profile. Controls how much failure detail reaches callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Production,
    Development,
}

impl Profile {
    pub fn is_development(&self) -> bool {
        matches!(self, Profile::Development)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,

    /// Interval between SSE keep-alive comments (default: 15).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            auth: None,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

fn default_port() -> u16 {
    8787
}

fn default_keep_alive_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    /// Auth mode: "none" or "token". Default: "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl GatewayAuthConfig {
    /// Resolve the bearer token from direct value or env var.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    /// Get the effective auth mode.
    pub fn effective_mode(&self) -> &str {
        self.mode.as_deref().unwrap_or("none")
    }
}

/// Upstream agent runtime connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Sent as the `api-version` query parameter when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Agent bound to requests that name no agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_agent_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

impl RuntimeConfig {
    /// Resolve the API key: check `api_key` first, then the `api_key_env` variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Evict cached agent sessions idle for longer than this. Unset keeps
    /// sessions for the process lifetime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_ttl_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,
}

/// Request limits applied before a stream opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_max_image_attachments")]
    pub max_image_attachments: usize,

    /// Decoded size limit for a single inline image.
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_image_attachments: default_max_image_attachments(),
            max_image_bytes: default_max_image_bytes(),
            max_message_chars: default_max_message_chars(),
        }
    }
}

fn default_max_image_attachments() -> usize {
    8
}

fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_message_chars() -> usize {
    32_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "relaychat_gateway=debug").
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

/// Base directory for relaychat state: `$RELAYCHAT_HOME` or `~/.relaychat`.
fn data_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("RELAYCHAT_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relaychat")
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::RelayError::Io)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Resolve the default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway
            .as_ref()
            .map(|g| g.port)
            .unwrap_or_else(default_port)
    }

    /// Gateway bind address.
    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// Gateway section, created with defaults if absent.
    pub fn gateway_mut(&mut self) -> &mut GatewayConfig {
        self.gateway.get_or_insert_with(GatewayConfig::default)
    }

    pub fn keep_alive_secs(&self) -> u64 {
        self.gateway
            .as_ref()
            .map(|g| g.keep_alive_secs)
            .unwrap_or_else(default_keep_alive_secs)
    }

    /// Effective gateway auth mode ("none" when unconfigured).
    pub fn auth_mode(&self) -> &str {
        self.gateway
            .as_ref()
            .and_then(|g| g.auth.as_ref())
            .map(|a| a.effective_mode())
            .unwrap_or("none")
    }

    pub fn auth_token(&self) -> Option<String> {
        self.gateway
            .as_ref()
            .and_then(|g| g.auth.as_ref())
            .and_then(|a| a.resolve_token())
    }

    pub fn runtime(&self) -> RuntimeConfig {
        self.runtime.clone().unwrap_or_default()
    }

    /// Upstream request timeout in seconds (default: 120).
    pub fn runtime_timeout_secs(&self) -> u64 {
        self.runtime
            .as_ref()
            .and_then(|r| r.request_timeout_secs)
            .unwrap_or(120)
    }

    pub fn session_idle_ttl_secs(&self) -> Option<u64> {
        self.sessions.as_ref().and_then(|s| s.idle_ttl_secs)
    }

    pub fn session_sweep_interval_secs(&self) -> u64 {
        self.sessions
            .as_ref()
            .and_then(|s| s.sweep_interval_secs)
            .unwrap_or(60)
    }

    pub fn chat_limits(&self) -> ChatConfig {
        self.chat.clone().unwrap_or_default()
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "runtime.endpoint").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let mut value = serde_json::to_value(self).ok()?;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            value = match value {
                serde_json::Value::Object(mut map) => map.remove(segment)?,
                serde_json::Value::Array(mut items) => {
                    let idx: usize = segment.parse().ok()?;
                    if idx >= items.len() {
                        return None;
                    }
                    items.swap_remove(idx)
                }
                _ => return None,
            };
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_RELAY_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_RELAY_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_RELAY_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_RELAY_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 8787);
        assert_eq!(config.gateway_bind(), "127.0.0.1");
        assert_eq!(config.auth_mode(), "none");
        assert_eq!(config.profile, Profile::Production);
        assert_eq!(config.runtime_timeout_secs(), 120);
        assert!(config.session_idle_ttl_secs().is_none());
        assert_eq!(config.chat_limits().max_image_attachments, 8);
    }

    #[test]
    fn test_runtime_resolve_api_key() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_RELAY_API_KEY", "from-env") };
        let runtime = RuntimeConfig {
            api_key_env: Some("TEST_RELAY_API_KEY".into()),
            ..Default::default()
        };
        assert_eq!(runtime.resolve_api_key(), Some("from-env".into()));

        let direct = RuntimeConfig {
            api_key: Some("direct".into()),
            api_key_env: Some("TEST_RELAY_API_KEY".into()),
            ..Default::default()
        };
        assert_eq!(direct.resolve_api_key(), Some("direct".into()));
        unsafe { std::env::remove_var("TEST_RELAY_API_KEY") };
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are allowed
                gateway: { port: 9000, auth: { mode: "token", token: "s3cret" } },
                runtime: { endpoint: "https://agents.example.com/api", default_agent_id: "asst_1" },
                sessions: { idle_ttl_secs: 600 },
                profile: "development",
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway_port(), 9000);
        assert_eq!(config.auth_mode(), "token");
        assert_eq!(config.auth_token(), Some("s3cret".into()));
        assert_eq!(config.session_idle_ttl_secs(), Some(600));
        assert!(config.profile.is_development());
        assert_eq!(
            config.get_path("runtime.default_agent_id"),
            Some(serde_json::json!("asst_1"))
        );
        assert_eq!(config.get_path("runtime.nope"), None);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.runtime.is_none());
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ gateway: ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, crate::error::RelayError::Config(_)));
    }

    #[test]
    fn test_gateway_overrides() {
        let mut config = Config::default();
        config.gateway_mut().port = 9100;
        config.gateway_mut().bind = Some("0.0.0.0".into());
        assert_eq!(config.gateway_port(), 9100);
        assert_eq!(config.gateway_bind(), "0.0.0.0");
        assert_eq!(config.keep_alive_secs(), 15);
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Maximum number of provider slots read from the environment.
pub const PROVIDER_SLOTS: usize = 4;

/// Root configuration for chatrace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub providers: Vec<ProviderConfig>,
    pub race: RaceConfig,
    pub sampling: SamplingConfig,
    pub prompt: PromptConfig,
    pub gateway: GatewayConfig,
}

impl Config {
    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.race.deadline_ms == 0 {
            return Err(ConfigError::Invalid("race deadline must be positive".to_string()));
        }
        Ok(())
    }
}

/// One upstream provider slot. Incomplete slots are ignored by the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RaceConfig {
    /// Wall-clock bound on one race, independent of HTTP timeouts.
    pub deadline_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 8_000,
            max_attempts: 3,
            retry_delay_ms: 500,
            connect_timeout_secs: 10,
        }
    }
}

impl RaceConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: None,
            max_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptConfig {
    pub system: String,
    /// Extra instruction appended on the first turn of a conversation.
    pub first_turn: Option<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system: "You are a helpful assistant. Respond with a JSON object whose \"reply\" field holds your answer.".to_string(),
            first_turn: None,
        }
    }
}

impl PromptConfig {
    /// System instruction for one request.
    pub fn system_message(&self, is_first: bool) -> String {
        match (&self.first_turn, is_first) {
            (Some(extra), true) if !extra.trim().is_empty() => {
                format!("{}\n\n{}", self.system, extra)
            }
            _ => self.system.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl GatewayConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ====== Config loading ======

/// Load configuration from environment variables.
///
/// Priority:
/// 1. `CHATRACE_CONFIG` env var, full JSON config
/// 2. Individual env vars (merged on top of the file config)
/// 3. File fallback (`~/.chatrace/config.json`)
pub fn load_config_from_env() -> Config {
    load_config_from_vars(|key| std::env::var(key).ok(), None)
}

/// Same as [`load_config_from_env`] with an explicit variable lookup and file path.
pub fn load_config_from_vars<F>(var: F, config_path: Option<&Path>) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    // 1. Full JSON
    if let Some(json) = var("CHATRACE_CONFIG") {
        match parse_config(&json) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("Ignoring CHATRACE_CONFIG: {}", e);
            }
        }
    }

    // 2. File fallback, then overlay individual env vars
    let mut cfg = load_config(config_path);

    for slot in 1..=PROVIDER_SLOTS {
        let prefix = format!("PROVIDER_{slot}");
        let field = |name: &str| var(&format!("{prefix}_{name}"));
        let (base, key, model) = (field("BASE_URL"), field("API_KEY"), field("MODEL"));
        if base.is_none() && key.is_none() && model.is_none() {
            continue;
        }
        while cfg.providers.len() < slot {
            cfg.providers.push(ProviderConfig::default());
        }
        let p = &mut cfg.providers[slot - 1];
        if let Some(v) = base {
            p.api_base = v;
        }
        if let Some(v) = key {
            p.api_key = v;
        }
        if let Some(v) = model {
            p.model = v;
        }
        if let Some(v) = field("ID") {
            p.id = v;
        }
        if let Some(v) = field("NAME") {
            p.name = v;
        }
    }

    // Prompt
    if let Some(v) = var("CHATRACE_SYSTEM_PROMPT") {
        cfg.prompt.system = v;
    }
    if let Some(v) = var("CHATRACE_FIRST_TURN_PROMPT") {
        cfg.prompt.first_turn = Some(v);
    }

    // Race tuning
    if let Some(v) = parse_var(&var, "CHATRACE_RACE_DEADLINE_MS") {
        cfg.race.deadline_ms = v;
    }
    if let Some(v) = parse_var(&var, "CHATRACE_RETRY_ATTEMPTS") {
        cfg.race.max_attempts = v;
    }
    if let Some(v) = parse_var(&var, "CHATRACE_RETRY_DELAY_MS") {
        cfg.race.retry_delay_ms = v;
    }
    if let Some(v) = parse_var(&var, "CHATRACE_TEMPERATURE") {
        cfg.sampling.temperature = v;
    }

    // Gateway
    if let Some(v) = var("CHATRACE_HOST") {
        cfg.gateway.host = v;
    }
    if let Some(v) = parse_var(&var, "CHATRACE_PORT") {
        cfg.gateway.port = v;
    }

    cfg
}

fn parse_var<F, T>(var: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring {}: cannot parse {:?}", key, raw);
            None
        }
    }
}

/// Parse a full JSON config and validate it.
pub fn parse_config(json: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatrace")
        .join("config.json")
}

/// Load configuration from file or create default.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if path.exists() {
        match std::fs::read_to_string(&path) {
            Ok(content) => match parse_config(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Ignoring config at {}: {}", path.display(), e);
                    tracing::warn!("Using default configuration.");
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config from {}: {}", path.display(), e);
                tracing::warn!("Using default configuration.");
            }
        }
    }

    Config::default()
}

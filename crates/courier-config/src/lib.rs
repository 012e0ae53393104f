use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("invalid environment override: {0}")]
    EnvOverride(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(rename = "loop", default)]
    pub loop_guard: LoopGuard,
    #[serde(default)]
    pub delivery: Delivery,
    #[serde(default)]
    pub admin: Admin,
    #[serde(default)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopGuard {
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: usize,
    #[serde(default = "default_delay_default_ms")]
    pub delay_default_ms: u64,
    /// Delay applied when the rate cap trips; falls back to `delay_default_ms`.
    #[serde(default)]
    pub delay_burst_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admin {
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self {
            max_per_minute: default_max_per_minute(),
            delay_default_ms: default_delay_default_ms(),
            delay_burst_ms: None,
        }
    }
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for Admin {
    fn default() -> Self {
        Self {
            password: String::new(),
        }
    }
}

impl Default for Audit {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl LoopGuard {
    pub fn burst_delay_ms(&self) -> u64 {
        self.delay_burst_ms.unwrap_or(self.delay_default_ms)
    }
}

fn default_port() -> u16 {
    8787
}

fn default_max_per_minute() -> usize {
    6
}

fn default_delay_default_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_sqlite_path() -> String {
    "./courier-audit.sqlite3".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|err| ConfigError::Read(err.to_string()))?;
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|err| ConfigError::Parse(err.to_string()))?;
    let json_value =
        serde_json::to_value(yaml).map_err(|err| ConfigError::Parse(err.to_string()))?;

    validate_against_schema(&json_value)?;

    let mut cfg: Config =
        serde_json::from_value(json_value).map_err(|err| ConfigError::Parse(err.to_string()))?;
    apply_env_overrides(&mut cfg)?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|path| path.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad("config schema not found at config/config.schema.json".to_string())
    })?;

    let schema_text = std::fs::read_to_string(schema_path)
        .map_err(|err| ConfigError::SchemaLoad(err.to_string()))?;
    let schema: serde_json::Value = serde_json::from_str(&schema_text)
        .map_err(|err| ConfigError::SchemaLoad(err.to_string()))?;

    let validator = jsonschema::validator_for(&schema)
        .map_err(|err| ConfigError::SchemaLoad(err.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

/// Environment variables take precedence over the config file.
pub fn apply_env_overrides(cfg: &mut Config) -> Result<(), ConfigError> {
    if let Some(v) = env_parsed::<u16>("PORT")? {
        cfg.server.port = v;
    }
    if let Some(v) = env_parsed::<usize>("LOOP_MAX_PER_MINUTE")? {
        cfg.loop_guard.max_per_minute = v;
    }
    if let Some(v) = env_parsed::<u64>("LOOP_DELAY_DEFAULT_MS")? {
        cfg.loop_guard.delay_default_ms = v;
    }
    if let Some(v) = env_parsed::<u64>("LOOP_DELAY_BURST_MS")? {
        cfg.loop_guard.delay_burst_ms = Some(v);
    }
    if let Some(v) = env_parsed::<u32>("DELIVERY_MAX_RETRIES")? {
        cfg.delivery.max_retries = v;
    }
    if let Some(v) = env_parsed::<u64>("DELIVERY_BASE_DELAY_MS")? {
        cfg.delivery.base_delay_ms = v;
    }
    if let Ok(v) = std::env::var("ADMIN_PASSWORD") {
        cfg.admin.password = v;
    }
    if let Ok(v) = std::env::var("SQLITE_PATH") {
        cfg.audit.sqlite_path = v;
    }
    Ok(())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::EnvOverride(format!("{name}={raw} is not a valid value"))),
        Err(_) => Ok(None),
    }
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.admin.password.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "admin.password (or ADMIN_PASSWORD) must not be empty".to_string(),
        ));
    }
    if cfg.audit.sqlite_path.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "audit.sqlite_path is required".to_string(),
        ));
    }
    if cfg.loop_guard.max_per_minute == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "loop.max_per_minute must be at least 1".to_string(),
        ));
    }
    if cfg.delivery.max_retries == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "delivery.max_retries must be at least 1".to_string(),
        ));
    }
    Ok(())
}

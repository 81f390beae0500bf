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
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("missing credential: {0}")]
    MissingCredential(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub completion: Completion,
    #[serde(default)]
    pub speech: Speech,
    #[serde(default)]
    pub retrieval: Retrieval,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

/// Remote chat-completion upstream used for free-form turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    #[serde(default = "default_completion_endpoint")]
    pub endpoint: String,
    /// Inline key; takes precedence over `api_key_env`.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_completion_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_circuit_breaker_failures")]
    pub circuit_breaker_failures: u64,
    #[serde(default = "default_circuit_breaker_open_ms")]
    pub circuit_breaker_open_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speech {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_speech_language")]
    pub language: String,
    #[serde(default = "default_speech_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Speech {
    fn default() -> Self {
        Self {
            endpoint: None,
            language: default_speech_language(),
            timeout_ms: default_speech_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retrieval {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_retrieval_top_k")]
    pub top_k: usize,
    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Retrieval {
    fn default() -> Self {
        Self {
            endpoint: None,
            top_k: default_retrieval_top_k(),
            timeout_ms: default_retrieval_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
}

fn default_completion_endpoint() -> String {
    "https://api.polza.ai/api/v1/chat/completions".to_string()
}

fn default_completion_model() -> String {
    "qwen/qwen-turbo".to_string()
}

fn default_completion_timeout_ms() -> u64 {
    30_000
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

fn default_circuit_breaker_failures() -> u64 {
    5
}

fn default_circuit_breaker_open_ms() -> u64 {
    30_000
}

fn default_speech_language() -> String {
    "ru-RU".to_string()
}

fn default_speech_timeout_ms() -> u64 {
    15_000
}

fn default_retrieval_top_k() -> usize {
    3
}

fn default_retrieval_timeout_ms() -> u64 {
    5_000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let mut cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    resolve_credential(&mut cfg.completion)?;
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
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

/// Pulls the completion key out of the environment once, at load time.
pub fn resolve_credential(completion: &mut Completion) -> Result<(), ConfigError> {
    if completion
        .api_key
        .as_ref()
        .is_some_and(|v| !v.trim().is_empty())
    {
        return Ok(());
    }
    let var = completion.api_key_env.as_deref().ok_or_else(|| {
        ConfigError::MissingCredential(
            "completion.api_key or completion.api_key_env is required".to_string(),
        )
    })?;
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => {
            completion.api_key = Some(v.trim().to_string());
            Ok(())
        }
        _ => Err(ConfigError::MissingCredential(format!(
            "environment variable {var} is not set"
        ))),
    }
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.completion.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "completion.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.completion.circuit_breaker_failures == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "completion.circuit_breaker_failures must be >= 1".to_string(),
        ));
    }
    if cfg.completion.circuit_breaker_open_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "completion.circuit_breaker_open_ms must be >= 1".to_string(),
        ));
    }
    for (name, endpoint) in [
        ("speech.endpoint", cfg.speech.endpoint.as_deref()),
        ("retrieval.endpoint", cfg.retrieval.endpoint.as_deref()),
    ] {
        if let Some(v) = endpoint {
            if !(v.starts_with("http://") || v.starts_with("https://")) {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "{name} must be an http(s) URL"
                )));
            }
        }
    }
    Ok(())
}

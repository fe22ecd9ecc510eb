use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Which backend the conversation store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackendKind {
    Memory,
    Redis,
    Disabled,
}

/// Runtime configuration, loaded once from the environment at startup.
///
/// Environment variables:
/// - OPENROUTER_API_KEY (mandatory), OPENROUTER_BASE_URL,
///   OPENROUTER_HTTP_REFERER, OPENROUTER_X_TITLE
/// - RESPONSE2CHAT_BIND_ADDR, RESPONSE2CHAT_CLIENT_API_KEY
/// - RESPONSE2CHAT_STATE_BACKEND = memory|redis|disabled
/// - RESPONSE2CHAT_REDIS_URL, RESPONSE2CHAT_STATE_TTL_SECONDS
/// - RESPONSE2CHAT_MODEL_MAP_PATH (JSON object of alias -> upstream model)
/// - RESPONSE2CHAT_MAX_TOKENS_BUFFER, RESPONSE2CHAT_DEGRADE_FIELDS (comma separated)
/// - RESPONSE2CHAT_RETRY_MAX_ATTEMPTS, RESPONSE2CHAT_RETRY_MAX_SECONDS,
///   RESPONSE2CHAT_RETRY_BACKOFF, RESPONSE2CHAT_REQUEST_TIMEOUT_SECONDS
#[derive(Debug, Clone)]
pub struct Settings {
    pub upstream_api_key: String,
    pub upstream_base_url: String,
    pub http_referer: Option<String>,
    pub x_title: Option<String>,

    pub bind_addr: String,
    pub client_api_key: Option<String>,

    pub state_backend: StateBackendKind,
    pub redis_url: String,
    pub state_ttl_seconds: u64,

    pub model_alias_map: HashMap<String, String>,
    pub max_tokens_buffer: u32,
    pub degrade_fields: Vec<String>,
    pub retry_max_attempts: u32,
    pub retry_max_seconds: f64,
    pub retry_backoff: f64,
    pub request_timeout_s: f64,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let upstream_api_key = env_str("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY not set (mandatory)")?;

        let state_backend = match env_str("RESPONSE2CHAT_STATE_BACKEND")
            .as_deref()
            .unwrap_or("memory")
        {
            "memory" => StateBackendKind::Memory,
            "redis" => StateBackendKind::Redis,
            "disabled" => StateBackendKind::Disabled,
            other => bail!("Unknown RESPONSE2CHAT_STATE_BACKEND: {other:?}"),
        };

        let model_alias_map = match env_str("RESPONSE2CHAT_MODEL_MAP_PATH") {
            Some(path) => load_model_map(Path::new(&path))?,
            None => HashMap::new(),
        };

        Ok(Self {
            upstream_api_key,
            upstream_base_url: env_str("OPENROUTER_BASE_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".into()),
            http_referer: env_str("OPENROUTER_HTTP_REFERER"),
            x_title: env_str("OPENROUTER_X_TITLE"),
            bind_addr: env_str("RESPONSE2CHAT_BIND_ADDR")
                .unwrap_or_else(|| "127.0.0.1:8092".into()),
            client_api_key: env_str("RESPONSE2CHAT_CLIENT_API_KEY"),
            state_backend,
            redis_url: env_str("RESPONSE2CHAT_REDIS_URL")
                .unwrap_or_else(|| "redis://localhost:6379/0".into()),
            state_ttl_seconds: env_parse("RESPONSE2CHAT_STATE_TTL_SECONDS", 3600),
            model_alias_map,
            max_tokens_buffer: env_parse("RESPONSE2CHAT_MAX_TOKENS_BUFFER", 64),
            degrade_fields: env_list("RESPONSE2CHAT_DEGRADE_FIELDS")
                .unwrap_or_else(|| vec!["verbosity".into()]),
            retry_max_attempts: env_parse("RESPONSE2CHAT_RETRY_MAX_ATTEMPTS", 2),
            retry_max_seconds: env_parse("RESPONSE2CHAT_RETRY_MAX_SECONDS", 15.0),
            retry_backoff: env_parse("RESPONSE2CHAT_RETRY_BACKOFF", 0.5),
            request_timeout_s: env_parse("RESPONSE2CHAT_REQUEST_TIMEOUT_SECONDS", 120.0),
        })
    }
}

impl Default for Settings {
    /// Defaults suitable for tests; the upstream key is a placeholder.
    fn default() -> Self {
        Self {
            upstream_api_key: "test-key".into(),
            upstream_base_url: "https://openrouter.ai/api/v1".into(),
            http_referer: None,
            x_title: None,
            bind_addr: "127.0.0.1:8092".into(),
            client_api_key: None,
            state_backend: StateBackendKind::Memory,
            redis_url: "redis://localhost:6379/0".into(),
            state_ttl_seconds: 3600,
            model_alias_map: HashMap::new(),
            max_tokens_buffer: 64,
            degrade_fields: vec!["verbosity".into()],
            retry_max_attempts: 2,
            retry_max_seconds: 15.0,
            retry_backoff: 0.5,
            request_timeout_s: 120.0,
        }
    }
}

fn load_model_map(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model map {}", path.display()))?;
    let data: HashMap<String, String> = serde_json::from_str(&text)
        .with_context(|| format!("model map {} must be a JSON object", path.display()))?;
    Ok(data)
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_str(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_str(key).map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

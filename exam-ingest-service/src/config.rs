use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use exam_flow::ExtractorConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{key} must be a valid number, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },

    #[error("unknown LLM_PROVIDER '{0}' (expected 'ollama' or 'openrouter')")]
    UnknownProvider(String),

    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("DATABASE_URL is not set; configure a database or pass --ephemeral to keep exams in memory for this run")]
    DatabaseRequired,
}

/// Which text-generation backend drives the extractor.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmProvider {
    Ollama { url: String, model: String },
    OpenRouter { api_key: String, model: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub provider: LlmProvider,
    pub extractor: ExtractorConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let provider = match get("LLM_PROVIDER")
            .unwrap_or_else(|| "ollama".to_string())
            .to_lowercase()
            .as_str()
        {
            "ollama" => LlmProvider::Ollama {
                url: get("OLLAMA_URL").unwrap_or_else(|| "http://localhost:11434".to_string()),
                model: get("OLLAMA_MODEL").unwrap_or_else(|| "llama3.1:latest".to_string()),
            },
            "openrouter" => LlmProvider::OpenRouter {
                api_key: get("OPENROUTER_API_KEY").ok_or(ConfigError::Missing("OPENROUTER_API_KEY"))?,
                model: get("OPENROUTER_MODEL").unwrap_or_else(|| "openai/gpt-4.1-mini".to_string()),
            },
            other => return Err(ConfigError::UnknownProvider(other.to_string())),
        };

        let defaults = ExtractorConfig::default();
        let extractor = ExtractorConfig {
            request_timeout: Duration::from_secs(number(&get, "LLM_TIMEOUT_SECS", 120)?),
            max_retries: number(&get, "EXTRACTION_MAX_RETRIES", defaults.max_retries)?,
            retry_delay: Duration::from_millis(number(&get, "EXTRACTION_RETRY_DELAY_MS", 500)?),
            ..defaults
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            database_max_connections: number(&get, "DATABASE_MAX_CONNECTIONS", 5)?,
            provider,
            extractor,
        })
    }
}

fn number<T, F>(get: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            key,
            value,
        }),
        None => Ok(default),
    }
}

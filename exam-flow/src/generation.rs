use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::GenerationError;

/// Sampling options forwarded to the text-generation service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub max_output_tokens: u32,
}

/// A text-generation service: prompt in, generated text out.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError>;
}

/// Ollama `/api/generate` client.
pub struct OllamaGenerator {
    base_url: String,
    model: String,
    client: Client,
    timeout: Duration,
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

#[derive(Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelTag>,
}

#[derive(Deserialize)]
struct OllamaModelTag {
    name: String,
}

/// What `/api/tags` reported about the configured model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OllamaHealth {
    pub url: String,
    pub model: String,
    pub model_available: bool,
    pub installed_models: Vec<String>,
}

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

impl OllamaGenerator {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Provider(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask `/api/tags` which models the server has, with a short timeout.
    pub async fn check_health(&self) -> Result<OllamaHealth, GenerationError> {
        let url = format!("{}/api/tags", self.base_url);
        debug!(url = %url, "Checking Ollama");

        let response = self
            .client
            .get(&url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
            .map_err(|e| self.request_error(e, HEALTH_CHECK_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let tags: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Response(e.to_string()))?;
        Ok(self.health_from_tags(tags))
    }

    fn health_from_tags(&self, tags: OllamaTagsResponse) -> OllamaHealth {
        let installed_models: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        OllamaHealth {
            url: self.base_url.clone(),
            model: self.model.clone(),
            model_available: installed_models.iter().any(|name| *name == self.model),
            installed_models,
        }
    }

    fn request_error(&self, error: reqwest::Error, timeout: Duration) -> GenerationError {
        if error.is_connect() {
            GenerationError::Connection(self.base_url.clone())
        } else if error.is_timeout() {
            GenerationError::Timeout(timeout)
        } else {
            GenerationError::Provider(error.to_string())
        }
    }
}

#[async_trait]
impl TextGenerator for OllamaGenerator {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: OllamaOptions {
                temperature: options.temperature,
                num_predict: options.max_output_tokens,
            },
        };

        debug!(model = %self.model, prompt_chars = prompt.len(), "Calling Ollama");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Response(e.to_string()))?;

        Ok(parsed.response.unwrap_or_default())
    }
}

/// OpenRouter-backed generator using a `rig` agent.
#[cfg(feature = "rig")]
pub struct OpenRouterGenerator {
    client: rig::providers::openrouter::Client,
    model: String,
}

#[cfg(feature = "rig")]
impl OpenRouterGenerator {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: rig::providers::openrouter::Client::new(api_key),
            model: model.to_string(),
        }
    }
}

#[cfg(feature = "rig")]
#[async_trait]
impl TextGenerator for OpenRouterGenerator {
    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        use rig::client::CompletionClient;
        use rig::completion::Prompt;

        let agent = self
            .client
            .agent(&self.model)
            .temperature(options.temperature)
            .max_tokens(u64::from(options.max_output_tokens))
            .build();

        debug!(model = %self.model, prompt_chars = prompt.len(), "Calling OpenRouter");

        agent
            .prompt(prompt)
            .await
            .map_err(|e| GenerationError::Provider(e.to_string()))
    }
}

/// Replays canned responses in order; used to drive the extractor in tests and demos.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, GenerationError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, GenerationError>>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with the same text.
    pub fn repeating(response: &str, times: usize) -> Self {
        Self::new((0..times).map(|_| Ok(response.to_string())))
    }

    pub async fn calls(&self) -> usize {
        self.prompts.lock().await.len()
    }

    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        self.prompts.lock().await.push(prompt.to_string());
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::Response("no scripted response left".into())))
    }
}

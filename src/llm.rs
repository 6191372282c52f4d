//! Chat-model clients behind a single `complete(prompt) -> text` contract.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::error::CrewError;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, CrewError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiReply,
}

#[derive(Deserialize)]
struct OpenAiReply {
    #[serde(default)]
    content: Option<String>,
}

fn model_error(message: impl Into<String>) -> CrewError {
    CrewError::Model {
        message: message.into(),
    }
}

fn build_http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .context("failed to build model HTTP client")
}

/// OpenAI-compatible `/v1/chat/completions` client (OpenAI, DeepSeek, Groq, Ollama).
pub struct OpenAiCompatibleModel {
    label: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    http_client: reqwest::Client,
}

impl OpenAiCompatibleModel {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let model = model.into();
        Ok(Self {
            label: model.clone(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model,
            api_key,
            temperature: Some(0.7),
            http_client: build_http_client(timeout_secs)?,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, prompt: &str) -> Result<String, CrewError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            max_tokens: None,
        };

        let mut request = self.http_client.post(&url).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                model_error(format!("request to '{}' timed out", self.model))
            } else {
                model_error(format!("request to '{}' failed: {err}", self.model))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(model_error(format!("API error {status}: {body_text}")));
        }

        let parsed = response
            .json::<OpenAiResponse>()
            .await
            .map_err(|err| model_error(format!("failed to parse chat response: {err}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| model_error("chat response contained no message content"))
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Anthropic messages API client.
pub struct AnthropicModel {
    model: String,
    api_key: String,
    http_client: reqwest::Client,
}

impl AnthropicModel {
    pub fn new(model: impl Into<String>, api_key: String, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            model: model.into(),
            api_key,
            http_client: build_http_client(timeout_secs)?,
        })
    }
}

#[async_trait]
impl ChatModel for AnthropicModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, CrewError> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: 4096,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .http_client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|err| model_error(format!("request to '{}' failed: {err}", self.model)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(model_error(format!("API error {status}: {body_text}")));
        }

        let parsed = response
            .json::<AnthropicResponse>()
            .await
            .map_err(|err| model_error(format!("failed to parse messages response: {err}")))?;
        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text)
            .collect::<Vec<String>>()
            .join("");
        if text.is_empty() {
            return Err(model_error("messages response contained no text"));
        }
        Ok(text)
    }
}

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}

pub fn detect_provider() -> Option<Provider> {
    if env_present("OPENAI_API_KEY") {
        return Some(Provider::Openai);
    }
    if env_present("ANTHROPIC_API_KEY") {
        return Some(Provider::Anthropic);
    }
    if env_present("DEEPSEEK_API_KEY") {
        return Some(Provider::Deepseek);
    }
    if env_present("GROQ_API_KEY") {
        return Some(Provider::Groq);
    }
    if env_present("OLLAMA_HOST") {
        return Some(Provider::Ollama);
    }
    None
}

pub fn default_model_for(provider: Provider) -> &'static str {
    match provider {
        Provider::Openai | Provider::Auto => "gpt-4.1-mini",
        Provider::Anthropic => "claude-sonnet-4-20250514",
        Provider::Deepseek => "deepseek-chat",
        Provider::Groq => "llama-3.3-70b-versatile",
        Provider::Ollama => "llama3.1",
    }
}

pub fn resolve_provider(cfg: &RuntimeConfig) -> Result<Provider> {
    match cfg.provider {
        Provider::Auto => detect_provider().context(
            "no provider could be auto-detected. Set one of OPENAI_API_KEY, ANTHROPIC_API_KEY, \
             DEEPSEEK_API_KEY, GROQ_API_KEY, or use --provider ollama",
        ),
        provider => Ok(provider),
    }
}

fn build_model(provider: Provider, model_name: String, timeout_secs: u64) -> Result<Arc<dyn ChatModel>> {
    match provider {
        Provider::Openai | Provider::Auto => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY is required for OpenAI provider")?;
            let base_url = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string());
            Ok(Arc::new(OpenAiCompatibleModel::new(
                base_url,
                model_name,
                Some(api_key),
                timeout_secs,
            )?))
        }
        Provider::Anthropic => {
            let api_key = std::env::var("ANTHROPIC_API_KEY")
                .context("ANTHROPIC_API_KEY is required for Anthropic provider")?;
            Ok(Arc::new(AnthropicModel::new(model_name, api_key, timeout_secs)?))
        }
        Provider::Deepseek => {
            let api_key = std::env::var("DEEPSEEK_API_KEY")
                .context("DEEPSEEK_API_KEY is required for DeepSeek provider")?;
            Ok(Arc::new(OpenAiCompatibleModel::new(
                "https://api.deepseek.com",
                model_name,
                Some(api_key),
                timeout_secs,
            )?))
        }
        Provider::Groq => {
            let api_key = std::env::var("GROQ_API_KEY")
                .context("GROQ_API_KEY is required for Groq provider")?;
            Ok(Arc::new(OpenAiCompatibleModel::new(
                "https://api.groq.com/openai",
                model_name,
                Some(api_key),
                timeout_secs,
            )?))
        }
        Provider::Ollama => {
            let host = std::env::var("OLLAMA_HOST")
                .unwrap_or_else(|_| "http://localhost:11434".to_string());
            Ok(Arc::new(OpenAiCompatibleModel::new(
                host,
                model_name,
                None,
                timeout_secs,
            )?))
        }
    }
}

/// Returns the worker model and the manager model (falls back to the worker model).
pub fn resolve_models(cfg: &RuntimeConfig) -> Result<(Arc<dyn ChatModel>, Arc<dyn ChatModel>)> {
    let provider = resolve_provider(cfg)?;
    let model_name = cfg
        .model
        .clone()
        .unwrap_or_else(|| default_model_for(provider).to_string());
    tracing::info!(provider = ?provider, model = %model_name, "Using model");
    let worker = build_model(provider, model_name, cfg.model_timeout_secs)?;

    let manager = match cfg.manager_model.clone() {
        Some(name) => {
            tracing::info!(provider = ?provider, model = %name, "Using manager model");
            build_model(provider, name, cfg.model_timeout_secs)?
        }
        None => worker.clone(),
    };
    Ok((worker, manager))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_request_omits_unset_fields() {
        let body = ChatRequest {
            model: "gpt-4.1-mini",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: None,
            max_tokens: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "user");
        assert!(value.get("temperature").is_none());
        assert!(value.get("max_tokens").is_none());
    }

    #[test]
    fn anthropic_text_blocks_are_parsed() {
        let parsed: AnthropicResponse = serde_json::from_str(
            r#"{"content": [{"type": "text", "text": "{\"agents\": []}"}, {"type": "tool_use", "id": "x"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert_eq!(parsed.content[0].kind, "text");
    }

    #[test]
    fn every_provider_has_a_default_model() {
        for provider in [
            Provider::Openai,
            Provider::Anthropic,
            Provider::Deepseek,
            Provider::Groq,
            Provider::Ollama,
        ] {
            assert!(!default_model_for(provider).is_empty());
        }
    }
}

//! Text generation backends.
//!
//! | Provider | Endpoint | Auth |
//! |----------|----------|------|
//! | `openai` | `{url}/v1/chat/completions` | bearer key from `generation.api_key_env` |
//! | `ollama` | `{url}/api/generate` | none |
//!
//! `disabled` yields no generator; the pipeline then answers from web
//! results or with the no-content response.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use groundwork_core::providers::GenerationProvider;

use crate::config::GenerationConfig;
use crate::http;

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

/// Build the configured generator. `model_override` swaps the model name
/// (used for the judge).
pub fn create_generator(
    config: &GenerationConfig,
    model_override: Option<&str>,
) -> Result<Option<Arc<dyn GenerationProvider>>> {
    let model = model_override
        .map(str::to_string)
        .or_else(|| config.model.clone());

    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => {
            let model = model.ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
            Ok(Some(Arc::new(OpenAIGenerator::new(config, model)?)))
        }
        "ollama" => {
            let model = model.ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
            Ok(Some(Arc::new(OllamaGenerator::new(config, model)?)))
        }
        other => bail!("Unknown generation provider: {}", other),
    }
}

pub struct OpenAIGenerator {
    client: reqwest::Client,
    model: String,
    endpoint: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig, model: String) -> Result<Self> {
        let base = config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string());
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            model,
            endpoint: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            api_key: http::env_key(&config.api_key_env)?,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        let json = http::post_json(
            &self.client,
            "OpenAI",
            &self.endpoint,
            Some(self.api_key.as_str()),
            &body,
            self.max_retries,
        )
        .await?;
        parse_chat_completion(&json)
    }
}

fn parse_chat_completion(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

pub struct OllamaGenerator {
    client: reqwest::Client,
    model: String,
    endpoint: String,
    max_retries: u32,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig, model: String) -> Result<Self> {
        let base = config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string());
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            model,
            endpoint: format!("{}/api/generate", base.trim_end_matches('/')),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": temperature, "num_predict": max_tokens },
        });
        let json = http::post_json(&self.client, "Ollama", &self.endpoint, None, &body, self.max_retries).await?;
        parse_ollama_generate(&json)
    }
}

fn parse_ollama_generate(json: &serde_json::Value) -> Result<String> {
    json.get("response")
        .and_then(|r| r.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response field"))
}

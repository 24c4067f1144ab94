//! Web search over a JSON HTTP endpoint.
//!
//! Request: `POST {url}` with `{query, max_results}` and an optional
//! bearer token. Response: `{results: [{url, title, content, score}]}`
//! (Tavily-style). `relevance` is accepted in place of `score`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use groundwork_core::providers::{WebHit, WebSearchProvider};

use crate::config::WebSearchSection;
use crate::http;

pub fn create_web_search(config: &WebSearchSection) -> Result<Option<Arc<dyn WebSearchProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => Ok(Some(Arc::new(HttpWebSearch::new(config)?))),
        other => bail!("Unknown web search provider: {}", other),
    }
}

pub struct HttpWebSearch {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    max_results: usize,
    max_retries: u32,
}

impl HttpWebSearch {
    pub fn new(config: &WebSearchSection) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("web_search.url required for http provider"))?;
        Ok(Self {
            client: http::client(config.timeout_secs)?,
            url,
            // Unset key: request goes out without an Authorization header.
            api_key: http::env_key(&config.api_key_env).ok(),
            max_results: config.settings.max_results,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl WebSearchProvider for HttpWebSearch {
    async fn search_and_summarize(&self, query: &str) -> Result<Vec<WebHit>> {
        let body = serde_json::json!({ "query": query, "max_results": self.max_results });
        let json = http::post_json(
            &self.client,
            "Web search",
            &self.url,
            self.api_key.as_deref(),
            &body,
            self.max_retries,
        )
        .await?;
        let mut hits = parse_search_response(&json)?;
        hits.truncate(self.max_results);
        Ok(hits)
    }
}

fn parse_search_response(json: &serde_json::Value) -> Result<Vec<WebHit>> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid web search response: missing results array"))?;

    Ok(results
        .iter()
        .filter_map(|item| {
            let url = item.get("url")?.as_str()?.to_string();
            let content = item
                .get("content")
                .or_else(|| item.get("snippet"))
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .trim()
                .to_string();
            if content.is_empty() {
                return None;
            }
            let title = item
                .get("title")
                .and_then(|t| t.as_str())
                .unwrap_or(url.as_str())
                .to_string();
            let relevance = item
                .get("relevance")
                .or_else(|| item.get("score"))
                .and_then(|s| s.as_f64())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0);
            Some(WebHit {
                url,
                title,
                content,
                relevance,
            })
        })
        .collect())
}

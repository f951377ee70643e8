//! Search provider boundary. The default implementation talks to the Brave
//! web-search API; an unset key degrades to empty results rather than
//! failing the whole research run.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{info, warn};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>>;
}

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const MAX_PER_REQUEST: usize = 20;

pub struct BraveSearch {
    api_key: String,
    endpoint: String,
    client: Client,
}

impl BraveSearch {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            endpoint: BRAVE_ENDPOINT.to_string(),
            client: Client::new(),
        }
    }

    #[cfg(test)]
    fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

#[derive(Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: BraveWeb,
}

#[derive(Deserialize, Default)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
}

#[async_trait]
impl SearchProvider for BraveSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        if self.api_key.is_empty() {
            warn!("search API key not set, returning no results");
            return Ok(Vec::new());
        }

        info!(query, "running web search");
        let response = self
            .client
            .get(&self.endpoint)
            .timeout(Duration::from_secs(30))
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .query(&[
                ("q", query),
                ("count", &max_results.min(MAX_PER_REQUEST).to_string()),
                ("search_lang", "en"),
                ("safesearch", "moderate"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout
                } else {
                    EngineError::Provider(format!("search request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 429 {
                warn!("search API quota exceeded");
            }
            return Err(EngineError::Provider(format!("search API {status}")));
        }

        let parsed: BraveResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Provider(format!("unparseable search body: {e}")))?;

        let results = parsed
            .web
            .results
            .into_iter()
            .take(max_results)
            .map(|r| SearchResult {
                title: r.title,
                url: r.url,
                snippet: r.description,
            })
            .collect::<Vec<_>>();
        info!(count = results.len(), "search complete");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_degrades_to_empty_results() {
        let s = BraveSearch::new("").with_endpoint("http://127.0.0.1:1/unused");
        let results = s.search("anything", 5).await.unwrap();
        assert!(results.is_empty());
    }
}

//! Research pipeline: search, polite parallel fetch, per-source reduction,
//! and a single synthesis call that cites its sources by number. Partial
//! success is fine; a run with zero usable sources fails with `NoSources`.

pub mod fetch;
pub mod search;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::core::cache::{ArtifactCache, Purpose, fingerprint};
use crate::core::model::{ChatMessage, CompletionRequest, ModelClient};
use crate::core::research::fetch::{FetchedPage, Fetcher, normalize_url};
use crate::core::research::search::{SearchProvider, SearchResult};
use crate::core::signal::{CancelSignal, Deadline};
use crate::error::{EngineError, Result};

const SUMMARY_PROMPT: &str = "Summarise the following page excerpt in 3 to 6 sentences. \
    Keep concrete facts, figures, and claims; drop navigation noise and boilerplate.";

const SYNTHESIS_PROMPT: &str = "You are answering a research question from numbered source \
    summaries. Write a direct, well-organised answer. Every claim taken from a source must \
    carry an inline citation like [1] or [2] that matches the source list. Do not invent \
    sources or cite numbers outside the list.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub index: usize,
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutcome {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub model_id: String,
    pub pages_synthesised: usize,
}

pub struct Researcher {
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn Fetcher>,
    model: Arc<ModelClient>,
    cache: Arc<ArtifactCache>,
    default_max_sources: usize,
    summary_char_cap: usize,
}

impl Researcher {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn Fetcher>,
        model: Arc<ModelClient>,
        cache: Arc<ArtifactCache>,
        default_max_sources: usize,
        summary_char_cap: usize,
    ) -> Self {
        Self {
            search,
            fetcher,
            model,
            cache,
            default_max_sources: default_max_sources.max(1),
            summary_char_cap: summary_char_cap.max(100),
        }
    }

    pub async fn run(
        &self,
        requester: &str,
        query: &str,
        max_sources: Option<usize>,
        synthesis_model: &str,
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<ResearchOutcome> {
        let max_sources = max_sources.unwrap_or(self.default_max_sources).max(1);
        if query.trim().is_empty() {
            return Err(EngineError::BadRequest("empty research query".into()));
        }

        let results = self.cached_search(query, max_sources, cancel).await?;
        if results.is_empty() {
            return Err(EngineError::NoSources);
        }

        let pages = self.fetch_all(&results, cancel, deadline).await;
        cancel.check()?;
        if pages.is_empty() {
            return Err(EngineError::NoSources);
        }

        // Reduce each fetched page to a short summary, cached by content.
        let mut sources = Vec::new();
        let mut summaries = Vec::new();
        for (result, page) in &pages {
            let summary = self
                .summarise_page(requester, page, synthesis_model, cancel, deadline)
                .await;
            match summary {
                Ok(text) => {
                    let index = sources.len() + 1;
                    sources.push(SourceRef {
                        index,
                        url: page.url.clone(),
                        title: result.title.clone(),
                    });
                    summaries.push(format!("[{index}] {} ({})\n{text}", result.title, page.url));
                }
                Err(e) => warn!(url = %page.url, "source reduction failed: {e}"),
            }
        }
        if sources.is_empty() {
            return Err(EngineError::NoSources);
        }

        let question = format!(
            "Question: {query}\n\nSources:\n{}\n\nAnswer with inline [n] citations.",
            summaries.join("\n\n")
        );
        let req = CompletionRequest {
            agent_id: "researcher".into(),
            model: synthesis_model.to_string(),
            system: SYNTHESIS_PROMPT.to_string(),
            messages: vec![ChatMessage::new("user", question)],
            temperature: 0.4,
            max_tokens: 1500,
            timeout: deadline.clamp(Duration::from_secs(30)),
        };
        let completion = self.model.complete(requester, &req, cancel, deadline).await?;

        info!(
            query,
            pages = sources.len(),
            model = synthesis_model,
            "research synthesis complete"
        );
        Ok(ResearchOutcome {
            answer: completion.text,
            pages_synthesised: sources.len(),
            sources,
            model_id: synthesis_model.to_string(),
        })
    }

    /// Search results cached by (query, max) for the research TTL.
    async fn cached_search(
        &self,
        query: &str,
        max_sources: usize,
        cancel: &CancelSignal,
    ) -> Result<Vec<SearchResult>> {
        let key = fingerprint(
            Purpose::Research,
            "search",
            &json!({"query": query, "max": max_sources}),
            "-",
        );
        let serialized = self
            .cache
            .get_or_produce(Purpose::Research, &key, cancel, || async move {
                let results = self.search.search(query, max_sources).await?;
                Ok(serde_json::to_string(&results)?)
            })
            .await?;
        Ok(serde_json::from_str(&serialized)?)
    }

    /// Fetch every result in parallel under the limiter's gates, dropping
    /// duplicates by normalised url and recording failures without
    /// aborting the run. Order of the input list is preserved.
    async fn fetch_all(
        &self,
        results: &[SearchResult],
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Vec<(SearchResult, FetchedPage)> {
        let mut seen = std::collections::HashSet::new();
        let mut set = JoinSet::new();
        for (position, result) in results.iter().enumerate() {
            let Some(normalized) = normalize_url(&result.url) else {
                warn!(url = %result.url, "skipping unfetchable url");
                continue;
            };
            if !seen.insert(normalized.clone()) {
                continue;
            }
            let fetcher = self.fetcher.clone();
            let result = result.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let page = fetcher.fetch_clean(&normalized, &cancel, deadline).await;
                (position, result, page)
            });
        }

        let mut fetched = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((position, result, Ok(page))) => fetched.push((position, result, page)),
                Ok((_, result, Err(e))) => {
                    warn!(url = %result.url, "fetch skipped: {e}");
                }
                Err(e) => warn!("fetch task panicked: {e}"),
            }
        }
        fetched.sort_by_key(|(position, _, _)| *position);
        fetched
            .into_iter()
            .map(|(_, result, page)| (result, page))
            .collect()
    }

    async fn summarise_page(
        &self,
        requester: &str,
        page: &FetchedPage,
        model_id: &str,
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<String> {
        let mut excerpt = page.text.clone();
        if excerpt.len() > self.summary_char_cap {
            let mut cut = self.summary_char_cap;
            while cut > 0 && !excerpt.is_char_boundary(cut) {
                cut -= 1;
            }
            excerpt.truncate(cut);
        }
        if excerpt.trim().is_empty() {
            return Err(EngineError::BadResponse("page had no visible text".into()));
        }

        let content_hash = {
            let mut hasher = Sha256::new();
            hasher.update(excerpt.as_bytes());
            format!("{:x}", hasher.finalize())
        };
        let cache_key = format!("page-summary:{content_hash}");
        self.cache
            .get_or_produce(Purpose::Model, &cache_key, cancel, || async move {
                let req = CompletionRequest {
                    agent_id: "researcher".into(),
                    model: model_id.to_string(),
                    system: SUMMARY_PROMPT.to_string(),
                    messages: vec![ChatMessage::new("user", excerpt.clone())],
                    temperature: 0.2,
                    max_tokens: 400,
                    timeout: deadline.clamp(Duration::from_secs(30)),
                };
                let completion = self.model.complete(requester, &req, cancel, deadline).await?;
                Ok(completion.text)
            })
            .await
    }
}

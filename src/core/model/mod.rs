//! Typed path to the external model provider: cache lookup, limiter gates,
//! per-attempt timeout, retry ladder, token accounting. Every model call in
//! the engine goes through `ModelClient::complete`.

pub mod provider;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::core::cache::{ArtifactCache, Purpose, fingerprint};
use crate::core::compact;
use crate::core::limiter::Limiter;
use crate::core::signal::{CancelSignal, Deadline};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub estimated: bool,
}

/// Raw reply from a provider, before shape checks.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn complete(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<ProviderReply>;
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Agent on whose behalf the call runs; part of the cache fingerprint.
    pub agent_id: String,
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Per-attempt provider timeout.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(4)];
const FINAL_RETRY_DELAY: Duration = Duration::from_secs(12);
const MAX_ATTEMPTS: usize = 3;

pub struct ModelClient {
    provider: Arc<dyn ModelProvider>,
    cache: Arc<ArtifactCache>,
    limiter: Arc<Limiter>,
}

impl ModelClient {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        cache: Arc<ArtifactCache>,
        limiter: Arc<Limiter>,
    ) -> Self {
        Self {
            provider,
            cache,
            limiter,
        }
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    /// Complete a request. Identical requests coalesce in the cache layer,
    /// so a burst of equal prompts costs one provider call.
    pub async fn complete(
        &self,
        requester: &str,
        req: &CompletionRequest,
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<Completion> {
        let key = fingerprint(
            Purpose::Model,
            &req.agent_id,
            &json!({
                "system": req.system,
                "messages": req.messages,
                "temperature": req.temperature,
                "max_tokens": req.max_tokens,
            }),
            &req.model,
        );

        let requester = requester.to_string();
        let serialized = self
            .cache
            .get_or_produce(Purpose::Model, &key, cancel, || async move {
                let completion = self
                    .call_with_retry(&requester, req, cancel, deadline)
                    .await?;
                Ok(serde_json::to_string(&completion)?)
            })
            .await?;
        Ok(serde_json::from_str(&serialized)?)
    }

    async fn call_with_retry(
        &self,
        requester: &str,
        req: &CompletionRequest,
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<Completion> {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);
        if !req.system.is_empty() {
            messages.push(ChatMessage::new("system", req.system.clone()));
        }
        messages.extend(req.messages.iter().cloned());

        let mut last_err = EngineError::Timeout;
        for attempt in 0..MAX_ATTEMPTS {
            cancel.check()?;
            deadline.check()?;

            let permit = self
                .limiter
                .acquire_model(requester, &req.model, deadline, cancel)
                .await?;

            let timeout = deadline.clamp(req.timeout);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(EngineError::Cancelled),
                reply = self.provider.complete(
                    &req.model,
                    &messages,
                    req.temperature,
                    req.max_tokens,
                    timeout,
                ) => reply,
            };
            drop(permit);

            match outcome {
                Ok(reply) => {
                    if reply.text.trim().is_empty() {
                        return Err(EngineError::BadResponse("empty completion".into()));
                    }
                    let usage = reply
                        .usage
                        .unwrap_or_else(|| estimate_usage(&messages, &reply.text));
                    info!(
                        model = %req.model,
                        agent = %req.agent_id,
                        tokens = usage.total_tokens,
                        estimated = usage.estimated,
                        "model call complete"
                    );
                    return Ok(Completion {
                        text: reply.text,
                        model: req.model.clone(),
                        usage,
                    });
                }
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    // The call never produced a response; give the bucket
                    // token back before waiting out the ladder.
                    self.limiter.refund_bucket_token(&req.model).await;
                    let delay = *RETRY_DELAYS.get(attempt).unwrap_or(&FINAL_RETRY_DELAY);
                    warn!(
                        model = %req.model,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs(),
                        "transient model failure: {e}"
                    );
                    if delay >= deadline.remaining() {
                        return Err(e);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

/// Character-based fallback when the provider reports no usage.
fn estimate_usage(messages: &[ChatMessage], response_text: &str) -> TokenUsage {
    let input: usize = messages.iter().map(|m| compact::estimate_tokens(&m.content)).sum();
    let output = compact::estimate_tokens(response_text);
    TokenUsage {
        input_tokens: input as u64,
        output_tokens: output as u64,
        total_tokens: (input + output) as u64,
        estimated: true,
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted provider for unit and integration tests.

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Responds from a script: each rule maps a substring of the last user
    /// message to a canned reply. Unmatched prompts get the default reply.
    pub struct ScriptedProvider {
        pub rules: Mutex<Vec<(String, String)>>,
        pub default_reply: String,
        pub calls: AtomicUsize,
        pub failures_before_success: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn new(default_reply: &str) -> Self {
            Self {
                rules: Mutex::new(Vec::new()),
                default_reply: default_reply.to_string(),
                calls: AtomicUsize::new(0),
                failures_before_success: AtomicUsize::new(0),
            }
        }

        pub fn rule(self, needle: &str, reply: &str) -> Self {
            self.rules
                .lock()
                .unwrap()
                .push((needle.to_string(), reply.to_string()));
            self
        }

        pub fn fail_first(self, n: usize) -> Self {
            self.failures_before_success.store(n, Ordering::SeqCst);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        fn provider_id(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            model_id: &str,
            messages: &[ChatMessage],
            _temperature: f64,
            _max_tokens: u32,
            _timeout: Duration,
        ) -> Result<ProviderReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_before_success.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_before_success
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::Provider("scripted 503".into()));
            }
            let haystack = messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let text = self
                .rules
                .lock()
                .unwrap()
                .iter()
                .find(|(needle, _)| haystack.contains(needle))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_else(|| self.default_reply.clone());
            let _ = model_id;
            Ok(ProviderReply { text, usage: None })
        }
    }
}

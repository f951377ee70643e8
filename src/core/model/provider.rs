//! Chat-completions HTTP provider. The wire format is the OpenAI-style
//! `/chat/completions` shape the routing gateway exposes; `content` may
//! come back as a plain string or a list of text parts.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Duration;
use tracing::{error, info};

use super::{ChatMessage, ModelProvider, ProviderReply, TokenUsage};
use crate::error::{EngineError, Result};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Value,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

pub struct HttpModelProvider {
    base_url: String,
    api_key: String,
    client: Client,
}

impl HttpModelProvider {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client: Client::new(),
        }
    }
}

/// Flatten a `content` field that may be a string or a list of
/// `{type, text}` parts.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part {
                Value::String(s) => s.clone(),
                Value::Object(o) => o
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

#[async_trait]
impl ModelProvider for HttpModelProvider {
    fn provider_id(&self) -> &str {
        "chat_completions"
    }

    async fn complete(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<ProviderReply> {
        let wire_messages: Vec<WireMessage> = messages
            .iter()
            .map(|m| WireMessage {
                role: &m.role,
                content: &m.content,
            })
            .collect();
        let req = ChatRequest {
            model: model_id,
            messages: wire_messages,
            temperature,
            max_tokens,
        };

        info!(model = model_id, "calling model provider");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", "https://crewd.app")
            .header("X-Title", "crewd")
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout
                } else {
                    EngineError::Provider(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, "provider returned error: {body}");
            // 5xx and 429 are retryable upstream weather; other 4xx means
            // the request itself is unacceptable.
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(EngineError::Provider(format!("{status}: {body}")));
            }
            return Err(EngineError::BadResponse(format!(
                "provider rejected request ({status}): {body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::BadResponse(format!("unparseable provider body: {e}")))?;

        let text = parsed
            .choices
            .first()
            .map(|c| content_text(&c.message.content))
            .unwrap_or_default();

        let usage = parsed.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: if u.total_tokens > 0 {
                u.total_tokens
            } else {
                u.prompt_tokens + u.completion_tokens
            },
            estimated: false,
        });

        Ok(ProviderReply { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_text_handles_plain_string() {
        assert_eq!(content_text(&json!("hello")), "hello");
    }

    #[test]
    fn content_text_joins_text_parts() {
        let content = json!([
            {"type": "text", "text": "first"},
            {"type": "text", "text": "second"},
        ]);
        assert_eq!(content_text(&content), "first second");
    }

    #[test]
    fn content_text_tolerates_mixed_and_missing_parts() {
        let content = json!(["raw", {"no_text": true}, {"text": "ok"}]);
        assert_eq!(content_text(&content), "raw  ok");
        assert_eq!(content_text(&json!(null)), "");
        assert_eq!(content_text(&json!(42)), "");
    }
}

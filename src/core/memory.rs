//! Append-only per-conversation message log with bounded-window retrieval.
//! Appends within one conversation are totally ordered behind a
//! per-conversation mutex; conversations are independent of each other.
//!
//! The log itself is never rewritten. When a window outgrows the token
//! budget, the oldest part is compressed into a synthesised "so far"
//! system message through the model client; the summary shapes the
//! retrieval view and is cached so repeat reads cost nothing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::core::cache::Purpose;
use crate::core::compact::estimate_tokens;
use crate::core::model::{ChatMessage, CompletionRequest, ModelClient};
use crate::core::signal::{CancelSignal, Deadline};
use crate::core::store::{ConversationMessage, Role, Store};
use crate::error::Result;

/// How far back a retrieval window reaches before compression kicks in.
const WINDOW_FETCH: usize = 40;

const COMPRESSION_PROMPT: &str = "Compress the following conversation excerpt into a short \
    'conversation so far' briefing. Keep every concrete fact, number, name, and decision; \
    drop pleasantries and repetition. Write 3 to 8 sentences.";

pub struct MemoryLog {
    store: Arc<dyn Store>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    recent_verbatim: usize,
    token_budget: usize,
}

impl MemoryLog {
    pub fn new(store: Arc<dyn Store>, recent_verbatim: usize, token_budget: usize) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            recent_verbatim: recent_verbatim.max(1),
            token_budget: token_budget.max(1),
        }
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append one message; returns its sequence number.
    pub async fn append(
        &self,
        conversation_id: &str,
        role: Role,
        speaker: Option<&str>,
        content: &str,
    ) -> Result<i64> {
        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;
        self.store
            .append_message(conversation_id, role, speaker, content)
            .await
    }

    /// Most recent `n` messages in sequence order.
    pub async fn recent(&self, conversation_id: &str, n: usize) -> Result<Vec<ConversationMessage>> {
        self.store.recent_messages(conversation_id, n).await
    }

    /// Bounded retrieval view for prompt building. Under the budget the
    /// window comes back verbatim; over it, everything except the newest
    /// `recent_verbatim` messages is replaced by one synthesised summary.
    pub async fn summarise_if_over(
        &self,
        conversation_id: &str,
        model: &ModelClient,
        summary_model: &str,
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<Vec<ConversationMessage>> {
        let window = self.store.recent_messages(conversation_id, WINDOW_FETCH).await?;
        let total_tokens: usize = window.iter().map(|m| estimate_tokens(&m.content)).sum();
        if total_tokens <= self.token_budget || window.len() <= self.recent_verbatim {
            return Ok(window);
        }

        let split = window.len() - self.recent_verbatim;
        let (older, recent) = window.split_at(split);
        let last_old_seq = older.last().map(|m| m.seq).unwrap_or(0);

        let cache_key = format!("summary:{conversation_id}:{last_old_seq}");
        let transcript = render_transcript(older);
        let summary = model
            .cache()
            .get_or_produce(Purpose::Model, &cache_key, cancel, || async move {
                info!(
                    conversation = conversation_id,
                    compressed = older.len(),
                    "compressing conversation history"
                );
                let req = CompletionRequest {
                    agent_id: "memory".into(),
                    model: summary_model.to_string(),
                    system: COMPRESSION_PROMPT.to_string(),
                    messages: vec![ChatMessage::new("user", transcript.clone())],
                    temperature: 0.2,
                    max_tokens: 512,
                    timeout: deadline.clamp(std::time::Duration::from_secs(30)),
                };
                let completion = model.complete("memory", &req, cancel, deadline).await?;
                Ok(completion.text)
            })
            .await?;

        let mut view = Vec::with_capacity(recent.len() + 1);
        view.push(ConversationMessage {
            conversation_id: conversation_id.to_string(),
            seq: 0,
            role: Role::System,
            speaker: None,
            content: format!("Conversation so far: {summary}"),
            created_at: older.last().map(|m| m.created_at).unwrap_or(0),
        });
        view.extend(recent.iter().cloned());
        Ok(view)
    }
}

fn render_transcript(messages: &[ConversationMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        let label = match (&m.speaker, m.role) {
            (Some(agent), _) => agent.clone(),
            (None, role) => role.as_str().to_uppercase(),
        };
        out.push_str(&format!("{label}: {}\n", m.content));
    }
    out
}

/// Map stored messages to chat messages for a prompt.
pub fn to_chat_messages(messages: &[ConversationMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| ChatMessage::new(m.role.as_str(), m.content.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::ArtifactCache;
    use crate::core::limiter::Limiter;
    use crate::core::model::testing::ScriptedProvider;
    use crate::core::store::SqliteStore;
    use std::time::Duration;

    fn fixtures() -> (Arc<SqliteStore>, MemoryLog, ModelClient) {
        let store = Arc::new(SqliteStore::open(":memory:").unwrap());
        let memory = MemoryLog::new(store.clone(), 3, 50);
        let cache = Arc::new(ArtifactCache::new(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        ));
        let limiter = Arc::new(Limiter::new(4, 4, 100.0, 10.0));
        let model = ModelClient::new(
            Arc::new(ScriptedProvider::new("the gist of it all")),
            cache,
            limiter,
        );
        (store, memory, model)
    }

    #[tokio::test]
    async fn appends_are_strictly_ordered_within_a_conversation() {
        let (_, memory, _) = fixtures();
        let mut last = 0;
        for i in 0..10 {
            let seq = memory
                .append("c1", Role::User, None, &format!("message {i}"))
                .await
                .unwrap();
            assert_eq!(seq, last + 1, "no gaps, no reorderings");
            last = seq;
        }
    }

    #[tokio::test]
    async fn concurrent_appends_keep_dense_sequence() {
        let (_, memory, _) = fixtures();
        let memory = Arc::new(memory);
        let mut handles = Vec::new();
        for i in 0..20 {
            let memory = memory.clone();
            handles.push(tokio::spawn(async move {
                memory
                    .append("busy", Role::User, None, &format!("m{i}"))
                    .await
                    .unwrap()
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn under_budget_window_is_returned_verbatim() {
        let (_, memory, model) = fixtures();
        memory.append("c1", Role::User, None, "short").await.unwrap();
        memory
            .append("c1", Role::Assistant, Some("assistant"), "reply")
            .await
            .unwrap();
        let view = memory
            .summarise_if_over(
                "c1",
                &model,
                "test-model",
                &CancelSignal::never(),
                Deadline::from_now(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].content, "short");
    }

    #[tokio::test]
    async fn over_budget_window_compresses_all_but_recent() {
        let (_, memory, model) = fixtures();
        for i in 0..8 {
            memory
                .append(
                    "c1",
                    Role::User,
                    None,
                    &format!("a long enough message number {i} with plenty of text in it"),
                )
                .await
                .unwrap();
        }
        let view = memory
            .summarise_if_over(
                "c1",
                &model,
                "test-model",
                &CancelSignal::never(),
                Deadline::from_now(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        // Summary + the 3 newest verbatim.
        assert_eq!(view.len(), 4);
        assert_eq!(view[0].role, Role::System);
        assert!(view[0].content.starts_with("Conversation so far:"));
        assert!(view[0].content.contains("the gist of it all"));
        assert!(view[3].content.contains("number 7"));
    }

    #[tokio::test]
    async fn transcript_labels_speakers() {
        let messages = vec![
            ConversationMessage {
                conversation_id: "c".into(),
                seq: 1,
                role: Role::User,
                speaker: None,
                content: "hi".into(),
                created_at: 0,
            },
            ConversationMessage {
                conversation_id: "c".into(),
                seq: 2,
                role: Role::Assistant,
                speaker: Some("engineer".into()),
                content: "hello".into(),
                created_at: 0,
            },
        ];
        let t = render_transcript(&messages);
        assert!(t.contains("USER: hi"));
        assert!(t.contains("engineer: hello"));
    }
}

//! Abstract persistence boundary. The engine only ever talks to `Store`;
//! the sqlite implementation below is the in-process default.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::orchestrator::types::{Task, TaskState};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConversationMessage {
    pub conversation_id: String,
    pub seq: i64,
    pub role: Role,
    pub speaker: Option<String>,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WebhookAuditEntry {
    pub endpoint: String,
    pub external_id: String,
    pub signature_valid: bool,
    pub headers: Value,
    pub received_at: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ── tasks ──
    async fn insert_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<Task>;

    /// Compare-and-set the task state. Terminal states are frozen: a CAS
    /// away from one always reports false. `lease_until` replaces the
    /// current lease when given.
    async fn cas_task_state(
        &self,
        id: &str,
        from: TaskState,
        to: TaskState,
        lease_until: Option<i64>,
    ) -> Result<bool>;

    /// Write output-or-error and the completion timestamp. Exactly one of
    /// `output`/`error` is set by callers moving a task to a terminal
    /// state; a task that already reached one is left untouched, so a
    /// stale worker cannot rewrite history.
    async fn set_task_output(
        &self,
        id: &str,
        output: Option<&str>,
        error: Option<&str>,
        completed_at: Option<i64>,
    ) -> Result<()>;

    async fn extend_task_lease(&self, id: &str, lease_until: i64) -> Result<()>;

    /// Live (non-terminal) task for a requester's idempotency key, if any.
    async fn find_live_task(&self, requester: &str, idempotency_key: &str)
    -> Result<Option<Task>>;

    async fn list_tasks_by_requester(&self, requester: &str, limit: usize) -> Result<Vec<Task>>;
    async fn children_of(&self, parent_id: &str) -> Result<Vec<Task>>;

    // ── conversation log ──

    /// Append a message; returns the per-conversation sequence number,
    /// strictly increasing with no gaps.
    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        speaker: Option<&str>,
        content: &str,
    ) -> Result<i64>;

    /// Most recent `n` messages in sequence order (oldest of the window
    /// first).
    async fn recent_messages(
        &self,
        conversation_id: &str,
        n: usize,
    ) -> Result<Vec<ConversationMessage>>;

    // ── webhook audit ──
    async fn insert_audit_entry(&self, entry: &WebhookAuditEntry) -> Result<()>;
    async fn lookup_audit_entry(
        &self,
        endpoint: &str,
        external_id: &str,
    ) -> Result<Option<WebhookAuditEntry>>;

    // ── opaque domain entities ──
    async fn insert_domain_entity(
        &self,
        kind: &str,
        requester_id: &str,
        payload: &Value,
    ) -> Result<String>;
}

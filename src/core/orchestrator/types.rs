use serde_json::Value;

use crate::core::signal::now_epoch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    AwaitingChild,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::AwaitingChild => "awaiting_child",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(TaskState::Queued),
            "running" => Some(TaskState::Running),
            "awaiting_child" => Some(TaskState::AwaitingChild),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            "cancelled" => Some(TaskState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// A unit of agent work. Owned by the store; workers hold a lease on it
/// while Running. Never mutated after reaching a terminal state.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Task {
    pub id: String,
    pub requester_id: String,
    pub agent_id: String,
    pub inputs: Value,
    pub state: TaskState,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub parent_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub conversation_id: Option<String>,
    pub lease_until: Option<i64>,
}

impl Task {
    pub fn new(requester_id: &str, agent_id: &str, inputs: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            requester_id: requester_id.to_string(),
            agent_id: agent_id.to_string(),
            inputs,
            state: TaskState::Queued,
            output: None,
            error: None,
            created_at: now_epoch(),
            completed_at: None,
            parent_id: None,
            idempotency_key: None,
            conversation_id: None,
            lease_until: None,
        }
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    AgentTask,
    Research,
    WebhookFollowUp,
    ScrapeFetch,
}

/// Queue payload pointing back at a task. `attempt` counts requeues; the
/// worker's retry ladder reads it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub task_id: String,
    pub payload: Value,
    pub attempt: u32,
}

impl Job {
    pub fn new(kind: JobKind, task_id: &str, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            task_id: task_id.to_string(),
            payload,
            attempt: 0,
        }
    }
}

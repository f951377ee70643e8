//! Task intake and lifecycle. The orchestrator persists intent, enqueues,
//! and returns a handle; it never calls the model itself, so every model
//! call in the system flows through the worker path with uniform limiting
//! and auditing.

pub mod types;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tokio::time::{Duration, sleep};
use tracing::info;

use crate::core::agents::{AgentRegistry, MULTI_AGENT};
use crate::core::queue::Queue;
use crate::core::signal::{CancelRegistry, now_epoch};
use crate::core::store::Store;
use crate::error::{EngineError, Result};
use types::{Job, JobKind, Task, TaskState};

/// Legal task-state transitions. Terminal states are frozen.
pub fn can_transition(from: TaskState, to: TaskState) -> bool {
    if from == to {
        return true;
    }
    match from {
        TaskState::Queued => matches!(to, TaskState::Running | TaskState::Cancelled),
        TaskState::Running => matches!(
            to,
            TaskState::AwaitingChild
                | TaskState::Queued
                | TaskState::Completed
                | TaskState::Failed
                | TaskState::Cancelled
        ),
        TaskState::AwaitingChild => matches!(
            to,
            TaskState::Running | TaskState::Failed | TaskState::Cancelled
        ),
        TaskState::Completed | TaskState::Failed | TaskState::Cancelled => false,
    }
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    registry: Arc<AgentRegistry>,
    cancellations: Arc<CancelRegistry>,
    accepting: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn Queue>,
        registry: Arc<AgentRegistry>,
        cancellations: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            cancellations,
            accepting: AtomicBool::new(true),
        }
    }

    /// Stop taking new work (shutdown path). In-flight tasks keep running.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    fn check_accepting(&self) -> Result<()> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Internal("engine is shutting down".into()))
        }
    }

    /// Persist a task in Queued and enqueue it. An idempotency-key hit on a
    /// live task returns the existing task; the same key with different
    /// inputs is a conflict.
    pub async fn submit(
        &self,
        requester_id: &str,
        agent_id: &str,
        inputs: Value,
        idempotency_key: Option<String>,
        conversation_id: Option<String>,
    ) -> Result<Task> {
        self.check_accepting()?;
        if requester_id.trim().is_empty() {
            return Err(EngineError::BadRequest("requester_id is required".into()));
        }
        self.registry.get(agent_id)?;

        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.store.find_live_task(requester_id, key).await? {
                if existing.inputs == inputs {
                    info!(task = %existing.id, key, "idempotent resubmit, returning live task");
                    return Ok(existing);
                }
                return Err(EngineError::Conflict(format!(
                    "idempotency key {key} is held by task {} with different inputs",
                    existing.id
                )));
            }
        }

        let task = Task::new(requester_id, agent_id, inputs)
            .with_idempotency_key(idempotency_key)
            .with_conversation(conversation_id);
        self.store.insert_task(&task).await?;
        self.queue
            .enqueue(Job::new(JobKind::AgentTask, &task.id, Value::Null))
            .await?;
        info!(task = %task.id, agent = agent_id, "task queued");
        Ok(task)
    }

    /// Free-text intake. Two or more explicit @mentions route through the
    /// multi-agent pseudo-agent in mention order; exactly one routes
    /// straight to that agent (consolidation reduces to identity); none
    /// falls back to the assistant.
    pub async fn submit_multi(
        &self,
        requester_id: &str,
        free_text: &str,
        conversation_id: Option<String>,
    ) -> Result<Task> {
        let mentions = self.registry.parse_mentions(free_text);
        match mentions.len() {
            0 => {
                self.submit(
                    requester_id,
                    "assistant",
                    json!({ "prompt": free_text }),
                    None,
                    conversation_id,
                )
                .await
            }
            1 => {
                self.submit(
                    requester_id,
                    &mentions[0],
                    json!({ "prompt": free_text }),
                    None,
                    conversation_id,
                )
                .await
            }
            _ => {
                self.submit(
                    requester_id,
                    MULTI_AGENT,
                    json!({ "prompt": free_text, "agents": mentions }),
                    None,
                    conversation_id,
                )
                .await
            }
        }
    }

    /// Queue a research run. Same lifecycle as an agent task, dispatched to
    /// the research pipeline by job kind.
    pub async fn research(
        &self,
        requester_id: &str,
        query: &str,
        max_results: Option<usize>,
        preferred_agent: Option<&str>,
    ) -> Result<Task> {
        self.check_accepting()?;
        if query.trim().is_empty() {
            return Err(EngineError::BadRequest("query is required".into()));
        }
        let synthesis_agent = match preferred_agent {
            Some(id) => {
                let record = self.registry.get(id)?;
                if !record.can_research {
                    return Err(EngineError::BadRequest(format!(
                        "agent {id} cannot run research"
                    )));
                }
                id
            }
            None => "assistant",
        };

        let task = Task::new(
            requester_id,
            synthesis_agent,
            json!({
                "query": query,
                "max_results": max_results,
            }),
        );
        self.store.insert_task(&task).await?;
        self.queue
            .enqueue(Job::new(JobKind::Research, &task.id, Value::Null))
            .await?;
        info!(task = %task.id, query, "research task queued");
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.store.get_task(task_id).await
    }

    /// Cancel a task. Queued tasks flip straight to Cancelled; running
    /// tasks get their signal fired and the worker finishes the
    /// transition at its next await point. Terminal tasks are returned
    /// unchanged.
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let task = self.store.get_task(task_id).await?;
        if task.state.is_terminal() {
            return Ok(task);
        }

        if task.state == TaskState::Queued {
            // Error record goes in while the task is still live; a worker
            // that wins the claim race overwrites it with a real outcome.
            let record = crate::core::agents::runner::error_record(&EngineError::Cancelled);
            self.store
                .set_task_output(task_id, None, Some(&record), Some(now_epoch()))
                .await?;
            let flipped = self
                .store
                .cas_task_state(task_id, TaskState::Queued, TaskState::Cancelled, None)
                .await?;
            if flipped {
                info!(task = task_id, "cancelled before claim");
                return self.store.get_task(task_id).await;
            }
        }

        // Already claimed (or lost the race): signal the worker.
        self.cancellations.cancel(task_id).await;
        info!(task = task_id, "cancellation signalled");
        self.store.get_task(task_id).await
    }

    /// Poll until the task reaches a terminal state or the window closes.
    /// Powers the synchronous HTTP fast-path.
    pub async fn wait(&self, task_id: &str, window: Duration) -> Result<Task> {
        let poll = Duration::from_millis(100);
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let task = self.store.get_task(task_id).await?;
            if task.state.is_terminal() {
                return Ok(task);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(task);
            }
            sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests;

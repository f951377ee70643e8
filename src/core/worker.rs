//! Worker pool: claim from the queue, win the task with a CAS, heartbeat
//! the lease, dispatch by job kind, and apply the retry ladder. Cancelled
//! tasks abort at the next await point and release their lease.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::core::agents::runner::error_record;
use crate::core::engine::Engine;
use crate::core::orchestrator::types::{Job, JobKind, Task, TaskState};
use crate::core::signal::{CancelSignal, Deadline, now_epoch};
use crate::core::webhooks;
use crate::error::{EngineError, Result};

/// Extra attempts after the first, with their requeue delays.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(8),
    Duration::from_secs(20),
];

pub struct WorkerPool;

impl WorkerPool {
    pub fn start(engine: Arc<Engine>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|idx| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    worker_loop(engine, idx).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(engine: Arc<Engine>, idx: usize) {
    info!(worker = idx, "worker started");
    loop {
        if engine.is_shutting_down() {
            break;
        }
        match engine.queue.claim(engine.settings.queue_poll_timeout).await {
            Ok(Some(job)) => {
                if let Err(e) = process_job(&engine, job).await {
                    error!(worker = idx, "job processing error: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(worker = idx, "queue claim failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    info!(worker = idx, "worker stopped");
}

async fn process_job(engine: &Arc<Engine>, job: Job) -> Result<()> {
    let task = match engine.store.get_task(&job.task_id).await {
        Ok(task) => task,
        Err(EngineError::NotFound(_)) => {
            engine.queue.ack(&job.id).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if task.state.is_terminal() {
        engine.queue.ack(&job.id).await?;
        return Ok(());
    }

    // A Running task whose lease lapsed belongs to a crashed worker; put it
    // back in Queued so this redelivery can claim it.
    if task.state == TaskState::Running
        && task.lease_until.is_some_and(|lease| lease < now_epoch())
    {
        warn!(task = %task.id, "expired lease, reclaiming task");
        engine
            .store
            .cas_task_state(&task.id, TaskState::Running, TaskState::Queued, None)
            .await?;
    }

    let lease_until = now_epoch() + engine.settings.lease_ttl.as_secs() as i64;
    let claimed = engine
        .store
        .cas_task_state(&task.id, TaskState::Queued, TaskState::Running, Some(lease_until))
        .await?;
    if !claimed {
        // Another worker won the claim, or the task was cancelled before
        // we got here.
        engine.queue.ack(&job.id).await?;
        return Ok(());
    }

    let cancel = engine.cancellations.register(&task.id).await;
    let heartbeat = spawn_heartbeat(engine.clone(), task.id.clone(), job.id.clone());

    let deadline = match job.kind {
        JobKind::Research => Deadline::from_now(engine.settings.research_deadline),
        _ => Deadline::from_now(engine.settings.agent_deadline),
    };
    let outcome = dispatch(engine, &job, &task, &cancel, deadline).await;

    heartbeat.abort();
    engine.cancellations.remove(&task.id).await;
    settle(engine, &job, &task, outcome).await
}

fn spawn_heartbeat(engine: Arc<Engine>, task_id: String, job_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = engine.settings.heartbeat_interval;
        let lease_ttl = engine.settings.lease_ttl;
        loop {
            tokio::time::sleep(interval).await;
            let lease_until = now_epoch() + lease_ttl.as_secs() as i64;
            if let Err(e) = engine.store.extend_task_lease(&task_id, lease_until).await {
                warn!(task = %task_id, "lease extension failed: {e}");
            }
            let _ = engine.queue.extend_lease(&job_id, lease_ttl).await;
        }
    })
}

async fn dispatch(
    engine: &Arc<Engine>,
    job: &Job,
    task: &Task,
    cancel: &CancelSignal,
    deadline: Deadline,
) -> Result<String> {
    match job.kind {
        JobKind::AgentTask => {
            let outcome = engine.runner.run_task(task, cancel, deadline).await?;
            Ok(serde_json::to_string(&outcome)?)
        }
        JobKind::Research => {
            let query = task
                .inputs
                .get("query")
                .and_then(|q| q.as_str())
                .ok_or_else(|| EngineError::BadRequest("research task has no query".into()))?;
            let max_results = task
                .inputs
                .get("max_results")
                .and_then(|m| m.as_u64())
                .map(|m| m as usize);
            let outcome = engine
                .researcher
                .run(
                    &task.requester_id,
                    query,
                    max_results,
                    engine.settings.model_for(&task.agent_id),
                    cancel,
                    deadline,
                )
                .await?;
            Ok(serde_json::to_string(&outcome)?)
        }
        JobKind::WebhookFollowUp => {
            webhooks::handle_follow_up(&engine.store, &engine.orchestrator, &job.payload).await
        }
        JobKind::ScrapeFetch => {
            let url = job
                .payload
                .get("url")
                .and_then(|u| u.as_str())
                .ok_or_else(|| EngineError::BadRequest("scrape job has no url".into()))?;
            let page = engine.fetcher.fetch_clean(url, cancel, deadline).await?;
            engine
                .store
                .insert_domain_entity(
                    "scrape",
                    &task.requester_id,
                    &json!({ "url": page.url, "status": "completed", "content_bytes": page.text.len() }),
                )
                .await?;
            Ok(format!("fetched {} ({} chars)", page.url, page.text.len()))
        }
    }
}

/// Write the terminal (or requeued) state for a finished dispatch.
async fn settle(
    engine: &Arc<Engine>,
    job: &Job,
    task: &Task,
    outcome: Result<String>,
) -> Result<()> {
    match outcome {
        Ok(output) => {
            engine
                .store
                .set_task_output(&task.id, Some(&output), None, Some(now_epoch()))
                .await?;
            engine
                .store
                .cas_task_state(&task.id, TaskState::Running, TaskState::Completed, None)
                .await?;
            engine.queue.ack(&job.id).await?;
            info!(task = %task.id, kind = ?job.kind, "task completed");
        }
        Err(EngineError::Cancelled) => {
            engine
                .store
                .set_task_output(
                    &task.id,
                    None,
                    Some(&error_record(&EngineError::Cancelled)),
                    Some(now_epoch()),
                )
                .await?;
            // The runner may have been interrupted while awaiting a child.
            let flipped = engine
                .store
                .cas_task_state(&task.id, TaskState::Running, TaskState::Cancelled, None)
                .await?;
            if !flipped {
                engine
                    .store
                    .cas_task_state(&task.id, TaskState::AwaitingChild, TaskState::Cancelled, None)
                    .await?;
            }
            engine.queue.ack(&job.id).await?;
            info!(task = %task.id, "task cancelled");
        }
        Err(e) if e.is_transient() && (job.attempt as usize) < RETRY_DELAYS.len() => {
            let delay = RETRY_DELAYS[job.attempt as usize];
            warn!(
                task = %task.id,
                attempt = job.attempt + 1,
                delay_secs = delay.as_secs(),
                "transient failure, requeueing: {e}"
            );
            engine
                .store
                .cas_task_state(&task.id, TaskState::Running, TaskState::Queued, None)
                .await?;
            engine.queue.nack(&job.id, delay).await?;
        }
        Err(e) => {
            engine
                .store
                .set_task_output(&task.id, None, Some(&error_record(&e)), Some(now_epoch()))
                .await?;
            engine
                .store
                .cas_task_state(&task.id, TaskState::Running, TaskState::Failed, None)
                .await?;
            engine.queue.ack(&job.id).await?;
            warn!(task = %task.id, "task failed: {e}");
        }
    }
    Ok(())
}

//! Abstract job queue with lease semantics, mirroring the list-based queue
//! the engine is deployed against: enqueue, blocking claim, lease
//! extension, ack, and delayed nack. The in-memory implementation backs
//! single-process deployments and every test.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::core::orchestrator::types::Job;
use crate::error::{EngineError, Result};

#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Claim the next ready job, waiting up to `timeout`. A claimed job is
    /// leased to the caller; an unacked lease that expires puts the job
    /// back on the ready list.
    async fn claim(&self, timeout: Duration) -> Result<Option<Job>>;

    async fn extend_lease(&self, job_id: &str, ttl: Duration) -> Result<()>;
    async fn ack(&self, job_id: &str) -> Result<()>;

    /// Return a claimed job to the queue after `delay`, with its attempt
    /// counter bumped.
    async fn nack(&self, job_id: &str, delay: Duration) -> Result<()>;
}

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

struct QueueInner {
    ready: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    leased: HashMap<String, (Instant, Job)>,
    closed: bool,
}

pub struct InMemoryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                ready: VecDeque::new(),
                delayed: Vec::new(),
                leased: HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Stop handing out jobs; claimers drain out with `None`.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Move due delayed jobs and expired leases back to ready. Returns the
    /// next instant anything becomes due, if any.
    fn promote(inner: &mut QueueInner) -> Option<Instant> {
        let now = Instant::now();
        let mut next_due: Option<Instant> = None;

        let mut still_delayed = Vec::new();
        for (due, job) in inner.delayed.drain(..) {
            if due <= now {
                inner.ready.push_back(job);
            } else {
                next_due = Some(next_due.map_or(due, |d: Instant| d.min(due)));
                still_delayed.push((due, job));
            }
        }
        inner.delayed = still_delayed;

        let expired: Vec<String> = inner
            .leased
            .iter()
            .filter(|(_, (lease, _))| *lease <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((_, job)) = inner.leased.remove(&id) {
                debug!(job_id = %id, "queue lease expired, job requeued");
                inner.ready.push_back(job);
            }
        }
        for (lease, _) in inner.leased.values() {
            next_due = Some(next_due.map_or(*lease, |d: Instant| d.min(*lease)));
        }

        next_due
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(EngineError::Internal("queue closed".into()));
        }
        inner.ready.push_back(job);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn claim(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + timeout;
        loop {
            let next_due = {
                let mut inner = self.inner.lock().await;
                let next_due = Self::promote(&mut inner);
                if let Some(job) = inner.ready.pop_front() {
                    inner
                        .leased
                        .insert(job.id.clone(), (Instant::now() + DEFAULT_LEASE, job.clone()));
                    return Ok(Some(job));
                }
                if inner.closed {
                    return Ok(None);
                }
                next_due
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wait = deadline - now;
            if let Some(due) = next_due {
                wait = wait.min(due.saturating_duration_since(now).max(Duration::from_millis(1)));
            }
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn extend_lease(&self, job_id: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some((lease, _)) = inner.leased.get_mut(job_id) {
            *lease = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn ack(&self, job_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.leased.remove(job_id);
        Ok(())
    }

    async fn nack(&self, job_id: &str, delay: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some((_, mut job)) = inner.leased.remove(job_id) {
            job.attempt += 1;
            inner.delayed.push((Instant::now() + delay, job));
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::orchestrator::types::JobKind;
    use serde_json::json;

    fn job(task: &str) -> Job {
        Job::new(JobKind::AgentTask, task, json!({}))
    }

    #[tokio::test]
    async fn enqueue_then_claim_in_fifo_order() {
        let q = InMemoryQueue::new();
        q.enqueue(job("t1")).await.unwrap();
        q.enqueue(job("t2")).await.unwrap();
        let first = q.claim(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = q.claim(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.task_id, "t1");
        assert_eq!(second.task_id, "t2");
    }

    #[tokio::test]
    async fn claim_times_out_on_empty_queue() {
        let q = InMemoryQueue::new();
        let got = q.claim(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn claim_wakes_on_enqueue() {
        let q = InMemoryQueue::new();
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.claim(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.enqueue(job("t1")).await.unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.unwrap().task_id, "t1");
    }

    #[tokio::test]
    async fn acked_job_never_returns() {
        let q = InMemoryQueue::new();
        q.enqueue(job("t1")).await.unwrap();
        let claimed = q.claim(Duration::from_millis(10)).await.unwrap().unwrap();
        q.ack(&claimed.id).await.unwrap();
        assert!(q.claim(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn nack_delays_and_bumps_attempt() {
        let q = InMemoryQueue::new();
        q.enqueue(job("t1")).await.unwrap();
        let claimed = q.claim(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 0);
        q.nack(&claimed.id, Duration::from_secs(8)).await.unwrap();

        // Not yet due.
        assert!(q.claim(Duration::from_millis(10)).await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(9)).await;
        let retried = q.claim(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(retried.task_id, "t1");
        assert_eq!(retried.attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_requeues_job() {
        let q = InMemoryQueue::new();
        q.enqueue(job("t1")).await.unwrap();
        let _claimed = q.claim(Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::advance(DEFAULT_LEASE + Duration::from_secs(1)).await;
        let reclaimed = q.claim(Duration::from_millis(10)).await.unwrap();
        assert!(reclaimed.is_some(), "expired lease must requeue the job");
    }

    #[tokio::test(start_paused = true)]
    async fn extended_lease_holds_the_job() {
        let q = InMemoryQueue::new();
        q.enqueue(job("t1")).await.unwrap();
        let claimed = q.claim(Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        q.extend_lease(&claimed.id, Duration::from_secs(30)).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(q.claim(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_queue_rejects_enqueue_and_drains_claimers() {
        let q = InMemoryQueue::new();
        q.close().await;
        assert!(q.enqueue(job("t1")).await.is_err());
        assert!(q.claim(Duration::from_secs(5)).await.unwrap().is_none());
    }
}

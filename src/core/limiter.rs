//! Concurrency and rate gates consulted before every outbound side effect:
//! a process-wide model-call gate, a per-requester gate, a per-model token
//! bucket, and the per-domain scrape backoff table. Contention surfaces as
//! `Throttled { retry_after }` once the caller's deadline runs out.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::signal::{CancelSignal, Deadline};
use crate::error::{EngineError, Result};

const BACKOFF_START: Duration = Duration::from_secs(60);
const BACKOFF_CAP: Duration = Duration::from_secs(3600);
const ROBOTS_BLOCK: Duration = Duration::from_secs(86_400);

/// Both gate permits for one model call. Dropping releases the slots.
pub struct ModelPermit {
    _global: OwnedSemaphorePermit,
    _requester: OwnedSemaphorePermit,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

struct DomainState {
    earliest_next_fetch: Instant,
    backoff: Duration,
    consecutive_failures: u32,
    last_failure: Option<String>,
    gate: Arc<Semaphore>,
}

impl DomainState {
    fn new() -> Self {
        Self {
            earliest_next_fetch: Instant::now(),
            backoff: Duration::ZERO,
            consecutive_failures: 0,
            last_failure: None,
            gate: Arc::new(Semaphore::new(1)),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum FetchDecision {
    Allowed,
    RetryAfter(Duration),
}

pub struct Limiter {
    global: Arc<Semaphore>,
    requesters: Mutex<HashMap<String, Arc<Semaphore>>>,
    k_user: usize,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    bucket_capacity: f64,
    bucket_refill_per_sec: f64,
    domains: Mutex<HashMap<String, DomainState>>,
}

impl Limiter {
    pub fn new(
        k_global: usize,
        k_user: usize,
        bucket_capacity: f64,
        bucket_refill_per_sec: f64,
    ) -> Self {
        Self {
            global: Arc::new(Semaphore::new(k_global.max(1))),
            requesters: Mutex::new(HashMap::new()),
            k_user: k_user.max(1),
            buckets: Mutex::new(HashMap::new()),
            bucket_capacity: bucket_capacity.max(1.0),
            bucket_refill_per_sec: bucket_refill_per_sec.max(f64::MIN_POSITIVE),
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire all model-call gates: global slot, requester slot, one bucket
    /// token for the model. Waits FIFO up to the deadline, observing the
    /// cancellation signal.
    pub async fn acquire_model(
        &self,
        requester: &str,
        model: &str,
        deadline: Deadline,
        cancel: &CancelSignal,
    ) -> Result<ModelPermit> {
        let global = self
            .acquire_permit(self.global.clone(), deadline, cancel)
            .await?;
        let requester_gate = {
            let mut requesters = self.requesters.lock().await;
            requesters
                .entry(requester.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.k_user)))
                .clone()
        };
        let requester_permit = self.acquire_permit(requester_gate, deadline, cancel).await?;
        self.take_bucket_token(model, deadline, cancel).await?;
        Ok(ModelPermit {
            _global: global,
            _requester: requester_permit,
        })
    }

    async fn acquire_permit(
        &self,
        gate: Arc<Semaphore>,
        deadline: Deadline,
        cancel: &CancelSignal,
    ) -> Result<OwnedSemaphorePermit> {
        cancel.check()?;
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            acquired = tokio::time::timeout(deadline.remaining(), gate.acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(EngineError::Internal("limiter gate closed".into())),
                    Err(_) => {
                        warn!("model gate contention outlasted the caller deadline");
                        Err(EngineError::Throttled { retry_after: Duration::from_secs(1) })
                    }
                }
            }
        }
    }

    async fn take_bucket_token(
        &self,
        model: &str,
        deadline: Deadline,
        cancel: &CancelSignal,
    ) -> Result<()> {
        loop {
            cancel.check()?;
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets.entry(model.to_string()).or_insert(TokenBucket {
                    tokens: self.bucket_capacity,
                    last_refill: Instant::now(),
                });
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.bucket_refill_per_sec)
                    .min(self.bucket_capacity);
                bucket.last_refill = Instant::now();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - bucket.tokens) / self.bucket_refill_per_sec,
                    ))
                }
            };
            let Some(wait) = wait else { return Ok(()) };
            if wait >= deadline.remaining() {
                return Err(EngineError::Throttled { retry_after: wait });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Return the pre-charged bucket token for a call that never reached the
    /// provider. The bucket pre-charges on acquire and is corrected here.
    pub async fn refund_bucket_token(&self, model: &str) {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(model) {
            bucket.tokens = (bucket.tokens + 1.0).min(self.bucket_capacity);
        }
    }

    // ── domain backoff ──

    pub async fn can_fetch(&self, domain: &str) -> FetchDecision {
        let mut domains = self.domains.lock().await;
        let state = domains
            .entry(domain.to_string())
            .or_insert_with(DomainState::new);
        let now = Instant::now();
        if state.earliest_next_fetch > now {
            FetchDecision::RetryAfter(state.earliest_next_fetch - now)
        } else {
            FetchDecision::Allowed
        }
    }

    /// One-at-a-time gate per domain, so backoff state settles between
    /// consecutive fetches.
    pub async fn domain_slot(&self, domain: &str) -> Arc<Semaphore> {
        let mut domains = self.domains.lock().await;
        domains
            .entry(domain.to_string())
            .or_insert_with(DomainState::new)
            .gate
            .clone()
    }

    pub async fn record_fetch_success(&self, domain: &str) {
        let mut domains = self.domains.lock().await;
        if let Some(state) = domains.get_mut(domain) {
            state.backoff = Duration::ZERO;
            state.consecutive_failures = 0;
            state.last_failure = None;
            state.earliest_next_fetch = Instant::now();
        }
    }

    pub async fn record_fetch_failure(&self, domain: &str, reason: &str) {
        let mut domains = self.domains.lock().await;
        let state = domains
            .entry(domain.to_string())
            .or_insert_with(DomainState::new);
        state.backoff = if state.backoff.is_zero() {
            BACKOFF_START
        } else {
            (state.backoff * 2).min(BACKOFF_CAP)
        };
        state.consecutive_failures += 1;
        state.last_failure = Some(reason.to_string());
        state.earliest_next_fetch = Instant::now() + state.backoff;
        debug!(
            domain,
            failures = state.consecutive_failures,
            backoff_secs = state.backoff.as_secs(),
            "domain backoff raised"
        );
    }

    /// Hard block from a robots.txt disallow, cached for 24h.
    pub async fn block_domain(&self, domain: &str) {
        let mut domains = self.domains.lock().await;
        let state = domains
            .entry(domain.to_string())
            .or_insert_with(DomainState::new);
        state.last_failure = Some("robots.txt disallow".to_string());
        state.earliest_next_fetch = Instant::now() + ROBOTS_BLOCK;
    }
}

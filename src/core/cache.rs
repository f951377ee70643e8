//! Content-keyed artifact cache: model completions, fetched pages, research
//! answers. Partitioned per purpose so purpose-specific TTLs apply.
//! Concurrent misses for one key coalesce into a single producer; the
//! waiters share the produced value, which is what keeps a burst of
//! identical requests from spending the model budget more than once.

use std::collections::HashMap;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, Instant};

use crate::core::compact;
use crate::core::signal::CancelSignal;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Model,
    Page,
    Research,
}

impl Purpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::Model => "model",
            Purpose::Page => "page",
            Purpose::Research => "research",
        }
    }

    fn index(self) -> usize {
        match self {
            Purpose::Model => 0,
            Purpose::Page => 1,
            Purpose::Research => 2,
        }
    }
}

struct Slot {
    value: String,
    expires_at: Instant,
}

type InflightResult = Option<std::result::Result<String, EngineError>>;

pub struct ArtifactCache {
    ttls: [Duration; 3],
    shards: [Mutex<HashMap<String, Slot>>; 3],
    inflight: Mutex<HashMap<String, watch::Receiver<InflightResult>>>,
}

impl ArtifactCache {
    pub fn new(model_ttl: Duration, page_ttl: Duration, research_ttl: Duration) -> Self {
        Self {
            ttls: [model_ttl, page_ttl, research_ttl],
            shards: [
                Mutex::new(HashMap::new()),
                Mutex::new(HashMap::new()),
                Mutex::new(HashMap::new()),
            ],
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, purpose: Purpose, key: &str) -> Option<String> {
        let mut shard = self.shards[purpose.index()].lock().await;
        match shard.get(key) {
            Some(slot) if slot.expires_at > Instant::now() => Some(slot.value.clone()),
            Some(_) => {
                // Lazy expiry on access.
                shard.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, purpose: Purpose, key: &str, value: String) {
        self.put_with_ttl(purpose, key, value, self.ttls[purpose.index()])
            .await;
    }

    pub async fn put_with_ttl(&self, purpose: Purpose, key: &str, value: String, ttl: Duration) {
        let mut shard = self.shards[purpose.index()].lock().await;
        shard.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn invalidate_prefix(&self, purpose: Purpose, prefix: &str) {
        let mut shard = self.shards[purpose.index()].lock().await;
        shard.retain(|k, _| !k.starts_with(prefix));
    }

    /// Eager sweep of expired entries; wired to a low-frequency timer by
    /// the engine.
    pub async fn sweep(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            shard.lock().await.retain(|_, slot| slot.expires_at > now);
        }
    }

    /// Single-flight lookup. Exactly one caller runs `producer` per missing
    /// key; everyone else waits for its outcome (value or error) without
    /// touching the producer themselves.
    pub async fn get_or_produce<F, Fut>(
        &self,
        purpose: Purpose,
        key: &str,
        cancel: &CancelSignal,
        producer: F,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        if let Some(hit) = self.get(purpose, key).await {
            return Ok(hit);
        }

        let flight_key = format!("{}:{}", purpose.as_str(), key);
        let tx = {
            let mut inflight = self.inflight.lock().await;
            if let Some(rx) = inflight.get(&flight_key) {
                let rx = rx.clone();
                drop(inflight);
                return self.wait_for_flight(rx, cancel).await;
            }
            let (tx, rx) = watch::channel(None);
            inflight.insert(flight_key.clone(), rx);
            tx
        };

        let result = producer().await;
        if let Ok(value) = &result {
            self.put(purpose, key, value.clone()).await;
        }
        let _ = tx.send(Some(result.clone()));
        self.inflight.lock().await.remove(&flight_key);
        result
    }

    async fn wait_for_flight(
        &self,
        mut rx: watch::Receiver<InflightResult>,
        cancel: &CancelSignal,
    ) -> Result<String> {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Producer dropped without reporting; treat as a miss
                        // the caller may retry.
                        return Err(EngineError::Internal("cache producer vanished".into()));
                    }
                }
            }
        }
    }
}

/// Deterministic cache key over (purpose, agent id, canonicalised inputs,
/// model id). Inputs are canonicalised by sorting mapping keys recursively
/// before encoding, so logically equal payloads fingerprint identically.
pub fn fingerprint(purpose: Purpose, agent_id: &str, inputs: &Value, model_id: &str) -> String {
    let canonical = compact::encode(&sort_keys(inputs)).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(purpose.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(agent_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hasher.update([0u8]);
    hasher.update(model_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for k in keys {
                sorted.insert(k.clone(), sort_keys(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> ArtifactCache {
        ArtifactCache::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn put_get_and_miss() {
        let c = cache();
        assert_eq!(c.get(Purpose::Model, "k").await, None);
        c.put(Purpose::Model, "k", "v".into()).await;
        assert_eq!(c.get(Purpose::Model, "k").await, Some("v".into()));
        // Purposes are separate partitions.
        assert_eq!(c.get(Purpose::Page, "k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_lazily_and_on_sweep() {
        let c = cache();
        c.put_with_ttl(Purpose::Page, "a", "1".into(), Duration::from_secs(10))
            .await;
        c.put_with_ttl(Purpose::Page, "b", "2".into(), Duration::from_secs(100))
            .await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(c.get(Purpose::Page, "a").await, None);
        c.sweep().await;
        assert_eq!(c.get(Purpose::Page, "b").await, Some("2".into()));
        assert!(c.shards[Purpose::Page.index()].lock().await.len() == 1);
    }

    #[tokio::test]
    async fn invalidate_prefix_drops_matching_keys() {
        let c = cache();
        c.put(Purpose::Research, "conv:1:a", "x".into()).await;
        c.put(Purpose::Research, "conv:1:b", "y".into()).await;
        c.put(Purpose::Research, "conv:2:a", "z".into()).await;
        c.invalidate_prefix(Purpose::Research, "conv:1:").await;
        assert_eq!(c.get(Purpose::Research, "conv:1:a").await, None);
        assert_eq!(c.get(Purpose::Research, "conv:2:a").await, Some("z".into()));
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_producer() {
        let c = Arc::new(cache());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = c.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                c.get_or_produce(Purpose::Model, "same-key", &CancelSignal::never(), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok("produced".to_string())
                })
                .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "produced");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn producer_failure_reaches_waiters() {
        let c = Arc::new(cache());
        let c2 = c.clone();
        let first = tokio::spawn(async move {
            c2.get_or_produce(Purpose::Model, "failing", &CancelSignal::never(), || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(EngineError::Provider("upstream down".into()))
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let waiter = c
            .get_or_produce(Purpose::Model, "failing", &CancelSignal::never(), || async move {
                panic!("waiter must not produce")
            })
            .await;
        assert!(matches!(waiter, Err(EngineError::Provider(_))));
        assert!(first.await.unwrap().is_err());
        // Failure is not cached; a later call may produce again.
        assert_eq!(c.get(Purpose::Model, "failing").await, None);
    }

    #[test]
    fn fingerprint_ignores_key_order_but_not_content() {
        let a = fingerprint(
            Purpose::Model,
            "engineer",
            &json!({"x": 1, "y": 2}),
            "model-a",
        );
        let b = fingerprint(
            Purpose::Model,
            "engineer",
            &json!({"y": 2, "x": 1}),
            "model-a",
        );
        let c = fingerprint(
            Purpose::Model,
            "engineer",
            &json!({"x": 1, "y": 3}),
            "model-a",
        );
        let d = fingerprint(
            Purpose::Model,
            "engineer",
            &json!({"x": 1, "y": 2}),
            "model-b",
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}

//! Cancellation signals and deadlines, passed by value down every call path.
//! Every outbound I/O accepts both; waits at limiter gates and cache
//! single-flight accept them too.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, Instant};

use crate::error::{EngineError, Result};

/// Sender half of a cancellation pair. Held by the worker (and the
/// cancellation registry) for the lifetime of a task.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiver half, cheap to clone and pass into sub-calls.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires, for call sites with no task context
    /// (startup probes, tests).
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open.
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation fires. Used in `select!` arms around
    /// outbound I/O.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling; never resolve.
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Absolute deadline carried from submit down to every sub-call. The first
/// component to observe expiry records a timeout and aborts.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn from_now(d: Duration) -> Self {
        Deadline(Instant::now() + d)
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn check(&self) -> Result<()> {
        if self.expired() {
            Err(EngineError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Clamp a per-call timeout to what the deadline still allows.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        timeout.min(self.remaining())
    }
}

/// Seconds since the unix epoch; the store's timestamp unit.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Live cancellation handles keyed by task id. Registered by the worker on
/// claim, triggered by the orchestrator on DELETE, dropped on completion.
#[derive(Default)]
pub struct CancelRegistry {
    handles: Mutex<HashMap<String, CancelHandle>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, task_id: &str) -> CancelSignal {
        let (handle, signal) = cancel_pair();
        self.handles
            .lock()
            .await
            .insert(task_id.to_string(), handle);
        signal
    }

    /// Fire the signal for a task if it is live. Returns whether a handle
    /// existed.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let handles = self.handles.lock().await;
        match handles.get(task_id) {
            Some(h) => {
                h.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, task_id: &str) {
        self.handles.lock().await.remove(task_id);
    }

    /// Cancel everything outstanding (shutdown path).
    pub async fn cancel_all(&self) {
        for handle in self.handles.lock().await.values() {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_fires_signal() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        assert!(signal.check().is_ok());
        handle.cancel();
        assert!(signal.is_cancelled());
        assert_eq!(signal.check(), Err(EngineError::Cancelled));
        signal.cancelled().await; // must resolve immediately
    }

    #[tokio::test]
    async fn never_signal_stays_quiet() {
        let signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
        let res = tokio::time::timeout(Duration::from_millis(10), signal.cancelled()).await;
        assert!(res.is_err(), "never() must not resolve");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let d = Deadline::from_now(Duration::from_secs(5));
        assert!(!d.expired());
        assert_eq!(d.clamp(Duration::from_secs(30)), d.remaining());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(d.expired());
        assert_eq!(d.check(), Err(EngineError::Timeout));
    }

    #[tokio::test]
    async fn registry_cancels_registered_tasks_only() {
        let reg = CancelRegistry::new();
        let signal = reg.register("t1").await;
        assert!(!reg.cancel("t2").await);
        assert!(!signal.is_cancelled());
        assert!(reg.cancel("t1").await);
        assert!(signal.is_cancelled());
        reg.remove("t1").await;
        assert!(!reg.cancel("t1").await);
    }
}

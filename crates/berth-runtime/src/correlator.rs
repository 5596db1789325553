//! Request/response correlation over a message transport.
//!
//! A caller registers an id before sending, then waits on the returned
//! receiver. The first `resolve` for that id wins; later ones find nothing
//! and are ignored. A waiter that gives up removes its own entry, so an id is
//! settled exactly once either way.

use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("pending request was cancelled")]
    Cancelled,
}

#[derive(Debug)]
struct Pending<T> {
    tx: oneshot::Sender<T>,
    deadline: Instant,
}

#[derive(Debug)]
pub struct Correlator<T> {
    pending: DashMap<String, Pending<T>>,
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }
}

impl<T: Send + 'static> Correlator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, timeout: Duration) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.to_string(),
            Pending {
                tx,
                deadline: Instant::now() + timeout,
            },
        );
        rx
    }

    /// Deliver a result. Returns false for unknown, settled or expired ids.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        match self.pending.remove(id) {
            Some((_, pending)) => pending.tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop a pending entry; its waiter sees [`CorrelationError::Cancelled`].
    pub fn reject(&self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Wait for the result registered under `id`, removing the entry on timeout.
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, CorrelationError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CorrelationError::Cancelled),
            Err(_) => {
                self.pending.remove(id);
                Err(CorrelationError::Timeout(timeout))
            }
        }
    }

    /// Remove entries whose deadline has passed. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending.retain(|_, p| p.deadline > now);
        before.saturating_sub(self.pending.len())
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let correlator = Correlator::new();
        let rx = correlator.register("a", Duration::from_secs(1));
        assert!(correlator.resolve("a", 1));
        assert!(!correlator.resolve("a", 2));
        let value = correlator.wait("a", rx, Duration::from_secs(1)).await;
        assert_eq!(value, Ok(1));
        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry_and_ignores_late_result() {
        let correlator = Arc::new(Correlator::<u32>::new());
        let rx = correlator.register("a", Duration::from_secs(30));
        let result = correlator.wait("a", rx, Duration::from_secs(30)).await;
        assert_eq!(result, Err(CorrelationError::Timeout(Duration::from_secs(30))));
        assert!(!correlator.is_pending("a"));
        assert!(!correlator.resolve("a", 7));
    }

    #[tokio::test]
    async fn test_reject_cancels_waiter() {
        let correlator = Correlator::<u32>::new();
        let rx = correlator.register("a", Duration::from_secs(1));
        assert!(correlator.reject("a"));
        let result = correlator.wait("a", rx, Duration::from_secs(1)).await;
        assert_eq!(result, Err(CorrelationError::Cancelled));
    }

    #[tokio::test]
    async fn test_unknown_id_is_noop() {
        let correlator = Correlator::<u32>::new();
        assert!(!correlator.resolve("missing", 1));
        assert!(!correlator.reject("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let correlator = Correlator::<u32>::new();
        let _short = correlator.register("short", Duration::from_secs(1));
        let _long = correlator.register("long", Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(correlator.sweep_expired(), 1);
        assert!(correlator.is_pending("long"));
        assert!(!correlator.is_pending("short"));
    }

    #[tokio::test]
    async fn test_concurrent_ids_resolve_independently() {
        let correlator = Arc::new(Correlator::<String>::new());
        let mut waits = Vec::new();
        for i in 0..10 {
            let id = format!("id-{i}");
            let rx = correlator.register(&id, Duration::from_secs(5));
            let correlator = Arc::clone(&correlator);
            waits.push(tokio::spawn(async move {
                correlator.wait(&id, rx, Duration::from_secs(5)).await
            }));
        }
        for i in (0..10).rev() {
            assert!(correlator.resolve(&format!("id-{i}"), format!("value-{i}")));
        }
        for (i, handle) in waits.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), Ok(format!("value-{i}")));
        }
    }
}

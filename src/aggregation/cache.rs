//! Short-TTL computation cache shared by the aggregation engine: at most one computation
//! runs per key at a time, and a fresh result within the TTL is served without recomputing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

enum Slot<T> {
    Ready { value: Arc<T>, computed_at: Instant },
    Computing,
}

pub struct ComputationCache<T> {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot<T>>>,
}

impl<T> ComputationCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value for `key` if still fresh, or computes it via `compute`
    /// otherwise. If another caller is already computing this key, waits for that result
    /// instead of duplicating the work (at-most-one-concurrent-computation-per-key).
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Arc<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        loop {
            let mut slots = self.slots.lock().await;
            match slots.get(key) {
                Some(Slot::Ready { value, computed_at }) if computed_at.elapsed() < self.ttl => {
                    return value.clone();
                }
                Some(Slot::Computing) => {
                    drop(slots);
                    tokio::task::yield_now().await;
                    continue;
                }
                _ => {
                    slots.insert(key.to_string(), Slot::Computing);
                    drop(slots);
                    let value = Arc::new(compute().await);
                    let mut slots = self.slots.lock().await;
                    slots.insert(
                        key.to_string(),
                        Slot::Ready {
                            value: value.clone(),
                            computed_at: Instant::now(),
                        },
                    );
                    return value;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn repeated_calls_within_ttl_compute_once() {
        let cache = ComputationCache::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let calls = calls.clone();
            cache
                .get_or_compute("BTCUSDT", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    42
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_recomputes() {
        let cache = ComputationCache::new(Duration::from_millis(10));
        cache.get_or_compute("BTCUSDT", || async { 1 }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let value = cache
            .get_or_compute("BTCUSDT", || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                2
            })
            .await;
        assert_eq!(*value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! Bounded TTL cache in front of the knowledge-base query.
//!
//! Prompt assembly may ask for the same contextual hints many times per
//! cycle; the underlying query is expensive. The cache guarantees a single
//! in-flight compute per key: concurrent misses for the same key park on a
//! watch channel while one caller runs the query outside the lock.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};

pub struct KnowledgeCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

struct CacheInner {
    entries: HashMap<String, Slot>,
    // Logical access counter for LRU ordering.
    tick: u64,
}

enum Slot {
    Ready {
        value: serde_json::Value,
        stored_at: Instant,
        last_used: u64,
    },
    Pending {
        done: watch::Receiver<bool>,
    },
}

enum Action {
    Hit(serde_json::Value),
    Wait(watch::Receiver<bool>),
    Compute(watch::Sender<bool>),
}

impl KnowledgeCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Return the cached value for `key`, or run `compute` to fill it.
    ///
    /// `compute` runs outside the cache lock. A failed compute releases the
    /// key so the next caller retries; the failure is returned only to the
    /// caller that ran the query.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<serde_json::Value, String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, String>>,
    {
        let mut compute = Some(compute);
        loop {
            let action = {
                let mut inner = self.inner.lock().await;
                inner.tick += 1;
                let tick = inner.tick;
                match inner.entries.get_mut(key) {
                    Some(Slot::Ready {
                        value,
                        stored_at,
                        last_used,
                    }) if stored_at.elapsed() < self.ttl => {
                        *last_used = tick;
                        Action::Hit(value.clone())
                    }
                    Some(Slot::Pending { done }) => Action::Wait(done.clone()),
                    _ => {
                        // Absent or expired: claim the compute while holding
                        // the lock so only one caller runs it.
                        let (tx, rx) = watch::channel(false);
                        inner
                            .entries
                            .insert(key.to_string(), Slot::Pending { done: rx });
                        Action::Compute(tx)
                    }
                }
            };

            match action {
                Action::Hit(value) => return Ok(value),
                Action::Wait(mut rx) => {
                    if rx.changed().await.is_err() {
                        // The computing caller was dropped mid-query. Clear
                        // the abandoned slot and retry.
                        let mut inner = self.inner.lock().await;
                        if let Some(Slot::Pending { done }) = inner.entries.get(key) {
                            if done.same_channel(&rx) {
                                inner.entries.remove(key);
                            }
                        }
                    }
                    continue;
                }
                Action::Compute(tx) => {
                    let compute = compute.take().ok_or_else(|| {
                        "knowledge compute already consumed for this call".to_string()
                    })?;
                    let result = compute().await;
                    let mut inner = self.inner.lock().await;
                    inner.tick += 1;
                    let tick = inner.tick;
                    match result {
                        Ok(value) => {
                            inner.entries.insert(
                                key.to_string(),
                                Slot::Ready {
                                    value: value.clone(),
                                    stored_at: Instant::now(),
                                    last_used: tick,
                                },
                            );
                            Self::evict(&mut inner, self.capacity);
                            let _ = tx.send(true);
                            return Ok(value);
                        }
                        Err(err) => {
                            inner.entries.remove(key);
                            let _ = tx.send(true);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Number of resident entries (ready or in flight).
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn evict(inner: &mut CacheInner, capacity: usize) {
        while inner.entries.len() > capacity {
            let oldest = inner
                .entries
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready { last_used, .. } => Some((*last_used, key.clone())),
                    Slot::Pending { .. } => None,
                })
                .min();
            match oldest {
                Some((_, key)) => {
                    inner.entries.remove(&key);
                }
                // Only in-flight entries left; nothing evictable.
                None => break,
            }
        }
    }
}

//! TTL cache with single-flight fetch.
//!
//! Used for container inspect results (keyed by container ID) and resolved
//! secrets (keyed by session and reference). On a miss exactly one caller
//! runs the fetch; concurrent callers for the same key wait on a
//! `watch` channel and share its result. The map lock is never held across
//! the fetch itself.
//!
//! Entries are evicted lazily: a stale entry is replaced on the next read.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

type Outcome<V, E> = Option<Result<V, E>>;

enum Slot<V, E> {
    Ready { value: V, expires_at: Instant },
    Loading {
        generation: u64,
        rx: watch::Receiver<Outcome<V, E>>,
    },
}

struct Slots<K, V, E> {
    entries: HashMap<K, Slot<V, E>>,
    next_generation: u64,
}

/// A key/value cache whose entries expire after a fixed TTL.
pub struct TtlCache<K, V, E> {
    ttl: Duration,
    slots: Mutex<Slots<K, V, E>>,
}

impl<K, V, E> TtlCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    /// Create an empty cache with the given time-to-live.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(Slots {
                entries: HashMap::new(),
                next_generation: 0,
            }),
        }
    }

    /// The configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached value for `key`, or run `fetch` to produce it.
    ///
    /// Errors are handed to every caller waiting on the same fetch but are
    /// never cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (tx, generation) = loop {
            let mut rx = {
                let mut slots = self.lock();
                match slots.entries.get(&key) {
                    Some(Slot::Ready { value, expires_at }) if Instant::now() < *expires_at => {
                        return Ok(value.clone());
                    }
                    Some(Slot::Loading { rx, .. }) => rx.clone(),
                    _ => {
                        let generation = slots.next_generation;
                        slots.next_generation += 1;
                        let (tx, rx) = watch::channel(None);
                        slots
                            .entries
                            .insert(key.clone(), Slot::Loading { generation, rx });
                        break (tx, generation);
                    }
                }
            };

            // A closed channel means the leading caller was dropped mid-fetch;
            // go around and take over.
            let outcome = rx
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|outcome| (*outcome).clone());
            if let Some(result) = outcome {
                return result;
            }
        };

        let mut guard = LoadingGuard {
            cache: self,
            key: &key,
            generation,
            armed: true,
        };

        let result = fetch().await;

        {
            let mut slots = self.lock();
            match &result {
                Ok(value) => {
                    slots.entries.insert(
                        key.clone(),
                        Slot::Ready {
                            value: value.clone(),
                            expires_at: Instant::now() + self.ttl,
                        },
                    );
                }
                Err(_) => {
                    remove_if_loading(&mut slots, &key, generation);
                }
            }
            guard.armed = false;
        }

        let _ = tx.send(Some(result.clone()));
        result
    }

    /// Drop the entry for `key`, forcing the next read to fetch.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut slots = self.lock();
        if matches!(slots.entries.get(key), Some(Slot::Ready { .. })) {
            slots.entries.remove(key);
        }
    }

    /// Number of entries currently held, fresh or stale.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Slots<K, V, E>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn remove_if_loading<K: Eq + Hash, V, E>(slots: &mut Slots<K, V, E>, key: &K, generation: u64) {
    if matches!(
        slots.entries.get(key),
        Some(Slot::Loading { generation: g, .. }) if *g == generation
    ) {
        slots.entries.remove(key);
    }
}

/// Clears the in-flight marker if the leading fetch is dropped before it
/// completes.
struct LoadingGuard<'a, K: Eq + Hash, V, E> {
    cache: &'a TtlCache<K, V, E>,
    key: &'a K,
    generation: u64,
    armed: bool,
}

impl<K: Eq + Hash, V, E> Drop for LoadingGuard<'_, K, V, E> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self
                .cache
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            remove_if_loading(&mut slots, self.key, self.generation);
        }
    }
}

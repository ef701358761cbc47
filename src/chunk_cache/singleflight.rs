//! SingleFlight: coalesce concurrent requests for the same key into a single operation.
//!
//! When multiple concurrent requests arrive for the same key, only the first one
//! actually executes the underlying operation. All subsequent requests wait for
//! the first to complete and share its result, error included.
//!
//! The entry for a key is removed under the same lock that inserted it, either
//! when the operation finishes or when the leading request is dropped. Waiters
//! of a dropped leader retry, and one of them takes over.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::Result;

/// A request in flight, tracking the broadcast channel for result sharing.
struct InFlight<V> {
    /// Distinguishes successive leaders of the same key.
    generation: u64,
    tx: broadcast::Sender<Result<V>>,
}

pub struct SingleFlight<K, V> {
    in_flight: Mutex<HashMap<K, InFlight<V>>>,
    generation: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the leader's entry if the leading future is dropped before it
/// publishes a result.
struct LeaderGuard<'a, K: Hash + Eq, V> {
    in_flight: &'a Mutex<HashMap<K, InFlight<V>>>,
    key: Option<K>,
    generation: u64,
}

impl<K: Hash + Eq, V> Drop for LeaderGuard<'_, K, V> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut guard = self.in_flight.lock();
        if guard.get(&key).is_some_and(|f| f.generation == self.generation) {
            // dropping the sender closes the channel and wakes the waiters
            guard.remove(&key);
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Execute an async operation, coalescing concurrent requests for the same key.
    ///
    /// If there's already an in-flight request for this key, wait for its result.
    /// Otherwise, execute the provided function and share its result with any
    /// concurrent waiters. `V` should be cheap to clone (`Bytes`, `Arc<_>`).
    pub async fn execute<F, Fut>(&self, key: K, f: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let generation = loop {
            let mut rx = {
                let mut guard = self.in_flight.lock();
                match guard.get(&key) {
                    Some(in_flight) => in_flight.tx.subscribe(),
                    None => {
                        // capacity 1: exactly one result is ever sent
                        let (tx, _) = broadcast::channel(1);
                        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                        guard.insert(key.clone(), InFlight { generation, tx });
                        break generation;
                    }
                }
            };

            match rx.recv().await {
                Ok(result) => return result,
                Err(_) => {
                    trace!("SingleFlight leader went away, retrying");
                    continue;
                }
            }
        };

        let mut leader = LeaderGuard {
            in_flight: &self.in_flight,
            key: Some(key),
            generation,
        };
        let result = f().await;

        if let Some(key) = leader.key.take() {
            let mut guard = self.in_flight.lock();
            if let Some(in_flight) = guard.remove(&key) {
                // no receivers means no one is waiting
                let _ = in_flight.tx.send(result.clone());
            }
        }
        result
    }

    /// Number of keys with an operation currently running.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

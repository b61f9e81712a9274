//! Coalesce concurrent callers for the same key into one operation.
//!
//! The first caller for a key starts the operation; callers arriving while
//! it is in flight await the same shared future and receive a clone of its
//! output. The key is released as soon as the operation resolves, so the
//! next call after that starts fresh.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

struct Flight<V> {
    id: u64,
    future: Shared<BoxFuture<'static, V>>,
}

pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, Flight<V>>>,
    next_id: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        SingleFlight {
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Flight<V>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `make()` unless an operation for `key` is already in flight, in
    /// which case wait for that one instead. `make` is only called by the
    /// caller that starts the flight.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (id, future) = {
            let mut inflight = self.lock();
            match inflight.get(&key) {
                Some(flight) => {
                    drop(make);
                    (flight.id, flight.future.clone())
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = make().boxed().shared();
                    inflight.insert(
                        key.clone(),
                        Flight {
                            id,
                            future: future.clone(),
                        },
                    );
                    (id, future)
                }
            }
        };

        let value = future.await;

        // Release the key, unless a newer flight already replaced it.
        let mut inflight = self.lock();
        if inflight.get(&key).is_some_and(|f| f.id == id) {
            inflight.remove(&key);
        }
        value
    }

    #[cfg(test)]
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_operation() {
        let flights: Arc<SingleFlight<String, usize>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for _ in 0..5 {
            let flights = flights.clone();
            let calls = calls.clone();
            joins.push(tokio::spawn(async move {
                flights
                    .run("user-1".to_string(), move || async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        calls.fetch_add(1, Ordering::SeqCst) + 41
                    })
                    .await
            }));
        }

        for j in joins {
            assert_eq!(j.await.unwrap(), 41);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight(&"user-1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_calls_each_run() {
        let flights: SingleFlight<&'static str, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            flights
                .run("k", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    7
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_coalesce() {
        let flights: Arc<SingleFlight<u32, u32>> = Arc::new(SingleFlight::new());
        let a = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run(1, || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        1
                    })
                    .await
            })
        };
        let b = {
            let flights = flights.clone();
            tokio::spawn(async move { flights.run(2, || async { 2 }).await })
        };
        assert_eq!(a.await.unwrap(), 1);
        assert_eq!(b.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_flight_is_finished_by_next_caller() {
        let flights: Arc<SingleFlight<u8, u8>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let flights = flights.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                flights
                    .run(0, move || async move {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        calls.fetch_add(1, Ordering::SeqCst);
                        9
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        first.abort();
        let _ = first.await;
        assert!(flights.is_in_flight(&0));

        let value = flights.run(0, || async { 0 }).await;
        assert_eq!(value, 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight(&0));
    }
}

//! Per-key request coalescing.
//!
//! Collapses concurrent identical fetches into one upstream call: the
//! first caller for a key becomes the leader and does the work in a
//! detached task, everyone else subscribes to the result. The work is
//! deliberately spawned rather than driven by the leader's own task so
//! a client disconnect does not cancel a fetch other waiters still
//! benefit from.
//!
//! The registry entry is removed when the work completes; subsequent
//! misses start a fresh flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

pub struct SingleFlight<T: Clone + Send + 'static> {
    in_flight: Arc<Mutex<HashMap<String, broadcast::Sender<T>>>>,
}

/// Removes a registry entry when dropped, so a flight that dies on the
/// way (panic, runtime teardown) never wedges later callers.
struct Unregister<T: Clone + Send + 'static> {
    registry: Arc<Mutex<HashMap<String, broadcast::Sender<T>>>>,
    key: String,
}

impl<T: Clone + Send + 'static> Drop for Unregister<T> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `work` for `key`, or joins an identical call already in
    /// flight. All participants observe the same result.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut work = Some(work);

        loop {
            let mut rx = {
                let mut in_flight = self.in_flight.lock();

                if let Some(tx) = in_flight.get(key) {
                    // Someone is already on it
                    tx.subscribe()
                } else {
                    let (tx, rx) = broadcast::channel(1);
                    in_flight.insert(key.to_owned(), tx.clone());

                    let guard = Unregister {
                        registry: self.in_flight.clone(),
                        key: key.to_owned(),
                    };
                    let fut = (work.take().unwrap())();
                    tokio::spawn(async move {
                        let result = fut.await;
                        // Unregister before broadcasting: anyone who
                        // misses the broadcast starts a fresh flight
                        drop(guard);
                        let _ = tx.send(result);
                    });

                    rx
                }
            };

            match rx.recv().await {
                Ok(value) => return value,
                // The flight died without broadcasting. Joiners still
                // hold their `work` and take over as the new leader.
                Err(_) if work.is_some() => continue,
                Err(_) => panic!("single-flight work for {key:?} died without a result"),
            }
        }
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

impl<T: Clone + Send + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_calls_collapse() {
        let sf = Arc::new(SingleFlight::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let sf = sf.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    sf.run("the-key", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42u64
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sf.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_rerun() {
        let sf = SingleFlight::<u64>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let calls = calls.clone();
            let got = sf
                .run("key", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    i
                })
                .await;
            assert_eq!(got, i);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let sf = Arc::new(SingleFlight::<&'static str>::new());

        let a = sf.run("a", || async { "a" });
        let b = sf.run("b", || async { "b" });

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, "a");
        assert_eq!(b, "b");
    }
}

//! Keyed join-or-start coalescing.
//!
//! Concurrent callers for the same key share one execution of the supplied
//! future; the entry is removed once the shared job settles, so a later call
//! starts fresh. The job runs on a spawned task: a joiner that disconnects
//! does not cancel it for the callers still waiting on the result.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

#[derive(Clone)]
pub struct Singleflight<K, V> {
    inflight: Arc<Mutex<HashMap<K, watch::Receiver<Option<V>>>>>,
}

impl<K, V> Default for Singleflight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

enum Role<V> {
    Leader(watch::Sender<Option<V>>),
    Joiner(watch::Receiver<Option<V>>),
}

impl<K, V> Singleflight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins an in-flight job for `key`, or starts one from `make`.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut make = Some(make);
        loop {
            let role = {
                let mut guard = self.inflight.lock().await;
                match guard.get(&key) {
                    Some(rx) => Role::Joiner(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        guard.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };
            match role {
                Role::Leader(tx) => {
                    let make = make.take().expect("leader role is taken at most once");
                    let fut = make();
                    let inflight = self.inflight.clone();
                    let key = key.clone();
                    let handle = tokio::spawn(async move {
                        let value = fut.await;
                        inflight.lock().await.remove(&key);
                        let _ = tx.send(Some(value.clone()));
                        value
                    });
                    return match handle.await {
                        Ok(value) => value,
                        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                        Err(_) => unreachable!("singleflight job cancelled"),
                    };
                }
                Role::Joiner(mut rx) => {
                    loop {
                        if let Some(value) = rx.borrow_and_update().clone() {
                            return value;
                        }
                        if rx.changed().await.is_err() {
                            // Leader vanished without publishing; take over.
                            break;
                        }
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub async fn inflight_len(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, sleep};

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight: Singleflight<String, u64> = Singleflight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("same-key".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(30)).await;
                        42
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.inflight_len().await, 0);
    }

    #[tokio::test]
    async fn settled_key_runs_fresh() {
        let flight: Singleflight<&'static str, u64> = Singleflight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in [1, 2] {
            let calls = calls.clone();
            let got = flight
                .run("k", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst) as u64 + 1
                })
                .await;
            assert_eq!(got, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let flight: Singleflight<u32, u32> = Singleflight::new();
        let a = flight.run(1, || async { 10 });
        let b = flight.run(2, || async { 20 });
        let (a, b) = tokio::join!(a, b);
        assert_eq!((a, b), (10, 20));
    }

    #[tokio::test]
    async fn error_results_are_shared_and_not_cached() {
        let flight: Singleflight<&'static str, Result<u32, String>> = Singleflight::new();
        let failed = flight
            .run("k", || async { Err::<u32, _>("boom".to_string()) })
            .await;
        assert!(failed.is_err());
        // Settled failure releases the key; the next attempt may succeed.
        let ok = flight.run("k", || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
    }
}

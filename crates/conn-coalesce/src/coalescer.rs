//! Single-flight coalescing of async operations keyed by connection name.
//!
//! At most one operation runs per key. Callers that ask for a key while its
//! operation is in flight get a handle to the same outcome instead of
//! starting another one. Once the operation settles the key is forgotten, so
//! the next call starts fresh: this suppresses concurrent duplicates only and
//! never caches results.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{EnsureError, EnsureResult};

type PendingFuture<T, E> = Shared<BoxFuture<'static, EnsureResult<T, E>>>;

struct PendingEntry<T, E> {
    generation: u64,
    future: PendingFuture<T, E>,
}

struct Registry<T, E> {
    next_generation: u64,
    entries: HashMap<String, PendingEntry<T, E>>,
}

impl<T, E> Default for Registry<T, E> {
    fn default() -> Self {
        Self {
            next_generation: 0,
            entries: HashMap::new(),
        }
    }
}

/// Keyed registry of in-flight operations.
///
/// Clones share the same registry. Operations are spawned onto the current
/// tokio runtime and always run to completion, even if every handle to them
/// is dropped.
pub struct RequestCoalescer<T, E> {
    registry: Arc<Mutex<Registry<T, E>>>,
}

impl<T, E> Clone for RequestCoalescer<T, E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T, E> Default for RequestCoalescer<T, E> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }
}

impl<T, E> RequestCoalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` for `key` unless one is already in flight, in which
    /// case `operation` is dropped uninvoked and the caller joins the pending
    /// one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn ensure<F, Fut>(&self, key: impl Into<String>, operation: F) -> EnsureHandle<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = key.into();
        let (sender, receiver) = oneshot::channel::<EnsureResult<T, E>>();

        // The slot is claimed before `operation` is invoked, so nothing the
        // operation does can race a second caller past the check.
        let (generation, shared) = {
            let mut registry = self.registry.lock();
            if let Some(entry) = registry.entries.get(&key) {
                debug!(conn = %key, "joining in-flight ensure");
                return EnsureHandle {
                    key,
                    shared: entry.future.clone(),
                };
            }

            let generation = registry.next_generation;
            registry.next_generation += 1;

            let abort_key = key.clone();
            let shared = async move {
                match receiver.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EnsureError::Aborted {
                        key: abort_key,
                        reason: "operation dropped before settling".to_string(),
                    }),
                }
            }
            .boxed()
            .shared();

            registry.entries.insert(
                key.clone(),
                PendingEntry {
                    generation,
                    future: shared.clone(),
                },
            );
            (generation, shared)
        };

        debug!(conn = %key, generation, "starting ensure");
        let settle = SettleGuard {
            registry: Arc::clone(&self.registry),
            key: key.clone(),
            generation,
        };
        let future = operation();
        let task_key = key.clone();

        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(value)) => {
                    debug!(conn = %task_key, "ensure settled");
                    Ok(value)
                }
                Ok(Err(err)) => {
                    debug!(conn = %task_key, "ensure failed");
                    Err(EnsureError::Operation(Arc::new(err)))
                }
                Err(payload) => {
                    let reason = panic_reason(payload.as_ref());
                    warn!(conn = %task_key, %reason, "ensure operation panicked");
                    Err(EnsureError::Aborted {
                        key: task_key,
                        reason,
                    })
                }
            };
            // Forget the key before waking waiters; a waiter that re-ensures
            // right away must start a new operation.
            drop(settle);
            let _ = sender.send(outcome);
        });

        EnsureHandle { key, shared }
    }

    /// Forget every pending entry. In-flight operations keep running and
    /// their existing waiters still receive their outcome.
    pub fn reset(&self) {
        let mut registry = self.registry.lock();
        let cleared = registry.entries.len();
        registry.entries.clear();
        debug!(cleared, "coalescer reset");
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.registry.lock().entries.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.registry.lock().entries.len()
    }
}

/// Removes its registry entry when the operation settles or its task is
/// dropped. An entry replaced after `reset` carries a newer generation and is
/// left alone.
struct SettleGuard<T, E> {
    registry: Arc<Mutex<Registry<T, E>>>,
    key: String,
    generation: u64,
}

impl<T, E> Drop for SettleGuard<T, E> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        let current = registry
            .entries
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation);
        if current {
            registry.entries.remove(&self.key);
        }
    }
}

/// Handle to a (possibly shared) ensure outcome.
#[must_use = "the operation runs regardless; await the handle to observe its outcome"]
pub struct EnsureHandle<T, E> {
    key: String,
    shared: PendingFuture<T, E>,
}

impl<T, E> EnsureHandle<T, E> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T: Clone, E> Future for EnsureHandle<T, E> {
    type Output = EnsureResult<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().shared.poll_unpin(cx)
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "operation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("{0}")]
    struct Refused(String);

    type Coalescer = RequestCoalescer<u32, Refused>;

    fn explode() -> Result<u32, Refused> {
        panic!("boom")
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_operation() {
        let coalescer = Coalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = oneshot::channel::<()>();

        let first = {
            let calls = Arc::clone(&calls);
            coalescer.ensure("host1", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.await.expect("gate dropped");
                Ok(42)
            })
        };
        let second_ran = Arc::new(AtomicBool::new(false));
        let second = {
            let second_ran = Arc::clone(&second_ran);
            coalescer.ensure("host1", move || {
                second_ran.store(true, Ordering::SeqCst);
                async { Ok(7) }
            })
        };

        assert!(coalescer.is_pending("host1"));
        assert_eq!(coalescer.pending_count(), 1);
        release.send(()).unwrap();

        assert_eq!(first.await.unwrap(), 42);
        assert_eq!(second.await.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!second_ran.load(Ordering::SeqCst));
        assert!(!coalescer.is_pending("host1"));
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter_identically() {
        let coalescer = Coalescer::new();
        let (release, gate) = oneshot::channel::<()>();

        let first = coalescer.ensure("host1", move || async move {
            gate.await.expect("gate dropped");
            Err(Refused("refused".into()))
        });
        let second = coalescer.ensure("host1", || async { Ok(1) });
        release.send(()).unwrap();

        let first_err = first.await.unwrap_err();
        let second_err = second.await.unwrap_err();
        let a = first_err.operation_error().expect("operation error");
        let b = second_err.operation_error().expect("operation error");
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(a.0, "refused");
        assert_eq!(first_err.to_string(), "refused");
    }

    #[test_timeout::tokio_timeout_test(secs = 5)]
    async fn different_keys_run_independently() {
        let coalescer = Coalescer::new();
        // Each operation waits for the other; serialising keys would deadlock.
        let barrier = Arc::new(Barrier::new(2));

        let a = {
            let barrier = Arc::clone(&barrier);
            coalescer.ensure("host1", move || async move {
                barrier.wait().await;
                Ok(1)
            })
        };
        let c = {
            let barrier = Arc::clone(&barrier);
            coalescer.ensure("host2", move || async move {
                barrier.wait().await;
                Ok(2)
            })
        };

        assert_eq!(coalescer.pending_count(), 2);
        assert_eq!(a.await.unwrap(), 1);
        assert_eq!(c.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn settled_key_runs_again() {
        let coalescer = Coalescer::new();
        assert_eq!(coalescer.ensure("host1", || async { Ok(1) }).await.unwrap(), 1);

        let reran = Arc::new(AtomicBool::new(false));
        let value = {
            let reran = Arc::clone(&reran);
            coalescer
                .ensure("host1", move || async move {
                    reran.store(true, Ordering::SeqCst);
                    Ok(2)
                })
                .await
                .unwrap()
        };
        assert!(reran.load(Ordering::SeqCst));
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn failure_does_not_poison_key() {
        let coalescer = Coalescer::new();
        let err = coalescer
            .ensure("host1", || async { Err(Refused("refused".into())) })
            .await
            .unwrap_err();
        assert!(!err.is_aborted());
        assert!(!coalescer.is_pending("host1"));

        let value = coalescer.ensure("host1", || async { Ok(9) }).await.unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn reset_starts_fresh_while_old_operation_runs() {
        let coalescer = Coalescer::new();
        let (release_old, old_gate) = oneshot::channel::<()>();
        let (release_new, new_gate) = oneshot::channel::<()>();

        let old = coalescer.ensure("host1", move || async move {
            old_gate.await.expect("gate dropped");
            Ok(1)
        });
        coalescer.reset();
        assert_eq!(coalescer.pending_count(), 0);

        let new_ran = Arc::new(AtomicBool::new(false));
        let new = {
            let new_ran = Arc::clone(&new_ran);
            coalescer.ensure("host1", move || async move {
                new_ran.store(true, Ordering::SeqCst);
                new_gate.await.expect("gate dropped");
                Ok(2)
            })
        };

        release_old.send(()).unwrap();
        assert_eq!(old.await.unwrap(), 1);
        // The old operation settling must not evict the newer entry.
        assert!(coalescer.is_pending("host1"));

        release_new.send(()).unwrap();
        assert_eq!(new.await.unwrap(), 2);
        assert!(new_ran.load(Ordering::SeqCst));
        assert!(!coalescer.is_pending("host1"));
    }

    #[tokio::test]
    async fn panicking_operation_aborts_all_waiters() {
        let coalescer = Coalescer::new();
        let (release, gate) = oneshot::channel::<()>();

        let first = coalescer.ensure("host1", move || async move {
            gate.await.expect("gate dropped");
            explode()
        });
        let second = coalescer.ensure("host1", || async { Ok(1) });
        release.send(()).unwrap();

        for outcome in [first.await, second.await] {
            match outcome {
                Err(EnsureError::Aborted { key, reason }) => {
                    assert_eq!(key, "host1");
                    assert_eq!(reason, "boom");
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert!(!coalescer.is_pending("host1"));
    }

    #[test_timeout::tokio_timeout_test(secs = 5)]
    async fn operation_runs_to_completion_after_handles_drop() {
        let coalescer = Coalescer::new();
        let finished = Arc::new(AtomicBool::new(false));
        {
            let finished = Arc::clone(&finished);
            drop(coalescer.ensure("host1", move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(1)
            }));
        }

        while coalescer.is_pending("host1") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test_timeout::tokio_timeout_test(secs = 10, flavor = "multi_thread", worker_threads = 4)]
    async fn deduplicates_across_worker_threads() {
        let coalescer = Coalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let joined = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(32));
        let (release, gate) = tokio::sync::watch::channel(false);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let coalescer = coalescer.clone();
            let calls = Arc::clone(&calls);
            let joined = Arc::clone(&joined);
            let start = Arc::clone(&start);
            let mut gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                start.wait().await;
                let handle = coalescer.ensure("host1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let _ = gate.wait_for(|open| *open).await;
                    Ok(5)
                });
                joined.fetch_add(1, Ordering::SeqCst);
                handle.await
            }));
        }

        while joined.load(Ordering::SeqCst) < 32 {
            tokio::task::yield_now().await;
        }
        release.send(true).unwrap();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 5);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

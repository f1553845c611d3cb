//! C7: one FIFO admission queue per service. Dialect translation already
//! happened in `preprocess`; what waits here is "give me a key for this
//! model, in order." Grounded on the teacher's
//! `credential/unavailable_queue.rs::UnavailableQueue` — same
//! `Notify`-wakes-a-loop-that-recomputes-its-own-deadline shape, turned
//! from a recovery queue into an admission queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use keyrelay_provider_core::{KeyHandle, KeyPool, ProviderError};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;

/// How long the queue waits for the checker before giving up on a
/// service that has zero available keys but still has unchecked ones.
pub const STALL_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How long `drain_ready` waits before re-checking the concurrency gate
/// after finding it fully occupied.
const CONCURRENCY_RETRY_DELAY: Duration = Duration::from_millis(50);

struct Waiter {
    model: String,
    responder: oneshot::Sender<Result<Admission, ProxyError>>,
}

/// What `admit` hands back to a request task: the bound key, plus the
/// concurrency-gate permit that must stay held for the lifetime of the
/// upstream dispatch. Dropping it (when the caller's `Admission` goes out
/// of scope at the end of the request) frees the slot for the next
/// waiter.
pub struct Admission {
    pub key: KeyHandle,
    _permit: OwnedSemaphorePermit,
}

/// FIFO waiting line in front of one service. Two halves: `admit` is
/// called from a request task to join the line and await a key; the
/// scheduler loop spawned by `spawn_scheduler` is the only thing that
/// ever pops a waiter.
///
/// `concurrency` is the soft per-service fan-out cap from §5: a
/// `Semaphore` resized on every sweep to track `pool.available()` for
/// this service, so at most one upstream request is in flight per
/// non-disabled key at any moment.
pub struct Queue {
    service: String,
    waiters: Mutex<VecDeque<Waiter>>,
    notify: Notify,
    concurrency: Arc<Semaphore>,
    concurrency_total: AtomicUsize,
}

impl Queue {
    pub fn new(service: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            service: service.into(),
            waiters: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            concurrency: Arc::new(Semaphore::new(0)),
            concurrency_total: AtomicUsize::new(0),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Joins the FIFO line for `model` and waits for a key. If `cancel`
    /// fires first (the client disconnected), the waiter's slot is
    /// abandoned: any key the scheduler had already bound for it is
    /// simply never used (its throttle window, set at selection time, is
    /// left standing) and no upstream dispatch happens. `cancel` is also
    /// what actually gets dropped (and with it, `tx`) whenever the
    /// caller's own future is torn down without ever firing the token —
    /// either way the waiter is closed and `drain_ready` evicts it.
    pub async fn admit(
        self: &Arc<Self>,
        model: String,
        cancel: CancellationToken,
    ) -> Result<Admission, ProxyError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().await;
            waiters.push_back(Waiter { model, responder: tx });
        }
        self.notify.notify_one();

        tokio::select! {
            result = rx => result.unwrap_or(Err(ProxyError::Cancelled)),
            () = cancel.cancelled() => Err(ProxyError::Cancelled),
        }
    }

    /// Runs forever: admits every head-of-line waiter it can satisfy,
    /// then sleeps until the next lockout clears or a new waiter arrives.
    pub fn spawn_scheduler(self: Arc<Self>, pool: Arc<KeyPool>) {
        tokio::spawn(async move {
            loop {
                match self.drain_ready(&pool).await {
                    Some(duration) if duration > Duration::ZERO => {
                        tokio::select! {
                            _ = tokio::time::sleep(duration) => {}
                            _ = self.notify.notified() => {}
                        }
                    }
                    _ => self.notify.notified().await,
                }
            }
        });
    }

    /// Grows or shrinks the concurrency gate to match `target`, the
    /// current non-disabled key count for this service. At least one
    /// permit is always kept so a single-key pool doesn't deadlock
    /// itself. Shrinking only ever forgets currently-available permits
    /// (never one already held by an in-flight request), so this is a
    /// soft cap that settles on the new target as in-flight requests
    /// complete rather than one enforced instantaneously.
    fn resize_concurrency(&self, target: usize) {
        let target = target.max(1);
        let current = self.concurrency_total.load(Ordering::Relaxed);
        if target > current {
            self.concurrency.add_permits(target - current);
            self.concurrency_total.store(target, Ordering::Relaxed);
        } else if target < current {
            let forgotten = self.concurrency.forget_permits(current - target);
            self.concurrency_total.fetch_sub(forgotten, Ordering::Relaxed);
        }
    }

    /// One sweep of the queue: drops abandoned (cancelled) waiters without
    /// spending a key on them, admits everyone it can, and reports how
    /// long the caller should sleep before sweeping again (`None` means
    /// "wait for the next notify, nothing is pending").
    async fn drain_ready(&self, pool: &Arc<KeyPool>) -> Option<Duration> {
        loop {
            let model = {
                let mut waiters = self.waiters.lock().await;
                loop {
                    match waiters.front() {
                        None => return None,
                        Some(w) if w.responder.is_closed() => {
                            waiters.pop_front();
                            continue;
                        }
                        Some(w) => break w.model.clone(),
                    }
                }
            };

            let available = pool.available(&self.service).await.unwrap_or(0);
            if available == 0 {
                if pool.any_unchecked(&self.service).await.unwrap_or(false) {
                    return Some(STALL_GRACE_PERIOD);
                }
                self.drain_all_with(ProxyError::NoKeysAvailable).await;
                return None;
            }
            self.resize_concurrency(available);

            match pool.get_lockout_period(&self.service, &model).await {
                Ok(period) if period > Duration::ZERO => return Some(period),
                Ok(_) => {}
                Err(_) => {
                    self.drain_all_with(ProxyError::NoKeysAvailable).await;
                    return None;
                }
            }

            let permit = match self.concurrency.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return Some(CONCURRENCY_RETRY_DELAY),
            };

            match pool.get(&model).await {
                Ok((_, handle)) => {
                    let mut waiters = self.waiters.lock().await;
                    if let Some(waiter) = waiters.pop_front() {
                        let _ = waiter.responder.send(Ok(Admission { key: handle, _permit: permit }));
                    }
                }
                Err(ProviderError::NoKeysAvailable) => {
                    // Eligible-but-locked accounting raced with a wider
                    // "no keys at all for this model" check above; give
                    // the scheduler a short beat and re-evaluate. Drop the
                    // permit we just took so it isn't wasted on nothing.
                    drop(permit);
                    return Some(Duration::from_millis(50));
                }
                Err(_) => {
                    drop(permit);
                    self.drain_all_with(ProxyError::NoKeysAvailable).await;
                    return None;
                }
            }
        }
    }

    async fn drain_all_with(&self, make_err: impl Fn() -> ProxyError) {
        let mut waiters = self.waiters.lock().await;
        for waiter in waiters.drain(..) {
            let _ = waiter.responder.send(Err(make_err()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_admits_in_enqueue_order() {
        let provider = keyrelay_provider_impl::ApiKeyProvider::new("openai", keyrelay_provider_core::EventHub::new(4));
        let hash = provider.add_key("sk-a").await;
        provider
            .update(
                &hash,
                keyrelay_provider_core::KeyPatch {
                    model_families: Some(["gpt-4".to_string()].into_iter().collect()),
                    ..Default::default()
                },
            )
            .await;
        let mut pool = KeyPool::new(vec![("gpt-".to_string(), "openai".to_string())]);
        pool.register(Arc::new(provider));
        let pool = Arc::new(pool);

        let queue = Queue::new("openai");
        queue.clone().spawn_scheduler(pool.clone());

        let first = queue.admit("gpt-4".to_string(), CancellationToken::new());
        let second = queue.admit("gpt-4".to_string(), CancellationToken::new());
        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn cancelled_waiter_is_dropped_without_a_key() {
        let pool = Arc::new(KeyPool::new(vec![]));
        let queue = Queue::new("openai");
        queue.clone().spawn_scheduler(pool);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = queue.admit("gpt-4".to_string(), cancel).await;
        assert!(matches!(result, Err(ProxyError::Cancelled)));
    }

    #[tokio::test]
    async fn concurrency_gate_bounds_in_flight_admissions_to_available_keys() {
        // Single key ⇒ cap of one: a second admission only completes once
        // the first `Admission` (and its permit) is dropped.
        let provider = keyrelay_provider_impl::ApiKeyProvider::new("openai", keyrelay_provider_core::EventHub::new(4));
        let hash = provider.add_key("sk-a").await;
        provider
            .update(
                &hash,
                keyrelay_provider_core::KeyPatch {
                    model_families: Some(["gpt-4".to_string()].into_iter().collect()),
                    ..Default::default()
                },
            )
            .await;
        let mut pool = KeyPool::new(vec![("gpt-".to_string(), "openai".to_string())]);
        pool.register(Arc::new(provider));
        let pool = Arc::new(pool);

        let queue = Queue::new("openai");
        queue.clone().spawn_scheduler(pool.clone());

        let first = queue.admit("gpt-4".to_string(), CancellationToken::new()).await.unwrap();

        let second = tokio::time::timeout(
            Duration::from_millis(150),
            queue.admit("gpt-4".to_string(), CancellationToken::new()),
        )
        .await;
        assert!(second.is_err(), "second admission must not complete while the only permit is held");

        drop(first);
        let third = tokio::time::timeout(
            Duration::from_secs(1),
            queue.admit("gpt-4".to_string(), CancellationToken::new()),
        )
        .await;
        assert!(third.is_ok(), "admission should succeed once the held permit is released");
    }
}

//! Bounded-concurrency render scheduler
//!
//! Decides which previews get generated and when. Each key moves through
//! `queued -> running -> resolved`, and may be cancelled from either of the
//! first two states:
//!
//! - a cached key resolves immediately without queueing
//! - a key that is already queued or running coalesces onto that entry
//! - at most `max_concurrency` producers run at once; the rest wait in FIFO
//!   order and are admitted as soon as a slot frees
//! - successes are written to the [`ThumbnailCache`]; failures are not, so a
//!   later request for the same key starts over
//!
//! All state transitions happen inside one short critical section; producers
//! run outside it on the Tokio runtime.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::cache::{CacheKey, PreviewHandle, ThumbnailCache};
use crate::error::ConversionFailure;
use crate::protocol::PreviewImage;

/// Result a producer hands back to the scheduler
pub type ProducerOutput = Result<PreviewImage, ConversionFailure>;

type Producer = Box<dyn FnOnce() -> BoxFuture<'static, ProducerOutput> + Send>;
type Outcome = Result<PreviewHandle, ConversionFailure>;

/// Why a ticket did not yield a preview
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("render failed: {0}")]
    Failed(ConversionFailure),

    #[error("render cancelled")]
    Cancelled,
}

/// Handle on a requested preview
#[derive(Debug)]
pub enum Ticket {
    /// Served from the cache
    Ready(PreviewHandle),
    /// Queued, running, or coalesced onto an existing job
    Pending {
        key: CacheKey,
        waiter_id: u64,
        rx: oneshot::Receiver<Outcome>,
    },
}

impl Ticket {
    pub fn is_ready(&self) -> bool {
        matches!(self, Ticket::Ready(_))
    }

    /// Waiter id to pass to [`RenderScheduler::detach`]
    pub fn waiter_id(&self) -> Option<u64> {
        match self {
            Ticket::Ready(_) => None,
            Ticket::Pending { waiter_id, .. } => Some(*waiter_id),
        }
    }

    /// Wait for the preview. A cancelled entry resolves to `Cancelled`.
    pub async fn wait(self) -> Result<PreviewHandle, RenderError> {
        match self {
            Ticket::Ready(handle) => Ok(handle),
            Ticket::Pending { rx, .. } => match rx.await {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(failure)) => Err(RenderError::Failed(failure)),
                Err(_) => Err(RenderError::Cancelled),
            },
        }
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub active: usize,
    pub queued: usize,
    pub max_concurrency: usize,
    pub cached: usize,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Outcome>,
}

struct QueueEntry {
    enqueued_at: Instant,
    run: Option<Producer>,
    running: bool,
    cancelled: bool,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct SchedulerState {
    active_count: usize,
    queue: VecDeque<CacheKey>,
    entries: HashMap<CacheKey, QueueEntry>,
    next_waiter_id: u64,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    cache: Arc<ThumbnailCache>,
    max_concurrency: usize,
}

/// FIFO admission queue with coalescing, backed by a [`ThumbnailCache`]
#[derive(Clone)]
pub struct RenderScheduler {
    inner: Arc<SchedulerInner>,
}

impl RenderScheduler {
    pub fn new(cache: Arc<ThumbnailCache>, max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState::default()),
                cache,
                max_concurrency: max_concurrency.max(1),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ThumbnailCache> {
        &self.inner.cache
    }

    /// Request a preview for `key`, running `producer` if a new job is needed.
    ///
    /// The producer is dropped unused when the key is cached or already in
    /// flight. Must be called from within a Tokio runtime.
    pub fn enqueue<F, Fut>(&self, key: CacheKey, producer: F) -> Ticket
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ProducerOutput> + Send + 'static,
    {
        let producer: Producer = Box::new(move || producer().boxed());
        let mut admitted = Vec::new();

        let ticket = {
            let mut state = self.inner.state.lock();

            if let Some(handle) = self.inner.cache.get(&key) {
                tracing::trace!(key = %key, "Preview served from cache");
                return Ticket::Ready(handle);
            }

            state.next_waiter_id += 1;
            let waiter_id = state.next_waiter_id;
            let (tx, rx) = oneshot::channel();
            let waiter = Waiter { id: waiter_id, tx };

            match state.entries.get_mut(&key) {
                Some(entry) => {
                    if entry.cancelled {
                        // Still running; take it back instead of starting a second job
                        entry.cancelled = false;
                        tracing::debug!(key = %key, "Reviving cancelled job");
                    } else {
                        tracing::debug!(key = %key, waiters = entry.waiters.len() + 1, "Coalescing onto existing job");
                    }
                    entry.waiters.push(waiter);
                }
                None => {
                    state.entries.insert(
                        key.clone(),
                        QueueEntry {
                            enqueued_at: Instant::now(),
                            run: Some(producer),
                            running: false,
                            cancelled: false,
                            waiters: vec![waiter],
                        },
                    );
                    state.queue.push_back(key.clone());
                    self.admit(&mut state, &mut admitted);
                }
            }

            Ticket::Pending { key, waiter_id, rx }
        };

        self.start(admitted);
        ticket
    }

    /// Cancel `key` for every waiter.
    ///
    /// A queued entry is removed without using a slot and its producer never
    /// runs. A running entry keeps its slot until it finishes, but its result
    /// is neither cached nor delivered.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let mut state = self.inner.state.lock();
        Self::cancel_locked(&mut state, key)
    }

    /// Drop one waiter. The entry is cancelled once nobody is waiting on it.
    pub fn detach(&self, key: &CacheKey, waiter_id: u64) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        entry.waiters.retain(|w| w.id != waiter_id);
        if entry.waiters.is_empty() {
            Self::cancel_locked(&mut state, key);
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            active: state.active_count,
            queued: state.queue.len(),
            max_concurrency: self.inner.max_concurrency,
            cached: self.inner.cache.len(),
        }
    }

    fn cancel_locked(state: &mut SchedulerState, key: &CacheKey) -> bool {
        let running = match state.entries.get(key) {
            Some(entry) => entry.running,
            None => return false,
        };

        if running {
            if let Some(entry) = state.entries.get_mut(key) {
                entry.cancelled = true;
                entry.waiters.clear();
            }
            tracing::debug!(key = %key, "Cancelled running job; result will be discarded");
        } else {
            if let Some(entry) = state.entries.remove(key) {
                tracing::debug!(
                    key = %key,
                    queued_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                    "Cancelled queued job"
                );
            }
            state.queue.retain(|queued| queued != key);
        }
        true
    }

    /// Move queued entries into free slots
    fn admit(&self, state: &mut SchedulerState, admitted: &mut Vec<(CacheKey, Producer)>) {
        while state.active_count < self.inner.max_concurrency {
            let Some(key) = state.queue.pop_front() else {
                break;
            };
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };
            let Some(run) = entry.run.take() else {
                continue;
            };
            entry.running = true;
            state.active_count += 1;
            tracing::trace!(key = %key, active = state.active_count, "Admitted job");
            admitted.push((key, run));
        }
    }

    fn start(&self, admitted: Vec<(CacheKey, Producer)>) {
        for (key, run) in admitted {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let output = AssertUnwindSafe(async move { run().await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(ConversionFailure::unknown("preview producer panicked")));
                scheduler.complete(key, output);
            });
        }
    }

    fn complete(&self, key: CacheKey, output: ProducerOutput) {
        let mut admitted = Vec::new();

        let delivery = {
            let mut state = self.inner.state.lock();
            state.active_count = state.active_count.saturating_sub(1);

            let delivery = match state.entries.remove(&key) {
                Some(entry) if !entry.cancelled => {
                    let outcome = match output {
                        Ok(image) => Ok(self.inner.cache.insert(key.clone(), image)),
                        Err(failure) => {
                            tracing::debug!(key = %key, kind = %failure.kind, "Preview failed, not cached");
                            Err(failure)
                        }
                    };
                    Some((entry.waiters, outcome))
                }
                Some(_) => {
                    tracing::debug!(key = %key, "Discarding result of cancelled job");
                    None
                }
                None => None,
            };

            self.admit(&mut state, &mut admitted);
            delivery
        };

        if let Some((waiters, outcome)) = delivery {
            for waiter in waiters {
                let _ = waiter.tx.send(outcome.clone());
            }
        }
        self.start(admitted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn image() -> PreviewImage {
        PreviewImage::new(vec![0xff, 0xd8, 0xff], "image/jpeg")
    }

    fn scheduler(max: usize) -> RenderScheduler {
        RenderScheduler::new(Arc::new(ThumbnailCache::new(16)), max)
    }

    fn must_not_run() -> ProducerOutput {
        panic!("producer must not run");
    }

    fn explode() -> ProducerOutput {
        panic!("decoder exploded");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Producer that records its start and waits for its gate
    fn gated(
        started: Arc<AtomicUsize>,
        gate: oneshot::Receiver<()>,
    ) -> impl FnOnce() -> BoxFuture<'static, ProducerOutput> + Send + 'static {
        move || {
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                let _ = gate.await;
                Ok(image())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_fifo() {
        let scheduler = scheduler(3);
        let started = Arc::new(AtomicUsize::new(0));
        let mut gates = Vec::new();
        let mut tickets = Vec::new();

        for n in 0..5 {
            let (tx, rx) = oneshot::channel();
            gates.push(tx);
            tickets.push(scheduler.enqueue(CacheKey::new(format!("doc-{}", n)), gated(started.clone(), rx)));
        }

        let stats = scheduler.stats();
        assert_eq!((stats.active, stats.queued), (3, 2));
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 3);

        // Finish job 1; job 4 takes its slot
        gates.remove(0).send(()).unwrap();
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 4);
        let stats = scheduler.stats();
        assert_eq!((stats.active, stats.queued), (3, 1));

        for gate in gates {
            let _ = gate.send(());
        }
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 5);

        for ticket in tickets {
            assert!(ticket.wait().await.is_ok());
        }
        let stats = scheduler.stats();
        assert_eq!((stats.active, stats.queued, stats.cached), (0, 0, 5));
    }

    #[tokio::test]
    async fn test_active_never_exceeds_max() {
        let scheduler = scheduler(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tickets: Vec<_> = (0..20)
            .map(|n| {
                let current = current.clone();
                let peak = peak.clone();
                // Some keys repeat so coalescing is exercised too
                scheduler.enqueue(CacheKey::new(format!("doc-{}", n % 13)), move || async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(image())
                })
            })
            .collect();

        for ticket in tickets {
            assert!(scheduler.stats().active <= 2);
            ticket.wait().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.stats().cached, 13);
    }

    #[tokio::test]
    async fn test_same_key_coalesces() {
        let scheduler = scheduler(3);
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let first = scheduler.enqueue("doc-42".into(), gated(calls.clone(), rx));
        let second = scheduler.enqueue("doc-42".into(), || async { must_not_run() });
        tx.send(()).unwrap();

        let a = first.wait().await.unwrap();
        let b = second.wait().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(a.same_as(&b));
        assert_eq!(a.image(), b.image());
    }

    #[tokio::test]
    async fn test_cached_key_returns_immediately() {
        let scheduler = scheduler(3);
        scheduler
            .enqueue("doc-7".into(), || async { Ok(image()) })
            .wait()
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ticket = scheduler.enqueue("doc-7".into(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(image())
        });

        assert!(ticket.is_ready());
        assert_eq!(scheduler.stats().active, 0);
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_admission() {
        let scheduler = scheduler(1);
        let started = Arc::new(AtomicUsize::new(0));
        let (gate, rx) = oneshot::channel();
        let _running = scheduler.enqueue("a".into(), gated(started.clone(), rx));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let queued = scheduler.enqueue("b".into(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(image())
        });
        assert_eq!(scheduler.stats().queued, 1);

        assert!(scheduler.cancel(&"b".into()));
        let stats = scheduler.stats();
        assert_eq!((stats.active, stats.queued), (1, 0));
        assert!(matches!(queued.wait().await, Err(RenderError::Cancelled)));

        gate.send(()).unwrap();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.stats().active, 0);
    }

    #[tokio::test]
    async fn test_cancel_running_discards_result() {
        let scheduler = scheduler(1);
        let started = Arc::new(AtomicUsize::new(0));
        let (gate, rx) = oneshot::channel();
        let ticket = scheduler.enqueue("a".into(), gated(started.clone(), rx));
        settle().await;

        assert!(scheduler.cancel(&"a".into()));
        // Slot stays occupied until the job finishes
        assert_eq!(scheduler.stats().active, 1);
        assert!(matches!(ticket.wait().await, Err(RenderError::Cancelled)));

        gate.send(()).unwrap();
        settle().await;
        let stats = scheduler.stats();
        assert_eq!((stats.active, stats.cached), (0, 0));
    }

    #[tokio::test]
    async fn test_reenqueue_revives_running_job() {
        let scheduler = scheduler(2);
        let started = Arc::new(AtomicUsize::new(0));
        let (gate, rx) = oneshot::channel();
        let _first = scheduler.enqueue("a".into(), gated(started.clone(), rx));
        settle().await;
        scheduler.cancel(&"a".into());

        let second = scheduler.enqueue("a".into(), || async { must_not_run() });
        assert_eq!(scheduler.stats().active, 1);

        gate.send(()).unwrap();
        assert!(second.wait().await.is_ok());
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(scheduler.cache().contains(&"a".into()));
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let scheduler = scheduler(2);
        let failing = scheduler.enqueue("bad".into(), || async {
            Err(ConversionFailure::new(ErrorKind::DecodeFailure, "no xref"))
        });
        match failing.wait().await {
            Err(RenderError::Failed(failure)) => assert_eq!(failure.kind, ErrorKind::DecodeFailure),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(scheduler.stats().cached, 0);

        // A later request tries again from scratch
        let retry = scheduler.enqueue("bad".into(), || async { Ok(image()) });
        assert!(!retry.is_ready());
        assert!(retry.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_producer_frees_slot() {
        let scheduler = scheduler(1);
        let ticket = scheduler.enqueue("boom".into(), || async { explode() });
        match ticket.wait().await {
            Err(RenderError::Failed(failure)) => assert_eq!(failure.kind, ErrorKind::Unknown),
            other => panic!("expected failure, got {:?}", other),
        }

        let next = scheduler.enqueue("ok".into(), || async { Ok(image()) });
        assert!(next.wait().await.is_ok());
        assert_eq!(scheduler.stats().active, 0);
    }

    #[tokio::test]
    async fn test_detach_cancels_when_last_waiter_leaves() {
        let scheduler = scheduler(1);
        let started = Arc::new(AtomicUsize::new(0));
        let (gate, rx) = oneshot::channel();
        let _blocker = scheduler.enqueue("blocker".into(), gated(started.clone(), rx));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let first = scheduler.enqueue("shared".into(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(image())
        });
        let second = scheduler.enqueue("shared".into(), || async { Ok(image()) });

        scheduler.detach(&"shared".into(), first.waiter_id().unwrap());
        assert_eq!(scheduler.stats().queued, 1, "one waiter left");

        scheduler.detach(&"shared".into(), second.waiter_id().unwrap());
        assert_eq!(scheduler.stats().queued, 0);

        gate.send(()).unwrap();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

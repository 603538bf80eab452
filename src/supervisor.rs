//! Conversion supervisor
//!
//! Runs a pool of isolated [`WorkerHandle`]s and correlates their responses
//! back to callers by request id. Several requests may be in flight on the
//! same worker. A supervisor-side backstop covers the case where a worker
//! never answers at all: the caller gets a `Timeout` and the stalled worker
//! is detached and replaced. The backstop is the request deadline grown by
//! input size (see [`SupervisorConfig::backstop`]) plus a grace period.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::{SupervisorConfig, WorkerConfig};
use crate::decoder::MINIMAL_PDF;
use crate::error::{ConversionFailure, ErrorKind, ServiceError};
use crate::protocol::{ConversionRequest, ConversionResult, WorkerRequest, WorkerResponse};
use crate::source::SourceRef;
use crate::worker::{Converter, Dispatch, RequestLimits, WorkerHandle};

/// Minimum requests before an unhealthy worker is recycled
const HEALTH_MIN_REQUESTS: u64 = 3;
const HEALTH_MAX_FAILURE_RATE: f64 = 0.2;
const HEALTH_MAX_AVG_PROCESSING: Duration = Duration::from_secs(10);
/// A worker that failed this recently is avoided when dispatching
const HEALTH_RECENT_FAILURE: Duration = Duration::from_secs(30);

const WARMUP_DEADLINE: Duration = Duration::from_secs(5);

/// Per-worker health counters
#[derive(Debug, Clone, Default)]
pub struct WorkerHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub total_processing: Duration,
    pub last_failure: Option<Instant>,
}

impl WorkerHealth {
    pub fn request_count(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn failure_rate(&self) -> f64 {
        match self.request_count() {
            0 => 0.0,
            n => self.failure_count as f64 / n as f64,
        }
    }

    pub fn avg_processing(&self) -> Duration {
        match self.request_count() {
            0 => Duration::ZERO,
            n => self.total_processing / n as u32,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Instant::now())
    }

    pub fn is_healthy_at(&self, now: Instant) -> bool {
        let failed_recently = self
            .last_failure
            .is_some_and(|at| now.saturating_duration_since(at) < HEALTH_RECENT_FAILURE);
        self.failure_rate() <= HEALTH_MAX_FAILURE_RATE
            && self.avg_processing() <= HEALTH_MAX_AVG_PROCESSING
            && !failed_recently
    }

    /// Unhealthy with enough requests behind the verdict
    pub fn needs_recycle(&self) -> bool {
        self.request_count() >= HEALTH_MIN_REQUESTS && !self.is_healthy()
    }

    fn record(&mut self, result: &ConversionResult, elapsed: Duration) {
        self.total_processing += elapsed;
        match result.error_kind() {
            // Bad documents are not the worker's fault
            None | Some(ErrorKind::DecodeFailure) | Some(ErrorKind::SizeExceeded) => {
                self.success_count += 1
            }
            Some(_) => {
                self.failure_count += 1;
                self.last_failure = Some(Instant::now());
            }
        }
    }
}

/// Snapshot of one worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: u64,
    pub in_flight: usize,
    pub success_count: u64,
    pub failure_count: u64,
    pub failure_rate: f64,
    pub avg_processing_ms: u64,
    pub is_healthy: bool,
}

/// Snapshot of the pool
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub pending_requests: usize,
    pub max_workers: usize,
    pub workers: Vec<WorkerStats>,
}

struct WorkerSlot {
    handle: WorkerHandle,
    in_flight: usize,
    health: WorkerHealth,
}

struct PendingRequest {
    reply: oneshot::Sender<ConversionResult>,
    worker_id: u64,
    started: Instant,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<WorkerSlot>,
    pending: HashMap<String, PendingRequest>,
    shut_down: bool,
}

impl PoolState {
    fn slot_mut(&mut self, worker_id: u64) -> Option<&mut WorkerSlot> {
        self.workers.iter_mut().find(|s| s.handle.id() == worker_id)
    }

    /// Least busy healthy worker, or least busy of any if none is healthy
    fn pick_worker(&mut self) -> Option<&mut WorkerSlot> {
        let any_healthy = self
            .workers
            .iter()
            .any(|s| s.health.is_healthy() && !s.handle.is_closed());
        self.workers
            .iter_mut()
            .filter(|s| !s.handle.is_closed())
            .filter(|s| !any_healthy || s.health.is_healthy())
            .min_by_key(|s| s.in_flight)
    }
}

struct SupervisorInner {
    config: SupervisorConfig,
    converter: Arc<dyn Converter>,
    state: Mutex<PoolState>,
    next_worker_id: AtomicU64,
}

/// Dispatches conversions to a pool of isolated workers
#[derive(Clone)]
pub struct ConversionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConversionSupervisor {
    /// Start `config.pool_size` workers, each hosting `converter` on its own
    /// thread. Must be called from within a Tokio runtime.
    pub fn start(converter: Arc<dyn Converter>, config: SupervisorConfig) -> Result<Self, ServiceError> {
        let pool_size = config.pool_size.max(1);
        let supervisor = Self {
            inner: Arc::new(SupervisorInner {
                config,
                converter,
                state: Mutex::new(PoolState::default()),
                next_worker_id: AtomicU64::new(1),
            }),
        };

        for _ in 0..pool_size {
            supervisor.inner.spawn_worker()?;
        }

        tracing::info!(workers = pool_size, "Conversion supervisor started");
        Ok(supervisor)
    }

    /// Submit a request and wait for its result.
    ///
    /// Always yields exactly one result carrying the request's id. Retryable
    /// failures are retried with backoff only when the retry policy allows.
    pub async fn submit(&self, request: ConversionRequest) -> ConversionResult {
        let policy = &self.inner.config.retry;
        let mut attempt = 0;
        loop {
            let mut attempt_request = request.clone();
            if attempt > 0 {
                // Fresh wire id so a late reply to an earlier attempt cannot match
                attempt_request.id = format!("{}#{}", request.id, attempt);
            }

            let result = self.submit_once(attempt_request).await;
            match result.error_kind() {
                Some(kind) if kind.is_retryable() && attempt < policy.max_retries => {
                    let delay = policy.delay_for(attempt);
                    tracing::debug!(id = %request.id, attempt, ?delay, kind = %kind, "Retrying conversion");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => return with_id(result, &request.id),
            }
        }
    }

    async fn submit_once(&self, request: ConversionRequest) -> ConversionResult {
        let id = request.id.clone();

        // The size guard runs on the caller side too, so oversized documents
        // are never copied across the boundary
        let data = match request.source.load_bounded(request.max_bytes).await {
            Ok(data) => data,
            Err(failure) => return ConversionResult::failure(id, failure),
        };

        let backstop = self.inner.config.backstop(request.deadline, data.len() as u64);
        let (reply, rx) = oneshot::channel();
        let dispatch = Dispatch {
            message: WorkerRequest::convert(id.clone(), data, Some(request.output_quality)),
            limits: RequestLimits::from(&request),
        };

        let worker_id = match self.inner.dispatch(&id, dispatch, reply) {
            Ok(worker_id) => worker_id,
            Err(failure) => return ConversionResult::failure(id, failure),
        };

        match tokio::time::timeout(backstop, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => ConversionResult::failure(
                id,
                ConversionFailure::unknown("conversion worker exited before replying"),
            ),
            Err(_) => {
                if self.inner.abandon(&id) {
                    tracing::warn!(id = %id, worker = worker_id, backstop_ms = backstop.as_millis() as u64, "Worker missed backstop deadline, detaching");
                    self.inner.recycle(worker_id, "missed backstop deadline");
                }
                ConversionResult::failure(id, ConversionFailure::timeout(backstop.as_millis() as u64))
            }
        }
    }

    /// Convert a minimal document on every worker so first real requests
    /// do not pay start-up costs. Failures are logged and ignored.
    pub async fn warmup(&self, worker: &WorkerConfig) {
        let workers = self.inner.state.lock().workers.len();
        let started = Instant::now();

        let requests = (0..workers).map(|_| {
            let request = ConversionRequest::new(SourceRef::from_bytes(MINIMAL_PDF.to_vec()), worker)
                .with_deadline(WARMUP_DEADLINE);
            self.submit(request)
        });
        let results = futures::future::join_all(requests).await;

        let failed = results.iter().filter(|r| !r.is_success()).count();
        if failed > 0 {
            tracing::warn!(failed, workers, "Worker warmup had failures (non-fatal)");
        } else {
            tracing::info!(workers, elapsed_ms = started.elapsed().as_millis() as u64, "Workers warmed up");
        }
    }

    pub fn stats(&self) -> SupervisorStats {
        let state = self.inner.state.lock();
        SupervisorStats {
            total_workers: state.workers.len(),
            busy_workers: state.workers.iter().filter(|s| s.in_flight > 0).count(),
            pending_requests: state.pending.len(),
            max_workers: self.inner.config.pool_size,
            workers: state
                .workers
                .iter()
                .map(|s| WorkerStats {
                    id: s.handle.id(),
                    in_flight: s.in_flight,
                    success_count: s.health.success_count,
                    failure_count: s.health.failure_count,
                    failure_rate: s.health.failure_rate(),
                    avg_processing_ms: s.health.avg_processing().as_millis() as u64,
                    is_healthy: s.health.is_healthy(),
                })
                .collect(),
        }
    }

    /// Fail every pending request and close all workers
    pub fn shutdown(&self) {
        let (workers, pending) = {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            let workers: Vec<_> = state.workers.drain(..).collect();
            let pending: Vec<_> = state.pending.drain().collect();
            (workers, pending)
        };

        for (id, request) in pending {
            let _ = request.reply.send(ConversionResult::failure(
                id,
                ConversionFailure::unknown("conversion supervisor shut down"),
            ));
        }
        tracing::info!(workers = workers.len(), "Conversion supervisor shut down");
        drop(workers);
    }
}

#[async_trait]
impl Converter for ConversionSupervisor {
    async fn convert(&self, request: ConversionRequest) -> ConversionResult {
        self.submit(request).await
    }
}

impl SupervisorInner {
    fn spawn_worker(self: &Arc<Self>) -> Result<u64, ServiceError> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (handle, responses) = WorkerHandle::spawn(id, Arc::clone(&self.converter))?;

        self.state.lock().workers.push(WorkerSlot {
            handle,
            in_flight: 0,
            health: WorkerHealth::default(),
        });
        tokio::spawn(route_responses(Arc::downgrade(self), id, responses));

        tracing::debug!(worker = id, "Spawned conversion worker");
        Ok(id)
    }

    /// Register the pending request and hand it to a worker
    fn dispatch(
        self: &Arc<Self>,
        id: &str,
        dispatch: Dispatch,
        reply: oneshot::Sender<ConversionResult>,
    ) -> Result<u64, ConversionFailure> {
        let mut unsent = Some(dispatch);
        // One respawn attempt if every worker is gone
        for _ in 0..2 {
            let Some(dispatch) = unsent.take() else {
                break;
            };
            let dead_worker = {
                let mut state = self.state.lock();
                if state.shut_down {
                    return Err(ConversionFailure::unknown("conversion supervisor shut down"));
                }
                match state.pick_worker() {
                    None => {
                        unsent = Some(dispatch);
                        None
                    }
                    Some(slot) => match slot.handle.send(dispatch) {
                        Ok(()) => {
                            slot.in_flight += 1;
                            let worker_id = slot.handle.id();
                            state.pending.insert(
                                id.to_string(),
                                PendingRequest {
                                    reply,
                                    worker_id,
                                    started: Instant::now(),
                                },
                            );
                            return Ok(worker_id);
                        }
                        Err(returned) => {
                            unsent = Some(returned);
                            Some(slot.handle.id())
                        }
                    },
                }
            };

            match dead_worker {
                Some(dead_worker) => self.recycle(dead_worker, "request channel closed"),
                None => {
                    if let Err(e) = self.spawn_worker() {
                        tracing::error!("Failed to respawn conversion worker: {}", e);
                        break;
                    }
                }
            }
        }
        Err(ConversionFailure::unknown("no conversion worker available"))
    }

    /// Route a worker response to its pending caller
    fn complete(self: &Arc<Self>, worker_id: u64, response: WorkerResponse) {
        let (pending, result, unhealthy) = {
            let mut state = self.state.lock();
            let Some(pending) = state.pending.remove(response.id()) else {
                tracing::debug!(id = response.id(), worker = worker_id, "Discarding late response");
                return;
            };
            if pending.worker_id != worker_id {
                tracing::warn!(
                    id = response.id(),
                    expected = pending.worker_id,
                    worker = worker_id,
                    "Ignoring response from wrong worker"
                );
                state.pending.insert(response.id().to_string(), pending);
                return;
            }

            let result = ConversionResult::from(response);
            let elapsed = pending.started.elapsed();
            let unhealthy = match state.slot_mut(worker_id) {
                Some(slot) => {
                    slot.in_flight = slot.in_flight.saturating_sub(1);
                    slot.health.record(&result, elapsed);
                    slot.health.needs_recycle()
                }
                None => false,
            };
            (pending, result, unhealthy)
        };

        // Caller may have hit the backstop already
        let _ = pending.reply.send(result);

        if unhealthy {
            self.recycle(worker_id, "unhealthy");
        }
    }

    /// Forget a pending request after the backstop fired. Returns true if
    /// the worker still owed a reply.
    fn abandon(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.remove(id) else {
            return false;
        };
        if let Some(slot) = state.slot_mut(pending.worker_id) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            slot.health.failure_count += 1;
            slot.health.total_processing += pending.started.elapsed();
            slot.health.last_failure = Some(Instant::now());
        }
        true
    }

    /// Detach a worker and start a replacement. Requests already sent to the
    /// detached worker keep their pending entries until it answers or exits.
    fn recycle(self: &Arc<Self>, worker_id: u64, reason: &str) {
        let detached = {
            let mut state = self.state.lock();
            let position = state.workers.iter().position(|s| s.handle.id() == worker_id);
            position.map(|index| state.workers.remove(index))
        };
        let Some(slot) = detached else {
            return;
        };

        tracing::warn!(
            worker = worker_id,
            reason,
            in_flight = slot.in_flight,
            failure_rate = slot.health.failure_rate(),
            "Recycling conversion worker"
        );
        drop(slot);
        self.replenish();
    }

    /// Called when a worker's response channel closes
    fn worker_exited(self: &Arc<Self>, worker_id: u64) {
        let (was_attached, orphaned) = {
            let mut state = self.state.lock();
            let position = state.workers.iter().position(|s| s.handle.id() == worker_id);
            let was_attached = position.map(|index| state.workers.remove(index)).is_some();
            let orphaned: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, p)| p.worker_id == worker_id)
                .map(|(id, _)| id.clone())
                .collect();
            let orphaned: Vec<_> = orphaned
                .into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|p| (id, p)))
                .collect();
            (was_attached, orphaned)
        };

        if was_attached {
            tracing::error!(worker = worker_id, pending = orphaned.len(), "Conversion worker exited unexpectedly");
        } else {
            tracing::debug!(worker = worker_id, "Detached conversion worker stopped");
        }

        for (id, pending) in orphaned {
            let _ = pending.reply.send(ConversionResult::failure(
                id,
                ConversionFailure::unknown("conversion worker exited"),
            ));
        }

        if was_attached {
            self.replenish();
        }
    }

    fn replenish(self: &Arc<Self>) {
        let missing = {
            let state = self.state.lock();
            if state.shut_down {
                return;
            }
            self.config.pool_size.saturating_sub(state.workers.len())
        };
        for _ in 0..missing {
            if let Err(e) = self.spawn_worker() {
                tracing::error!("Failed to spawn replacement worker: {}", e);
                return;
            }
        }
    }
}

async fn route_responses(
    inner: Weak<SupervisorInner>,
    worker_id: u64,
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
) {
    while let Some(response) = responses.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.complete(worker_id, response);
    }
    if let Some(inner) = inner.upgrade() {
        inner.worker_exited(worker_id);
    }
}

fn with_id(result: ConversionResult, id: &str) -> ConversionResult {
    match result {
        ConversionResult::Success {
            image_bytes,
            mime_type,
            ..
        } => ConversionResult::Success {
            id: id.to_string(),
            image_bytes,
            mime_type,
        },
        ConversionResult::Failure {
            error_kind, message, ..
        } => ConversionResult::Failure {
            id: id.to_string(),
            error_kind,
            message,
        },
    }
}

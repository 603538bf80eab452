//! Isolated conversion worker
//!
//! [`ConversionWorker`] runs the decode + encode pipeline for one request:
//! size guard first, then the pipeline on a blocking thread raced against
//! the request deadline. [`WorkerHandle`] hosts a converter on its own OS
//! thread with its own runtime, so a wedged or crashing decoder never shares
//! a failure domain with the caller.
//!
//! ```text
//! caller ──Dispatch──▶ [preview-worker-N thread]
//!                         ├─ spawn_blocking(decode → encode)
//!                         └─ sleep(deadline)      first one wins
//! caller ◀─WorkerResponse─┘
//! ```

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::WorkerConfig;
use crate::decoder::{DecodeLimits, DocumentDecoder};
use crate::encoder::{EncodedImage, ImageEncoder};
use crate::error::{ConversionError, ConversionFailure};
use crate::protocol::{ConversionRequest, ConversionResult, WorkerRequest, WorkerResponse};
use crate::source::SourceRef;

/// Anything that can turn a request into exactly one result
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, request: ConversionRequest) -> ConversionResult;
}

/// Decode + encode pipeline with a size ceiling and a deadline
pub struct ConversionWorker {
    decoder: Arc<dyn DocumentDecoder>,
    encoder: ImageEncoder,
    limits: DecodeLimits,
}

impl ConversionWorker {
    pub fn new(decoder: Arc<dyn DocumentDecoder>, config: &WorkerConfig) -> Self {
        Self {
            decoder,
            encoder: ImageEncoder::from_config(config),
            limits: DecodeLimits {
                max_bitmap_pixels: config.max_bitmap_pixels,
            },
        }
    }

    /// Convert one request.
    ///
    /// Oversized sources fail with `SizeExceeded` before the decoder is
    /// touched. If the deadline fires first the pipeline keeps running on its
    /// blocking thread until it finishes on its own; its result is discarded
    /// and everything it allocated is dropped there.
    pub async fn run(&self, request: ConversionRequest) -> ConversionResult {
        let started = Instant::now();
        let id = request.id.clone();

        let data = match request.source.load_bounded(request.max_bytes).await {
            Ok(data) => data,
            Err(failure) => {
                tracing::debug!(id = %id, error = %failure, "Rejected before decode");
                return ConversionResult::failure(id, failure);
            }
        };
        let size = data.len();

        let abandoned = Arc::new(AtomicBool::new(false));
        let pipeline = {
            let decoder = Arc::clone(&self.decoder);
            let encoder = self.encoder;
            let limits = self.limits;
            let abandoned = Arc::clone(&abandoned);
            let scale = request.target_scale;
            let quality = request.output_quality;
            tokio::task::spawn_blocking(move || {
                run_pipeline(&data, decoder.as_ref(), encoder, &limits, scale, quality, &abandoned)
            })
        };

        let outcome = tokio::select! {
            biased;
            joined = pipeline => match joined {
                Ok(result) => result.map_err(ConversionError::into_failure),
                Err(join_err) if join_err.is_panic() => {
                    Err(ConversionError::Panicked(panic_message(join_err.into_panic())).into_failure())
                }
                Err(join_err) => Err(ConversionFailure::unknown(format!("Task join error: {}", join_err))),
            },
            _ = tokio::time::sleep(request.deadline) => {
                abandoned.store(true, Ordering::SeqCst);
                Err(ConversionFailure::timeout(request.deadline_ms()))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(encoded) => {
                tracing::debug!(
                    id = %id,
                    size,
                    width = encoded.width,
                    height = encoded.height,
                    bytes = encoded.data.len(),
                    elapsed_ms,
                    "Preview converted"
                );
                ConversionResult::success(id, encoded.data, encoded.mime_type)
            }
            Err(failure) => {
                tracing::warn!(id = %id, size, elapsed_ms, kind = %failure.kind, "Conversion failed: {}", failure.message);
                ConversionResult::failure(id, failure)
            }
        }
    }
}

#[async_trait]
impl Converter for ConversionWorker {
    async fn convert(&self, request: ConversionRequest) -> ConversionResult {
        self.run(request).await
    }
}

fn run_pipeline(
    data: &[u8],
    decoder: &dyn DocumentDecoder,
    encoder: ImageEncoder,
    limits: &DecodeLimits,
    scale: f32,
    quality: u8,
    abandoned: &AtomicBool,
) -> Result<EncodedImage, ConversionError> {
    let bitmap = decoder.decode_first_page(data, scale, limits)?;
    if abandoned.load(Ordering::SeqCst) {
        // Nobody is waiting; skip the encode and release the bitmap now
        return Err(ConversionError::Decode("abandoned after deadline".to_string()));
    }
    encoder.encode(bitmap, quality)
}

fn panic_message(payload: Box<dyn std::any::Any + Send + 'static>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Per-request limits that travel alongside the wire message
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_bytes: u64,
    pub deadline: Duration,
    pub target_scale: f32,
    pub default_quality: u8,
}

impl From<&ConversionRequest> for RequestLimits {
    fn from(request: &ConversionRequest) -> Self {
        Self {
            max_bytes: request.max_bytes,
            deadline: request.deadline,
            target_scale: request.target_scale,
            default_quality: request.output_quality,
        }
    }
}

/// A wire request plus its limits, as handed to a worker thread
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub message: WorkerRequest,
    pub limits: RequestLimits,
}

impl Dispatch {
    fn into_request(self) -> ConversionRequest {
        match self.message {
            WorkerRequest::Convert { id, data, options } => ConversionRequest {
                id,
                source: SourceRef::Bytes(data),
                max_bytes: self.limits.max_bytes,
                deadline: self.limits.deadline,
                target_scale: self.limits.target_scale,
                output_quality: options
                    .and_then(|o| o.quality)
                    .unwrap_or(self.limits.default_quality)
                    .clamp(1, 100),
            },
        }
    }
}

/// Handle to a converter running on a dedicated thread.
///
/// Dropping the handle closes the request channel; the thread finishes the
/// conversions it already accepted (each bounded by its own deadline), then
/// exits and closes the response channel.
pub struct WorkerHandle {
    id: u64,
    requests: mpsc::UnboundedSender<Dispatch>,
}

impl WorkerHandle {
    /// Start a worker thread. Returns the handle and the receiving end of
    /// its response channel.
    pub fn spawn(
        id: u64,
        converter: Arc<dyn Converter>,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<WorkerResponse>)> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name(format!("preview-worker-{}", id))
            .spawn(move || worker_main(id, converter, request_rx, response_tx))?;

        Ok((
            Self {
                id,
                requests: request_tx,
            },
            response_rx,
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Hand a request to the worker. Fails if the worker thread is gone.
    pub fn send(&self, dispatch: Dispatch) -> Result<(), Dispatch> {
        self.requests.send(dispatch).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

fn worker_main(
    id: u64,
    converter: Arc<dyn Converter>,
    mut requests: mpsc::UnboundedReceiver<Dispatch>,
    responses: mpsc::UnboundedSender<WorkerResponse>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(worker = id, "Failed to build worker runtime: {}", e);
            return;
        }
    };

    tracing::debug!(worker = id, "Conversion worker started");

    runtime.block_on(async move {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                dispatch = requests.recv() => match dispatch {
                    Some(dispatch) => {
                        let converter = Arc::clone(&converter);
                        let responses = responses.clone();
                        in_flight.spawn(async move {
                            let request = dispatch.into_request();
                            let request_id = request.id.clone();
                            let result = match AssertUnwindSafe(converter.convert(request)).catch_unwind().await {
                                Ok(result) => result,
                                Err(payload) => {
                                    let message = panic_message(payload);
                                    tracing::error!(worker = id, id = %request_id, "Converter panicked: {}", message);
                                    ConversionResult::failure(
                                        request_id,
                                        ConversionFailure::unknown(format!("converter panicked: {}", message)),
                                    )
                                }
                            };
                            // Receiver gone means the supervisor detached us
                            let _ = responses.send(WorkerResponse::from(result));
                        });
                    }
                    None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(worker = id, "Conversion task failed: {}", e);
                    }
                }
            }
        }
        while in_flight.join_next().await.is_some() {}
    });

    // Do not wait for abandoned pipelines still running on the blocking pool
    runtime.shutdown_background();
    tracing::debug!(worker = id, "Conversion worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::testing::{FailingDecoder, FakeDecoder, PanickingDecoder};
    use crate::error::ErrorKind;
    use std::sync::atomic::Ordering;

    fn config() -> WorkerConfig {
        WorkerConfig {
            max_bytes: 1024,
            deadline: Duration::from_millis(2_000),
            ..WorkerConfig::default()
        }
    }

    fn request(bytes: usize, config: &WorkerConfig) -> ConversionRequest {
        ConversionRequest::new(SourceRef::from_bytes(vec![0u8; bytes]), config)
    }

    #[tokio::test]
    async fn test_success_returns_jpeg() {
        let config = config();
        let worker = ConversionWorker::new(Arc::new(FakeDecoder::new(1600, 2400)), &config);

        let req = request(100, &config);
        let id = req.id.clone();
        match worker.run(req).await {
            ConversionResult::Success {
                id: got,
                image_bytes,
                mime_type,
            } => {
                assert_eq!(got, id);
                assert_eq!(mime_type, "image/jpeg");
                let decoded = image::load_from_memory(&image_bytes).unwrap();
                assert_eq!((decoded.width(), decoded.height()), (800, 1200));
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_never_reaches_decoder() {
        let config = config();
        let decoder = FakeDecoder::new(10, 10);
        let calls = decoder.calls();
        let worker = ConversionWorker::new(Arc::new(decoder), &config);

        let result = worker.run(request(1025, &config)).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::SizeExceeded));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deadline_wins_over_slow_decode() {
        let config = config();
        let decoder = FakeDecoder::slow(Duration::from_millis(500));
        let worker = ConversionWorker::new(Arc::new(decoder), &config);

        let started = Instant::now();
        let result = worker
            .run(request(10, &config).with_deadline(Duration::from_millis(100)))
            .await;
        let elapsed = started.elapsed();

        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(400), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_decode_error_classified() {
        let config = config();
        let worker = ConversionWorker::new(Arc::new(FailingDecoder("cannot find xref")), &config);
        let result = worker.run(request(10, &config)).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::DecodeFailure));

        let worker = ConversionWorker::new(
            Arc::new(FailingDecoder("fz_malloc: out of memory")),
            &config,
        );
        let result = worker.run(request(10, &config)).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::MemoryExhausted));
    }

    #[tokio::test]
    async fn test_bitmap_budget_is_memory_exhausted() {
        let config = WorkerConfig {
            max_bitmap_pixels: 1_000,
            ..config()
        };
        let worker = ConversionWorker::new(Arc::new(FakeDecoder::new(612, 792)), &config);
        let result = worker.run(request(10, &config)).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::MemoryExhausted));
    }

    #[tokio::test]
    async fn test_decoder_panic_is_contained() {
        let config = config();
        let worker = ConversionWorker::new(Arc::new(PanickingDecoder), &config);
        let result = worker.run(request(10, &config)).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::DecodeFailure));
    }

    #[tokio::test]
    async fn test_worker_thread_round_trip() {
        let config = config();
        let worker: Arc<dyn Converter> =
            Arc::new(ConversionWorker::new(Arc::new(FakeDecoder::new(100, 100)), &config));
        let (handle, mut responses) = WorkerHandle::spawn(7, worker).unwrap();
        assert_eq!(handle.id(), 7);

        let req = request(10, &config);
        let limits = RequestLimits::from(&req);
        for n in 0..3 {
            let dispatch = Dispatch {
                message: WorkerRequest::convert(format!("req-{}", n), Arc::new(vec![0u8; 10]), Some(50)),
                limits,
            };
            handle.send(dispatch).unwrap();
        }

        let mut ids = Vec::new();
        for _ in 0..3 {
            match responses.recv().await.unwrap() {
                WorkerResponse::Success { id, content_type, .. } => {
                    assert_eq!(content_type, "image/jpeg");
                    ids.push(id);
                }
                other => panic!("expected success, got {:?}", other),
            }
        }
        ids.sort();
        assert_eq!(ids, vec!["req-0", "req-1", "req-2"]);

        // Closing the handle stops the thread and closes the response channel
        drop(handle);
        assert!(responses.recv().await.is_none());
    }

    struct PanickingConverter;

    #[async_trait]
    impl Converter for PanickingConverter {
        async fn convert(&self, _request: ConversionRequest) -> ConversionResult {
            panic!("converter blew up")
        }
    }

    #[tokio::test]
    async fn test_worker_thread_answers_converter_panic() {
        let config = config();
        let (handle, mut responses) = WorkerHandle::spawn(3, Arc::new(PanickingConverter)).unwrap();

        let req = request(10, &config);
        handle
            .send(Dispatch {
                message: WorkerRequest::convert("boom", Arc::new(vec![0u8; 10]), None),
                limits: RequestLimits::from(&req),
            })
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(1), responses.recv())
            .await
            .expect("panic must still produce a response")
            .unwrap();
        assert_eq!(response.id(), "boom");
        let result = ConversionResult::from(response);
        assert_eq!(result.error_kind(), Some(ErrorKind::Unknown));

        // The thread survives and keeps serving
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_worker_thread_enforces_size() {
        let config = config();
        let decoder = FakeDecoder::new(10, 10);
        let calls = decoder.calls();
        let worker: Arc<dyn Converter> = Arc::new(ConversionWorker::new(Arc::new(decoder), &config));
        let (handle, mut responses) = WorkerHandle::spawn(1, worker).unwrap();

        let req = request(10, &config);
        handle
            .send(Dispatch {
                message: WorkerRequest::convert("big", Arc::new(vec![0u8; 4096]), None),
                limits: RequestLimits::from(&req),
            })
            .unwrap();

        let result = ConversionResult::from(responses.recv().await.unwrap());
        assert_eq!(result.error_kind(), Some(ErrorKind::SizeExceeded));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

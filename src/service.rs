//! Preview service
//!
//! Wires the pieces together: a [`RenderScheduler`] in front, and behind it
//! either the isolated worker pool or the inline worker, depending on the
//! configured [`ConversionRoute`].

use std::sync::Arc;

use serde::Serialize;

use crate::cache::{CacheKey, PreviewHandle, ThumbnailCache};
use crate::config::{ConversionRoute, PreviewConfig};
use crate::decoder::DocumentDecoder;
use crate::error::ServiceError;
use crate::protocol::ConversionRequest;
use crate::scheduler::{RenderScheduler, SchedulerStats, Ticket};
use crate::source::SourceRef;
use crate::supervisor::{ConversionSupervisor, SupervisorStats};
use crate::worker::{ConversionWorker, Converter};

#[cfg(feature = "mupdf")]
use crate::decoder::MupdfDecoder;

/// Combined counters
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub scheduler: SchedulerStats,
    pub supervisor: Option<SupervisorStats>,
}

struct ServiceInner {
    config: PreviewConfig,
    scheduler: RenderScheduler,
    converter: Arc<dyn Converter>,
    supervisor: Option<ConversionSupervisor>,
}

/// Entry point for hosts that list documents
#[derive(Clone)]
pub struct PreviewService {
    inner: Arc<ServiceInner>,
}

impl PreviewService {
    /// Start with the MuPDF decoder. Must be called within a Tokio runtime.
    pub fn start(config: PreviewConfig) -> Result<Self, ServiceError> {
        #[cfg(feature = "mupdf")]
        {
            Self::with_decoder(config, Arc::new(MupdfDecoder::new()))
        }
        #[cfg(not(feature = "mupdf"))]
        {
            let _ = config;
            Err(ServiceError::DecoderUnavailable(
                "built without the `mupdf` feature".to_string(),
            ))
        }
    }

    pub fn with_decoder(
        config: PreviewConfig,
        decoder: Arc<dyn DocumentDecoder>,
    ) -> Result<Self, ServiceError> {
        let worker = Arc::new(ConversionWorker::new(decoder, &config.worker));

        match config.route {
            ConversionRoute::Inline => {
                tracing::info!("Preview conversions run inline");
                Ok(Self::build(config, worker, None))
            }
            ConversionRoute::Isolated => {
                let supervisor = ConversionSupervisor::start(worker, config.supervisor.clone())?;
                let converter: Arc<dyn Converter> = Arc::new(supervisor.clone());
                Ok(Self::build(config, converter, Some(supervisor)))
            }
        }
    }

    /// Use an arbitrary converter behind the scheduler
    pub fn with_converter(config: PreviewConfig, converter: Arc<dyn Converter>) -> Self {
        Self::build(config, converter, None)
    }

    fn build(
        config: PreviewConfig,
        converter: Arc<dyn Converter>,
        supervisor: Option<ConversionSupervisor>,
    ) -> Self {
        let cache = Arc::new(ThumbnailCache::new(config.cache.capacity));
        let scheduler = RenderScheduler::new(cache, config.scheduler.max_concurrency);
        Self {
            inner: Arc::new(ServiceInner {
                config,
                scheduler,
                converter,
                supervisor,
            }),
        }
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &RenderScheduler {
        &self.inner.scheduler
    }

    /// Ask for the preview of `key`. Served from cache when possible,
    /// otherwise queued behind the concurrency limit.
    pub fn request(&self, key: CacheKey, source: SourceRef) -> Ticket {
        let converter = Arc::clone(&self.inner.converter);
        let worker_config = self.inner.config.worker.clone();
        self.inner.scheduler.enqueue(key, move || async move {
            let request = ConversionRequest::new(source, &worker_config);
            converter.convert(request).await.into_outcome()
        })
    }

    pub fn cancel(&self, key: &CacheKey) -> bool {
        self.inner.scheduler.cancel(key)
    }

    pub fn detach(&self, key: &CacheKey, waiter_id: u64) {
        self.inner.scheduler.detach(key, waiter_id)
    }

    pub fn cached(&self, key: &CacheKey) -> Option<PreviewHandle> {
        self.inner.scheduler.cache().get(key)
    }

    pub fn evict(&self, key: &CacheKey) -> bool {
        self.inner.scheduler.cache().evict(key)
    }

    /// Warm the isolated workers, if any
    pub async fn warmup(&self) {
        if let Some(supervisor) = &self.inner.supervisor {
            supervisor.warmup(&self.inner.config.worker).await;
        }
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            scheduler: self.inner.scheduler.stats(),
            supervisor: self.inner.supervisor.as_ref().map(|s| s.stats()),
        }
    }

    /// Stop the workers and release every cached preview
    pub fn shutdown(&self) {
        if let Some(supervisor) = &self.inner.supervisor {
            supervisor.shutdown();
        }
        self.inner.scheduler.cache().clear();
        tracing::info!("Preview service shut down");
    }
}

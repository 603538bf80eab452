//! Configuration management for document previews
//!
//! Defaults follow the deployment sizing: production hosts get a larger
//! worker pool and size ceiling than staging/dev.

use std::env;
use std::str::FromStr;
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Extra backstop time per MB of input
const BACKSTOP_PER_MB_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct PreviewConfig {
    pub route: ConversionRoute,
    pub worker: WorkerConfig,
    pub supervisor: SupervisorConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
}

/// Where admitted jobs run their conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionRoute {
    /// Dispatch to isolated worker threads through the supervisor
    Isolated,
    /// Drive decoder + encoder directly on the blocking pool
    Inline,
}

/// Limits applied by a conversion worker to each request
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Size ceiling checked before the decoder runs
    pub max_bytes: u64,
    /// Data-plane deadline for decode + encode
    pub deadline: Duration,
    /// Rasterization scale for page 1 (1.0 = 72 dpi)
    pub target_scale: f32,
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Maximum preview width in pixels
    pub max_width: u32,
    /// Maximum preview height in pixels
    pub max_height: u32,
    /// Largest page bitmap the decoder may allocate
    pub max_bitmap_pixels: u64,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of isolated workers
    pub pool_size: usize,
    /// Added to the size-scaled deadline before the supervisor gives up on a worker
    pub grace: Duration,
    pub retry: RetryPolicy,
}

/// Retry with exponential backoff for retryable failure kinds
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 0 disables retries
    pub max_retries: u32,
    pub base_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached previews (LRU eviction)
    pub capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_bytes: 20 * MB,
            deadline: Duration::from_millis(12_000),
            target_scale: 1.0,
            quality: 70,
            max_width: 800,
            max_height: 1200,
            max_bitmap_pixels: 25_000_000,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            grace: Duration::from_millis(3_000),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl SupervisorConfig {
    /// Supervisor-side backstop for one request.
    ///
    /// The deadline grows by 500 ms per MB of input, capped at twice the
    /// deadline, and `grace` is added on top.
    pub fn backstop(&self, deadline: Duration, size_bytes: u64) -> Duration {
        let extra = Duration::from_millis(size_bytes.saturating_mul(BACKSTOP_PER_MB_MS) / MB);
        deadline
            .saturating_add(extra)
            .min(deadline.saturating_mul(2))
            .saturating_add(self.grace)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 500 }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        PreviewConfig {
            route: ConversionRoute::Isolated,
            worker: WorkerConfig::default(),
            supervisor: SupervisorConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl PreviewConfig {
    /// Production sizing: 4 workers, 8 concurrent conversions, 30 MB ceiling
    pub fn production() -> Self {
        let mut config = Self::default();
        config.supervisor.pool_size = 4;
        config.scheduler.max_concurrency = 8;
        config.worker.max_bytes = 30 * MB;
        config
    }

    pub fn from_env() -> Self {
        let production = env::var("PREVIEW_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);
        let mut config = if production {
            Self::production()
        } else {
            Self::default()
        };

        config.route = match env::var("PREVIEW_ROUTE")
            .unwrap_or_else(|_| "isolated".to_string())
            .to_lowercase()
            .as_str()
        {
            "inline" => ConversionRoute::Inline,
            _ => ConversionRoute::Isolated,
        };

        if let Some(size) = env_parse::<usize>("PREVIEW_WORKER_POOL_SIZE") {
            config.supervisor.pool_size = size.max(1);
        }
        if let Some(max) = env_parse::<usize>("PREVIEW_MAX_CONCURRENT_CONVERSIONS") {
            config.scheduler.max_concurrency = max.max(1);
        }
        if let Some(mb) = env_parse::<u64>("PREVIEW_MAX_SIZE_MB") {
            config.worker.max_bytes = megabytes(mb);
        }
        if let Some(quality) = env_parse::<u8>("PREVIEW_QUALITY") {
            config.worker.quality = quality.clamp(1, 100);
        }
        if let Some(ms) = env_parse::<u64>("PREVIEW_WORKER_TIMEOUT_MS") {
            config.worker.deadline = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("PREVIEW_SUPERVISOR_GRACE_MS") {
            config.supervisor.grace = Duration::from_millis(ms);
        }
        if let Some(scale) = env_parse::<f32>("PREVIEW_TARGET_SCALE") {
            config.worker.target_scale = scale.clamp(0.1, 4.0);
        }
        if let Some(width) = env_parse::<u32>("PREVIEW_MAX_WIDTH") {
            config.worker.max_width = width.max(1);
        }
        if let Some(height) = env_parse::<u32>("PREVIEW_MAX_HEIGHT") {
            config.worker.max_height = height.max(1);
        }
        if let Some(pixels) = env_parse::<u64>("PREVIEW_MAX_BITMAP_PIXELS") {
            config.worker.max_bitmap_pixels = pixels;
        }
        if let Some(capacity) = env_parse::<usize>("PREVIEW_CACHE_CAPACITY") {
            config.cache.capacity = capacity.max(1);
        }
        if let Some(retries) = env_parse::<u32>("PREVIEW_MAX_RETRIES") {
            config.supervisor.retry.max_retries = retries;
        }

        config
    }
}

fn megabytes(mb: u64) -> u64 {
    mb.saturating_mul(MB)
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}, using default", key, raw);
            None
        }
    }
}

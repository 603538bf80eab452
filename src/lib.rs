//! Document Preview Library
//!
//! Renders small first-page previews of untrusted documents under strict
//! time and memory limits, and schedules those renders so a host listing
//! many documents stays responsive.
//!
//! # Modules
//!
//! - `worker`: decode + encode pipeline with size ceiling and deadline, and
//!   the dedicated-thread worker that hosts it
//! - `supervisor`: worker pool, request correlation, backstop deadline
//! - `scheduler`: bounded-concurrency FIFO admission with coalescing
//! - `cache`: bounded LRU of revocable preview handles
//! - `element`: per-document consumer driven by visibility
//! - `service`: wires the above together

pub mod cache;
pub mod config;
pub mod decoder;
pub mod element;
pub mod encoder;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod supervisor;
pub mod worker;

pub use cache::{CacheKey, PreviewHandle, ThumbnailCache};
pub use config::{ConversionRoute, PreviewConfig};
pub use error::{ConversionFailure, ErrorKind, ServiceError};
pub use protocol::{ConversionRequest, ConversionResult, PreviewImage};
pub use scheduler::{RenderError, RenderScheduler, Ticket};
pub use service::PreviewService;
pub use source::SourceRef;

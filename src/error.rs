//! Error types
//!
//! Typed failures for the conversion pipeline. Every failure that crosses the
//! isolation boundary is a [`ConversionFailure`]; nothing is thrown uncaught
//! into the caller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message fragments produced by allocators and decoders when memory runs out.
const MEMORY_SIGNATURES: &[&str] = &[
    "out of memory",
    "ENOMEM",
    "allocation failed",
    "Cannot allocate memory",
    "memory limit",
];

/// Failure taxonomy for a single conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SizeExceeded,
    Timeout,
    MemoryExhausted,
    DecodeFailure,
    Unknown,
}

impl ErrorKind {
    /// Classify a pipeline error message.
    ///
    /// Out-of-memory signatures map to `MemoryExhausted`, everything else is a
    /// `DecodeFailure`.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if MEMORY_SIGNATURES
            .iter()
            .any(|sig| lower.contains(&sig.to_lowercase()))
        {
            ErrorKind::MemoryExhausted
        } else {
            ErrorKind::DecodeFailure
        }
    }

    /// Whether a retry could plausibly succeed
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SizeExceeded => "size_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MemoryExhausted => "memory_exhausted",
            ErrorKind::DecodeFailure => "decode_failure",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "size_exceeded" => Ok(ErrorKind::SizeExceeded),
            "timeout" => Ok(ErrorKind::Timeout),
            "memory_exhausted" => Ok(ErrorKind::MemoryExhausted),
            "decode_failure" => Ok(ErrorKind::DecodeFailure),
            "unknown" => Ok(ErrorKind::Unknown),
            _ => Err(()),
        }
    }
}

/// A typed conversion failure
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ConversionFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl ConversionFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn size_exceeded(size: u64, max_bytes: u64) -> Self {
        Self::new(
            ErrorKind::SizeExceeded,
            format!("document is {} bytes, limit is {} bytes", size, max_bytes),
        )
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("conversion timed out after {}ms", after_ms),
        )
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Encode for the wire error field (`"<kind>: <message>"`)
    pub fn to_wire(&self) -> String {
        self.to_string()
    }

    /// Decode a wire error string.
    ///
    /// Strings without a recognised kind prefix are classified by message
    /// signature, and anything that still looks like a plain decoder message
    /// becomes `Unknown`.
    pub fn from_wire(error: &str) -> Self {
        if let Some((prefix, message)) = error.split_once(": ") {
            if let Ok(kind) = prefix.parse::<ErrorKind>() {
                return Self::new(kind, message);
            }
        }
        match ErrorKind::classify(error) {
            ErrorKind::MemoryExhausted => Self::new(ErrorKind::MemoryExhausted, error),
            _ => Self::unknown(error),
        }
    }
}

/// Errors raised inside the decode/encode pipeline
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The bytes are not a document we can open
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Document has no first page to render
    #[error("Document has no pages")]
    EmptyDocument,

    /// Decoder failed to open or rasterize
    #[error("Decode error: {0}")]
    Decode(String),

    /// Bitmap would exceed the configured memory budget
    #[error("Bitmap allocation failed: {width}x{height} exceeds limit of {limit} pixels")]
    BitmapTooLarge { width: u32, height: u32, limit: u64 },

    /// Encoding the preview failed
    #[error("Encode error: {0}")]
    Encode(#[from] jpeg_encoder::EncodingError),

    /// Reading the source failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The decoder or encoder panicked
    #[error("Pipeline panicked: {0}")]
    Panicked(String),
}

impl ConversionError {
    /// Map to the failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConversionError::BitmapTooLarge { .. } => ErrorKind::MemoryExhausted,
            other => ErrorKind::classify(&other.to_string()),
        }
    }

    pub fn into_failure(self) -> ConversionFailure {
        ConversionFailure::new(self.kind(), self.to_string())
    }
}

#[cfg(feature = "mupdf")]
impl From<mupdf::Error> for ConversionError {
    fn from(err: mupdf::Error) -> Self {
        ConversionError::Decode(err.to_string())
    }
}

/// Errors raised while starting or stopping the service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Failed to spawn conversion worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    #[error("No document decoder available: {0}")]
    DecoderUnavailable(String),
}

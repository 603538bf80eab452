//! Conversion requests, results and the isolation-boundary messages
//!
//! The wire messages keep the exact shape used between a caller and its
//! conversion worker:
//!
//! ```text
//! request:  { id, type: "convert", data, options?: { quality? } }
//! success:  { id, type: "success", buffer, contentType }
//! error:    { id, type: "error", error }
//! ```

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::WorkerConfig;
use crate::error::{ConversionFailure, ErrorKind};
use crate::source::SourceRef;

/// MIME type of every preview we produce
pub const PREVIEW_MIME_TYPE: &str = "image/jpeg";

/// A single conversion job
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub id: String,
    pub source: SourceRef,
    pub max_bytes: u64,
    pub deadline: Duration,
    pub target_scale: f32,
    pub output_quality: u8,
}

impl ConversionRequest {
    /// Create a request with a fresh id and the worker's configured limits
    pub fn new(source: SourceRef, limits: &WorkerConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            max_bytes: limits.max_bytes,
            deadline: limits.deadline,
            target_scale: limits.target_scale,
            output_quality: limits.quality,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.output_quality = quality.clamp(1, 100);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline.as_millis() as u64
    }
}

/// Outcome of one conversion. Exactly one is produced per request id.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionResult {
    Success {
        id: String,
        image_bytes: Vec<u8>,
        mime_type: String,
    },
    Failure {
        id: String,
        error_kind: ErrorKind,
        message: String,
    },
}

impl ConversionResult {
    pub fn success(id: impl Into<String>, image_bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        ConversionResult::Success {
            id: id.into(),
            image_bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn failure(id: impl Into<String>, failure: ConversionFailure) -> Self {
        ConversionResult::Failure {
            id: id.into(),
            error_kind: failure.kind,
            message: failure.message,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ConversionResult::Success { id, .. } | ConversionResult::Failure { id, .. } => id,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ConversionResult::Success { .. } => None,
            ConversionResult::Failure { error_kind, .. } => Some(*error_kind),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConversionResult::Success { .. })
    }

    /// Drop the id and split into image or typed failure
    pub fn into_outcome(self) -> Result<PreviewImage, ConversionFailure> {
        match self {
            ConversionResult::Success {
                image_bytes,
                mime_type,
                ..
            } => Ok(PreviewImage::new(image_bytes, mime_type)),
            ConversionResult::Failure {
                error_kind, message, ..
            } => Err(ConversionFailure::new(error_kind, message)),
        }
    }
}

/// An encoded preview ready for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl PreviewImage {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `data:` URL for hosts that display previews inline
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// Optional per-request settings on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
}

/// Message sent to a conversion worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerRequest {
    Convert {
        id: String,
        data: Arc<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<ConvertOptions>,
    },
}

impl WorkerRequest {
    pub fn convert(id: impl Into<String>, data: Arc<Vec<u8>>, quality: Option<u8>) -> Self {
        WorkerRequest::Convert {
            id: id.into(),
            data,
            options: quality.map(|q| ConvertOptions { quality: Some(q) }),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WorkerRequest::Convert { id, .. } => id,
        }
    }
}

/// Message sent back by a conversion worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerResponse {
    Success {
        id: String,
        buffer: Vec<u8>,
        #[serde(rename = "contentType")]
        content_type: String,
    },
    Error {
        id: String,
        error: String,
    },
}

impl WorkerResponse {
    pub fn id(&self) -> &str {
        match self {
            WorkerResponse::Success { id, .. } | WorkerResponse::Error { id, .. } => id,
        }
    }
}

impl From<ConversionResult> for WorkerResponse {
    fn from(result: ConversionResult) -> Self {
        match result {
            ConversionResult::Success {
                id,
                image_bytes,
                mime_type,
            } => WorkerResponse::Success {
                id,
                buffer: image_bytes,
                content_type: mime_type,
            },
            ConversionResult::Failure {
                id,
                error_kind,
                message,
            } => WorkerResponse::Error {
                id,
                error: ConversionFailure::new(error_kind, message).to_wire(),
            },
        }
    }
}

impl From<WorkerResponse> for ConversionResult {
    fn from(response: WorkerResponse) -> Self {
        match response {
            WorkerResponse::Success {
                id,
                buffer,
                content_type,
            } => ConversionResult::success(id, buffer, content_type),
            WorkerResponse::Error { id, error } => {
                ConversionResult::failure(id, ConversionFailure::from_wire(&error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = WorkerRequest::convert("req-1", Arc::new(vec![1, 2]), Some(70));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({ "id": "req-1", "type": "convert", "data": [1, 2], "options": { "quality": 70 } })
        );

        let bare = WorkerRequest::convert("req-2", Arc::new(vec![]), None);
        let value = serde_json::to_value(&bare).unwrap();
        assert_eq!(value, json!({ "id": "req-2", "type": "convert", "data": [] }));
    }

    #[test]
    fn test_response_wire_shape() {
        let success = WorkerResponse::Success {
            id: "req-1".into(),
            buffer: vec![9],
            content_type: PREVIEW_MIME_TYPE.into(),
        };
        assert_eq!(
            serde_json::to_value(&success).unwrap(),
            json!({ "id": "req-1", "type": "success", "buffer": [9], "contentType": "image/jpeg" })
        );

        let error: WorkerResponse =
            serde_json::from_value(json!({ "id": "req-2", "type": "error", "error": "timeout: late" }))
                .unwrap();
        assert_eq!(
            error,
            WorkerResponse::Error {
                id: "req-2".into(),
                error: "timeout: late".into()
            }
        );
    }

    #[test]
    fn test_failure_survives_boundary() {
        let result = ConversionResult::failure(
            "req-3",
            ConversionFailure::new(ErrorKind::MemoryExhausted, "allocation failed"),
        );
        let back = ConversionResult::from(WorkerResponse::from(result.clone()));
        assert_eq!(back, result);
    }

    #[test]
    fn test_into_outcome() {
        let ok = ConversionResult::success("a", vec![1, 2, 3], PREVIEW_MIME_TYPE);
        let image = ok.into_outcome().unwrap();
        assert_eq!(image.len(), 3);

        let err = ConversionResult::failure("b", ConversionFailure::timeout(100));
        assert_eq!(err.into_outcome().unwrap_err().kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_data_url() {
        let image = PreviewImage::new(vec![0xff, 0xd8], PREVIEW_MIME_TYPE);
        assert_eq!(image.to_data_url(), "data:image/jpeg;base64,/9g=");
    }
}

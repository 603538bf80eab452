//! Document sources
//!
//! A [`SourceRef`] is an opaque handle to the document bytes: either bytes the
//! host already holds, or a path the bytes can be read from. Sizes are checked
//! before anything is materialized so oversized uploads never reach memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use crate::error::{ConversionFailure, ErrorKind};

/// Source data for a document
#[derive(Debug, Clone)]
pub enum SourceRef {
    /// Document bytes already in memory
    Bytes(Arc<Vec<u8>>),
    /// Document stored at a file path
    Path(PathBuf),
}

impl SourceRef {
    /// Create source from bytes
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::Bytes(Arc::new(data))
    }

    /// Create source from path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }

    /// Declared size in bytes without reading the content
    pub async fn declared_len(&self) -> Result<u64, ConversionFailure> {
        match self {
            SourceRef::Bytes(data) => Ok(data.len() as u64),
            SourceRef::Path(path) => tokio::fs::metadata(path)
                .await
                .map(|meta| meta.len())
                .map_err(|e| read_failure(path, e)),
        }
    }

    /// File name hint, if the source has one
    pub fn file_name(&self) -> Option<&str> {
        match self {
            SourceRef::Bytes(_) => None,
            SourceRef::Path(path) => path.file_name().and_then(|name| name.to_str()),
        }
    }

    /// Load the bytes, refusing anything larger than `max_bytes`.
    ///
    /// The declared size is checked first; path sources are additionally read
    /// through a `take(max_bytes + 1)` so a file growing underneath us is still
    /// caught without buffering more than the ceiling.
    pub async fn load_bounded(&self, max_bytes: u64) -> Result<Arc<Vec<u8>>, ConversionFailure> {
        let declared = self.declared_len().await?;
        if declared > max_bytes {
            return Err(ConversionFailure::size_exceeded(declared, max_bytes));
        }

        match self {
            SourceRef::Bytes(data) => Ok(Arc::clone(data)),
            SourceRef::Path(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| read_failure(path, e))?;
                let mut data = Vec::with_capacity(declared as usize);
                file.take(max_bytes.saturating_add(1))
                    .read_to_end(&mut data)
                    .await
                    .map_err(|e| read_failure(path, e))?;
                if data.len() as u64 > max_bytes {
                    return Err(ConversionFailure::size_exceeded(data.len() as u64, max_bytes));
                }
                Ok(Arc::new(data))
            }
        }
    }
}

impl From<Vec<u8>> for SourceRef {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl From<PathBuf> for SourceRef {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

fn read_failure(path: &Path, err: std::io::Error) -> ConversionFailure {
    ConversionFailure::new(
        ErrorKind::DecodeFailure,
        format!("Failed to read {}: {}", path.display(), err),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_source_from_bytes() {
        let data = vec![1, 2, 3, 4];
        let source = SourceRef::from_bytes(data.clone());

        match source {
            SourceRef::Bytes(arc_data) => assert_eq!(*arc_data, data),
            _ => panic!("Expected Bytes variant"),
        }
    }

    #[test]
    fn test_source_from_path() {
        let source = SourceRef::from_path("/test/invoice.pdf");
        assert_eq!(source.file_name(), Some("invoice.pdf"));
    }

    #[tokio::test]
    async fn test_load_bounded_bytes() {
        let source = SourceRef::from_bytes(vec![0u8; 64]);
        assert_eq!(source.declared_len().await.unwrap(), 64);
        assert_eq!(source.load_bounded(64).await.unwrap().len(), 64);

        let err = source.load_bounded(63).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SizeExceeded);
    }

    #[tokio::test]
    async fn test_load_bounded_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 128]).unwrap();
        let source = SourceRef::from_path(file.path());

        assert_eq!(source.load_bounded(1024).await.unwrap().len(), 128);
        let err = source.load_bounded(100).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SizeExceeded);
    }

    #[tokio::test]
    async fn test_load_bounded_path_without_ceiling() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 32]).unwrap();
        let source = SourceRef::from_path(file.path());

        assert_eq!(source.load_bounded(u64::MAX).await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_missing_path_is_decode_failure() {
        let source = SourceRef::from_path("/definitely/not/here.pdf");
        let err = source.load_bounded(1024).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DecodeFailure);
    }
}

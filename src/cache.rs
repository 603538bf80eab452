//! Thumbnail cache
//!
//! Session-scoped store of finished previews, keyed by a stable document
//! identifier. Entries hold revocable [`PreviewHandle`]s: when an entry is
//! replaced or falls out of the LRU, its handle is revoked and the image
//! bytes are released even if a consumer still holds a clone of the handle.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::protocol::PreviewImage;

const DEFAULT_CAPACITY: usize = 500;

/// Stable identifier for a document's preview
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key derived from document content, for documents without an id
    pub fn from_content(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct HandleInner {
    image: Mutex<Option<Arc<PreviewImage>>>,
}

/// Revocable reference to a rendered preview.
///
/// Consumers borrow the image for display; the cache owns its lifetime.
#[derive(Clone)]
pub struct PreviewHandle {
    inner: Arc<HandleInner>,
}

impl PreviewHandle {
    pub fn new(image: PreviewImage) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                image: Mutex::new(Some(Arc::new(image))),
            }),
        }
    }

    /// The image, or `None` once the handle has been revoked
    pub fn image(&self) -> Option<Arc<PreviewImage>> {
        self.inner.image.lock().clone()
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.image.lock().is_none()
    }

    /// Release the image. Idempotent.
    pub fn revoke(&self) {
        self.inner.image.lock().take();
    }

    /// Whether two handles refer to the same cached preview
    pub fn same_as(&self, other: &PreviewHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for PreviewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.image().map(|image| image.len());
        f.debug_struct("PreviewHandle")
            .field("bytes", &bytes)
            .finish()
    }
}

/// A cached preview
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub handle: PreviewHandle,
    pub created_at: DateTime<Utc>,
}

/// Bounded LRU of preview handles
pub struct ThumbnailCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl Default for ThumbnailCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ThumbnailCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up a preview and mark it recently used
    pub fn get(&self, key: &CacheKey) -> Option<PreviewHandle> {
        self.entries.lock().get(key).map(|entry| entry.handle.clone())
    }

    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.lock().peek(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains(key)
    }

    /// Store a preview. A previous entry for the same key, or the least
    /// recently used entry when full, is revoked.
    pub fn insert(&self, key: CacheKey, image: PreviewImage) -> PreviewHandle {
        let handle = PreviewHandle::new(image);
        let entry = CacheEntry {
            key: key.clone(),
            handle: handle.clone(),
            created_at: Utc::now(),
        };

        let displaced = self.entries.lock().push(key, entry);
        if let Some((displaced_key, old)) = displaced {
            tracing::debug!(key = %displaced_key, "Releasing displaced preview");
            old.handle.revoke();
        }
        handle
    }

    /// Remove and revoke one entry
    pub fn evict(&self, key: &CacheKey) -> bool {
        match self.entries.lock().pop(key) {
            Some(entry) => {
                entry.handle.revoke();
                true
            }
            None => false,
        }
    }

    /// Remove and revoke everything
    pub fn clear(&self) {
        let drained: Vec<CacheEntry> = {
            let mut entries = self.entries.lock();
            let mut drained = Vec::with_capacity(entries.len());
            while let Some((_, entry)) = entries.pop_lru() {
                drained.push(entry);
            }
            drained
        };
        for entry in drained {
            entry.handle.revoke();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

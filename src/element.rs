//! Per-document preview element
//!
//! A [`PreviewElement`] is the consumer side of the pipeline: it watches its
//! own visibility and, on the transition to "near the viewport", asks the
//! service for its preview. It owns its request: tearing the element down
//! before the preview arrives detaches it from the scheduler.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::cache::{CacheKey, PreviewHandle};
use crate::error::ErrorKind;
use crate::protocol::PreviewImage;
use crate::scheduler::{RenderError, Ticket};
use crate::service::PreviewService;
use crate::source::SourceRef;

/// Default lookahead, in layout units, before an item counts as visible
pub const DEFAULT_LOOKAHEAD_MARGIN: f64 = 100.0;

/// Visible region of the scrolling container
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub top: f64,
    pub height: f64,
}

/// Position of one item inside the container
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemBounds {
    pub top: f64,
    pub height: f64,
}

impl ItemBounds {
    pub fn is_near(&self, viewport: &Viewport, margin: f64) -> bool {
        self.top < viewport.top + viewport.height + margin
            && self.top + self.height > viewport.top - margin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityChange {
    EnteredNear,
    LeftNear,
    Unchanged,
}

/// Edge detector for the near-viewport region
#[derive(Debug, Clone)]
pub struct VisibilityObserver {
    margin: f64,
    near: bool,
}

impl Default for VisibilityObserver {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKAHEAD_MARGIN)
    }
}

impl VisibilityObserver {
    pub fn new(margin: f64) -> Self {
        Self {
            margin: margin.max(0.0),
            near: false,
        }
    }

    pub fn is_near(&self) -> bool {
        self.near
    }

    pub fn observe(&mut self, bounds: &ItemBounds, viewport: &Viewport) -> VisibilityChange {
        let near = bounds.is_near(viewport, self.margin);
        let change = match (self.near, near) {
            (false, true) => VisibilityChange::EnteredNear,
            (true, false) => VisibilityChange::LeftNear,
            _ => VisibilityChange::Unchanged,
        };
        self.near = near;
        change
    }
}

/// Generic icon shown when no preview is available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackIcon {
    Pdf,
    Image,
    Spreadsheet,
    Generic,
}

impl FallbackIcon {
    /// Pick an icon from a file name's extension
    pub fn for_name(name: &str) -> Self {
        match mime_guess::from_path(name).first() {
            Some(mime) => Self::for_mime(mime.essence_str()),
            None => FallbackIcon::Generic,
        }
    }

    pub fn for_mime(mime: &str) -> Self {
        match mime {
            "application/pdf" => FallbackIcon::Pdf,
            "text/csv"
            | "application/vnd.ms-excel"
            | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.oasis.opendocument.spreadsheet" => FallbackIcon::Spreadsheet,
            m if m.starts_with("image/") => FallbackIcon::Image,
            _ => FallbackIcon::Generic,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ElementState {
    Idle,
    Loading,
    Ready(PreviewHandle),
    Failed(ErrorKind),
}

/// What the host should draw for this element right now
#[derive(Debug, Clone, PartialEq)]
pub enum Display {
    Placeholder,
    Image(Arc<PreviewImage>),
    Fallback(FallbackIcon),
}

struct InFlight {
    task: JoinHandle<()>,
    waiter_id: u64,
}

pub struct PreviewElement {
    key: CacheKey,
    source: SourceRef,
    icon: FallbackIcon,
    service: PreviewService,
    observer: VisibilityObserver,
    state: Arc<Mutex<ElementState>>,
    in_flight: Option<InFlight>,
}

impl PreviewElement {
    pub fn new(service: PreviewService, key: CacheKey, source: SourceRef) -> Self {
        let icon = source
            .file_name()
            .map(FallbackIcon::for_name)
            .unwrap_or(FallbackIcon::Generic);
        Self {
            key,
            source,
            icon,
            service,
            observer: VisibilityObserver::default(),
            state: Arc::new(Mutex::new(ElementState::Idle)),
            in_flight: None,
        }
    }

    pub fn with_file_name(mut self, name: &str) -> Self {
        self.icon = FallbackIcon::for_name(name);
        self
    }

    pub fn with_margin(mut self, margin: f64) -> Self {
        self.observer = VisibilityObserver::new(margin);
        self
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> ElementState {
        self.state.lock().clone()
    }

    /// Feed a layout update. Requests the preview on entering the
    /// near-viewport region.
    pub fn on_layout(&mut self, bounds: &ItemBounds, viewport: &Viewport) -> VisibilityChange {
        let change = self.observer.observe(bounds, viewport);
        if change == VisibilityChange::EnteredNear {
            self.request();
        }
        change
    }

    /// Request the preview unless one is loaded or loading.
    ///
    /// Must be called within a Tokio runtime.
    pub fn request(&mut self) {
        match &*self.state.lock() {
            ElementState::Loading => return,
            ElementState::Ready(handle) if !handle.is_revoked() => return,
            _ => {}
        }

        let ticket = self.service.request(self.key.clone(), self.source.clone());
        let waiter_id = match ticket {
            Ticket::Ready(handle) => {
                *self.state.lock() = ElementState::Ready(handle);
                return;
            }
            Ticket::Pending { waiter_id, .. } => waiter_id,
        };

        *self.state.lock() = ElementState::Loading;
        let state = Arc::clone(&self.state);
        let key = self.key.clone();
        let task = tokio::spawn(async move {
            let next = match ticket.wait().await {
                Ok(handle) => ElementState::Ready(handle),
                Err(RenderError::Failed(failure)) => {
                    tracing::debug!(key = %key, kind = %failure.kind, "Preview unavailable, showing fallback");
                    ElementState::Failed(failure.kind)
                }
                Err(RenderError::Cancelled) => ElementState::Idle,
            };
            *state.lock() = next;
        });
        self.in_flight = Some(InFlight { task, waiter_id });
    }

    pub fn display(&self) -> Display {
        match &*self.state.lock() {
            ElementState::Ready(handle) => match handle.image() {
                Some(image) => Display::Image(image),
                // Evicted from the cache; re-entering view will request again
                None => Display::Placeholder,
            },
            ElementState::Failed(_) => Display::Fallback(self.icon),
            ElementState::Idle | ElementState::Loading => Display::Placeholder,
        }
    }

    /// Stop waiting for the preview. Safe to call more than once.
    pub fn teardown(&mut self) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        if in_flight.task.is_finished() {
            return;
        }
        in_flight.task.abort();
        self.service.detach(&self.key, in_flight.waiter_id);

        let mut state = self.state.lock();
        if matches!(*state, ElementState::Loading) {
            *state = ElementState::Idle;
        }
    }
}

impl Drop for PreviewElement {
    fn drop(&mut self) {
        self.teardown();
    }
}

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::gesture::PointerEvent;

pub type FrameId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pagination {
    Paginated,
    Scrolled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Spread {
    None,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub width: u32,
    pub height: u32,
    pub pagination: Pagination,
    pub spread: Spread,
    pub gap: u32,
}

/// One end of the rendered range as reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationMark {
    pub reference: String,
    pub percentage: f32,
    /// Index into the location index, once one has been generated or loaded.
    pub location: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedLocation {
    pub start: LocationMark,
    pub end: Option<LocationMark>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    ArrowLeft,
    ArrowRight,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Relocated(RenderedLocation),
    Rendered { frame: FrameId },
    Selected { range: String, text: String },
    Click,
    KeyUp(Key),
}

pub type EngineListener = Arc<dyn Fn(EngineEvent) + Send + Sync>;
pub type PointerListener = Arc<dyn Fn(PointerEvent) + Send + Sync>;

/// Handle to a registered listener. Dropping it unregisters the listener, so
/// whoever owns the subscription controls how long callbacks can arrive.
#[must_use = "dropping a subscription unregisters its listener"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A subscription with nothing to release.
    pub fn detached() -> Self {
        Self { release: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// A rendered content document inside the viewport.
pub trait ContentFrame: Send + Sync {
    fn id(&self) -> FrameId;
    /// Text currently visible in the viewport, not the whole section.
    fn visible_text(&self) -> String;
    fn watch_pointer(&self, listener: PointerListener) -> Subscription;
}

/// The engine's location index primitives.
#[async_trait]
pub trait Locations: Send + Sync {
    async fn generate(&self, chunk_size: usize) -> Result<usize, EngineError>;
    fn load(&self, serialized: &str) -> Result<usize, EngineError>;
    fn save(&self) -> String;
    fn ref_from_location(&self, location: usize) -> Option<String>;
    fn location_from_ref(&self, reference: &str) -> Option<usize>;
    fn total(&self) -> usize;
}

#[async_trait]
pub trait Rendition: Send + Sync {
    async fn next(&self) -> Result<(), EngineError>;
    async fn prev(&self) -> Result<(), EngineError>;
    /// Displays `target`, or the start of the document when `None`.
    async fn display(&self, target: Option<&str>) -> Result<(), EngineError>;
    fn current_location(&self) -> Option<RenderedLocation>;
    fn contents(&self) -> Vec<Arc<dyn ContentFrame>>;
    fn chapter_label(&self, reference: &str) -> Option<String>;
    fn locations(&self) -> Arc<dyn Locations>;
    fn resize(&self, options: &RenderOptions);
    fn on(&self, listener: EngineListener) -> Subscription;
    fn destroy(&self);
}

#[async_trait]
pub trait EngineProvider: Send + Sync {
    async fn open(
        &self,
        resource: &str,
        options: &RenderOptions,
    ) -> Result<Arc<dyn Rendition>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dropping_subscription_runs_release_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let subscription = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(subscription);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_subscription_is_inert() {
        let subscription = Subscription::detached();
        assert_eq!(format!("{:?}", subscription), "Subscription { active: false }");
    }
}

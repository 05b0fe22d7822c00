use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod cache;
pub mod config;
mod engine;
mod error;
mod gesture;
mod locations;
mod navigation;
mod read_aloud;
mod remote;
mod seek;
mod session;
mod speech;
mod sync;
mod viewport;

pub use cache::{CacheKey, FileCache, LocalCache, MemoryCache};
pub use config::{BookmarkMatch, ReaderConfig};
pub use engine::{
    ContentFrame, EngineEvent, EngineListener, EngineProvider, FrameId, Key, LocationMark,
    Locations, Pagination, PointerListener, RenderOptions, RenderedLocation, Rendition, Spread,
    Subscription,
};
pub use error::{EngineError, ReaderError, RemoteError, SpeechError};
pub use gesture::{GestureOutcome, GestureRecognizer, HitTarget, PointerEvent, PointerPhase};
pub use locations::{LocationIndex, LocationIndexBuilder};
pub use navigation::{
    Admission, CurrentPosition, Direction, EngineCall, NavSource, NavigationController, Settled,
    Transition,
};
pub use read_aloud::{LoopAction, ReadAloudLoop, ReadAloudState};
pub use remote::{OfflineStore, RemoteStore};
pub use seek::SeekDebouncer;
pub use session::{
    Collaborators, Command, DocumentSpec, Reader, ReaderView, SessionEvent, SessionStatus,
};
pub use speech::{
    preferred_voice, SilentSpeech, SpeechEngine, SpeechEvent, SpeechEventKind, SpeechListener,
    SpeechSettings, Utterance, UtteranceId, Voice,
};
pub use sync::{
    Annotation, BookmarkRecord, Mode, PendingPersist, PersistRequest, SyncManager, SyncOutcome,
};
pub use viewport::{
    select_viewport_adapter, CompactViewport, SpreadViewport, ViewportAdapter, ViewportSize,
};

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0d3c2e-8b7a-5d4e-9a61-2c5f0e7b9d14").expect("valid namespace UUID")
});

/// Stable identity of a document across sessions. Keys every cache entry and
/// every remote persistence call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives an id from a local file path so that reopening the same file
    /// finds its cached index, bookmark and last-read position.
    pub fn for_path(path: &Path) -> Self {
        let resolved = path
            .canonicalize()
            .or_else(|_| {
                if path.is_absolute() {
                    Ok(path.to_path_buf())
                } else {
                    std::env::current_dir().map(|cwd| cwd.join(path))
                }
            })
            .unwrap_or_else(|_| path.to_path_buf());
        let rendered = resolved.to_string_lossy();
        Self(Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn document_id_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sample.txt");
        std::fs::write(&file_path, b"dummy").unwrap();

        let first = DocumentId::for_path(&file_path);
        let second = DocumentId::for_path(&file_path);

        assert_eq!(first, second);
        assert_ne!(first, DocumentId::for_path(&dir.path().join("other.txt")));
    }

    #[test]
    fn document_id_serializes_as_plain_string() {
        let id = DocumentId::new("book-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"book-42\"");
        assert_eq!(id.to_string(), "book-42");
    }
}

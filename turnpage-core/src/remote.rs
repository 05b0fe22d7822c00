use async_trait::async_trait;

use crate::error::RemoteError;
use crate::sync::{Annotation, BookmarkRecord};
use crate::DocumentId;

/// Authoritative store for remote-mode sessions. Every save carries the full
/// resulting collection; the server replaces what it had.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_annotations(
        &self,
        document: &DocumentId,
        owner: &str,
    ) -> Result<Vec<Annotation>, RemoteError>;

    async fn save_annotations(
        &self,
        document: &DocumentId,
        owner: &str,
        annotations: &[Annotation],
    ) -> Result<(), RemoteError>;

    /// `None` clears the document's bookmark.
    async fn save_bookmark(
        &self,
        document: &DocumentId,
        owner: &str,
        bookmark: Option<&BookmarkRecord>,
    ) -> Result<(), RemoteError>;
}

/// Store used when no remote endpoint is configured. Every call fails as a
/// transport error, so remote-mode mutations roll back.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineStore;

#[async_trait]
impl RemoteStore for OfflineStore {
    async fn fetch_annotations(
        &self,
        _document: &DocumentId,
        _owner: &str,
    ) -> Result<Vec<Annotation>, RemoteError> {
        Err(RemoteError::Transport("offline".into()))
    }

    async fn save_annotations(
        &self,
        _document: &DocumentId,
        _owner: &str,
        _annotations: &[Annotation],
    ) -> Result<(), RemoteError> {
        Err(RemoteError::Transport("offline".into()))
    }

    async fn save_bookmark(
        &self,
        _document: &DocumentId,
        _owner: &str,
        _bookmark: Option<&BookmarkRecord>,
    ) -> Result<(), RemoteError> {
        Err(RemoteError::Transport("offline".into()))
    }
}

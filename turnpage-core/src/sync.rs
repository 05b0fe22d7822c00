use std::collections::HashMap;
use std::mem::{self, Discriminant};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheKey, LocalCache};
use crate::config::BookmarkMatch;
use crate::error::{ReaderError, RemoteError};
use crate::DocumentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Local cache is authoritative; nothing leaves the device.
    Preview,
    /// Remote store is authoritative; the local cache mirrors the last
    /// successful save.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookmarkRecord {
    #[serde(rename = "cfi")]
    pub reference: String,
    pub percent: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(rename = "cfiRange")]
    pub range: String,
    pub text: String,
    pub color: String,
}

/// Full replacement payload for one remote save.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistRequest {
    Bookmark(Option<BookmarkRecord>),
    Annotations(Vec<Annotation>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingPersist {
    pub id: u64,
    pub request: PersistRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Confirmed,
    RolledBack(RemoteError),
    /// The save failed, but a newer save of the same kind carries its change
    /// and decides whether it stays.
    Superseded(RemoteError),
}

#[derive(Debug, Clone)]
enum Undo {
    Bookmark {
        previous: Option<BookmarkRecord>,
        applied: Option<BookmarkRecord>,
    },
    AnnotationAdded(Annotation),
    AnnotationRemoved {
        index: usize,
        annotation: Annotation,
    },
}

#[derive(Debug)]
struct InFlight {
    request: PersistRequest,
    /// Oldest first. Failed older saves hand their undo to the next newer one.
    undos: Vec<Undo>,
}

impl InFlight {
    fn kind(&self) -> Discriminant<PersistRequest> {
        mem::discriminant(&self.request)
    }
}

/// Owns the bookmark and annotation state of one document session.
///
/// Mutations apply to memory first. In preview mode they are written to the
/// local cache straight away; in remote mode the caller ships the returned
/// [`PendingPersist`] to the remote store and reports back through
/// [`SyncManager::finish`], which either mirrors the payload locally or
/// reverts exactly the delta that was attempted.
pub struct SyncManager {
    document_id: DocumentId,
    mode: Mode,
    cache: Arc<dyn LocalCache>,
    policy: BookmarkMatch,
    bookmark: Option<BookmarkRecord>,
    annotations: Vec<Annotation>,
    in_flight: HashMap<u64, InFlight>,
    confirmed: HashMap<Discriminant<PersistRequest>, u64>,
    next_id: u64,
}

impl SyncManager {
    pub fn new(
        document_id: DocumentId,
        mode: Mode,
        cache: Arc<dyn LocalCache>,
        policy: BookmarkMatch,
    ) -> Self {
        Self {
            document_id,
            mode,
            cache,
            policy,
            bookmark: None,
            annotations: Vec::new(),
            in_flight: HashMap::new(),
            confirmed: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn bookmark(&self) -> Option<&BookmarkRecord> {
        self.bookmark.as_ref()
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Restores state from the local cache. Unreadable entries are logged and
    /// treated as absent.
    pub fn load_local(&mut self) {
        self.bookmark = match self.cache.get(&self.bookmark_key()) {
            Ok(Some(raw)) if !raw.trim().is_empty() => {
                match serde_json::from_str::<BookmarkRecord>(&raw) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        warn!(%err, "ignoring malformed cached bookmark");
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "failed to read cached bookmark");
                None
            }
        };

        self.annotations = match self.cache.get(&self.annotations_key()) {
            Ok(Some(raw)) if !raw.trim().is_empty() => {
                match serde_json::from_str::<Vec<Annotation>>(&raw) {
                    Ok(list) => list,
                    Err(err) => {
                        warn!(%err, "ignoring malformed cached annotations");
                        Vec::new()
                    }
                }
            }
            Ok(_) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "failed to read cached annotations");
                Vec::new()
            }
        };
        debug!(
            bookmarked = self.bookmark.is_some(),
            annotations = self.annotations.len(),
            "restored local sync state"
        );
    }

    /// Replaces the annotation list with the one fetched from the remote
    /// store. Skipped while a local annotation save is still in flight, since
    /// the fetch predates it.
    pub fn apply_remote_annotations(&mut self, annotations: Vec<Annotation>) -> bool {
        let pending_annotations = self
            .in_flight
            .values()
            .any(|entry| matches!(entry.request, PersistRequest::Annotations(_)));
        if pending_annotations {
            debug!("discarding fetched annotations, a local save is in flight");
            return false;
        }
        self.annotations = annotations;
        self.mirror(&PersistRequest::Annotations(self.annotations.clone()));
        true
    }

    pub fn is_bookmarked(&self, reference: &str) -> bool {
        let Some(bookmark) = &self.bookmark else {
            return false;
        };
        if bookmark.reference == reference {
            return true;
        }
        match self.policy {
            BookmarkMatch::Exact => false,
            BookmarkMatch::SectionFallback => match (
                bookmark.reference.split_once('!'),
                reference.split_once('!'),
            ) {
                (Some((stored, _)), Some((current, _))) => stored == current,
                _ => false,
            },
        }
    }

    /// Sets or clears the single bookmark, overwriting any previous one.
    pub fn set_bookmark(
        &mut self,
        bookmark: Option<BookmarkRecord>,
    ) -> Result<Option<PendingPersist>, ReaderError> {
        if self.bookmark == bookmark {
            return Ok(None);
        }
        let previous = std::mem::replace(&mut self.bookmark, bookmark.clone());
        let undo = Undo::Bookmark {
            previous,
            applied: bookmark.clone(),
        };
        self.commit(undo, PersistRequest::Bookmark(bookmark))
    }

    pub fn add_annotation(
        &mut self,
        annotation: Annotation,
    ) -> Result<Option<PendingPersist>, ReaderError> {
        self.annotations.push(annotation.clone());
        let request = PersistRequest::Annotations(self.annotations.clone());
        self.commit(Undo::AnnotationAdded(annotation), request)
    }

    pub fn remove_annotation(
        &mut self,
        index: usize,
    ) -> Result<Option<PendingPersist>, ReaderError> {
        if index >= self.annotations.len() {
            debug!(index, len = self.annotations.len(), "no annotation to remove");
            return Ok(None);
        }
        let annotation = self.annotations.remove(index);
        let request = PersistRequest::Annotations(self.annotations.clone());
        self.commit(Undo::AnnotationRemoved { index, annotation }, request)
    }

    /// Resolves a remote save. Returns `None` for an unknown id.
    ///
    /// Every payload is a full replacement, so a save of the same kind with a
    /// higher id contains all older changes. A confirmed save drops the undo
    /// entries of older ones, and a failed save only rolls back once no newer
    /// save of its kind is left in flight.
    pub fn finish(&mut self, id: u64, result: Result<(), RemoteError>) -> Option<SyncOutcome> {
        let entry = self.in_flight.remove(&id)?;
        let kind = entry.kind();
        match result {
            Ok(()) => {
                if self.confirmed.get(&kind).is_some_and(|&last| last > id) {
                    debug!(id, "stale confirmation, newer save already mirrored");
                    return Some(SyncOutcome::Confirmed);
                }
                self.confirmed.insert(kind, id);
                for (_, older) in self
                    .in_flight
                    .iter_mut()
                    .filter(|(other, older)| **other < id && older.kind() == kind)
                {
                    older.undos.clear();
                }
                self.mirror(&entry.request);
                Some(SyncOutcome::Confirmed)
            }
            Err(err) => {
                let newer = self
                    .in_flight
                    .iter_mut()
                    .filter(|(other, newer)| **other > id && newer.kind() == kind)
                    .min_by_key(|(other, _)| **other);
                if let Some((newer_id, newer)) = newer {
                    debug!(id, newer = *newer_id, %err, "remote save failed, deferring to newer save");
                    let mut undos = entry.undos;
                    undos.append(&mut newer.undos);
                    newer.undos = undos;
                    return Some(SyncOutcome::Superseded(err));
                }
                if entry.undos.is_empty() {
                    debug!(id, %err, "remote save failed, newer save already confirmed");
                    return Some(SyncOutcome::Superseded(err));
                }
                warn!(id, %err, "remote save failed, rolling back");
                for undo in entry.undos.into_iter().rev() {
                    self.revert(undo);
                }
                Some(SyncOutcome::RolledBack(err))
            }
        }
    }

    fn commit(
        &mut self,
        undo: Undo,
        request: PersistRequest,
    ) -> Result<Option<PendingPersist>, ReaderError> {
        match self.mode {
            Mode::Preview => {
                if let Err(err) = self.write(&request) {
                    self.revert(undo);
                    return Err(ReaderError::Cache(err.to_string()));
                }
                Ok(None)
            }
            Mode::Remote => {
                self.next_id += 1;
                let id = self.next_id;
                self.in_flight.insert(
                    id,
                    InFlight {
                        request: request.clone(),
                        undos: vec![undo],
                    },
                );
                Ok(Some(PendingPersist { id, request }))
            }
        }
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Bookmark { previous, applied } => {
                if self.bookmark == applied {
                    self.bookmark = previous;
                }
            }
            Undo::AnnotationAdded(annotation) => {
                if let Some(index) = self.annotations.iter().rposition(|a| *a == annotation) {
                    self.annotations.remove(index);
                }
            }
            Undo::AnnotationRemoved { index, annotation } => {
                let index = index.min(self.annotations.len());
                self.annotations.insert(index, annotation);
            }
        }
    }

    fn mirror(&self, request: &PersistRequest) {
        if let Err(err) = self.write(request) {
            warn!(error = %err, "failed to mirror sync state to the local cache");
        }
    }

    fn write(&self, request: &PersistRequest) -> anyhow::Result<()> {
        match request {
            PersistRequest::Bookmark(Some(record)) => self
                .cache
                .set(&self.bookmark_key(), &serde_json::to_string(record)?),
            PersistRequest::Bookmark(None) => self.cache.set(&self.bookmark_key(), ""),
            PersistRequest::Annotations(list) => self
                .cache
                .set(&self.annotations_key(), &serde_json::to_string(list)?),
        }
    }

    fn bookmark_key(&self) -> CacheKey {
        CacheKey::Bookmarks(self.document_id.clone())
    }

    fn annotations_key(&self) -> CacheKey {
        match self.mode {
            Mode::Preview => CacheKey::PreviewAnnotations(self.document_id.clone()),
            Mode::Remote => CacheKey::Annotations(self.document_id.clone()),
        }
    }
}

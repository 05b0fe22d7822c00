use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheKey, LocalCache};
use crate::config::ReaderConfig;
use crate::engine::{
    EngineEvent, EngineProvider, FrameId, Key, RenderedLocation, Rendition, Subscription,
};
use crate::error::{EngineError, ReaderError, RemoteError, SpeechError};
use crate::gesture::{GestureOutcome, GestureRecognizer, PointerEvent};
use crate::locations::{LocationIndex, LocationIndexBuilder};
use crate::navigation::{
    Admission, CurrentPosition, Direction, EngineCall, NavSource, NavigationController, Transition,
};
use crate::read_aloud::{LoopAction, ReadAloudLoop, ReadAloudState};
use crate::remote::RemoteStore;
use crate::seek::SeekDebouncer;
use crate::speech::{
    preferred_voice, SpeechEngine, SpeechEvent, SpeechEventKind, SpeechSettings, Voice,
};
use crate::sync::{
    Annotation, BookmarkRecord, Mode, PendingPersist, PersistRequest, SyncManager, SyncOutcome,
};
use crate::viewport::{ViewportAdapter, ViewportSize};
use crate::DocumentId;


/// What to open: one document, in one mode, for one reader.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSpec {
    pub document_id: DocumentId,
    /// Path or URL handed to the render engine.
    pub resource: String,
    pub mode: Mode,
    /// Identity sent with every remote save.
    pub owner: String,
    pub viewport: ViewportSize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Navigate {
        direction: Direction,
        source: NavSource,
    },
    SeekTo {
        progress: usize,
    },
    ScrubBy {
        delta: isize,
    },
    Pointer(PointerEvent),
    SetOverlayVisible {
        visible: bool,
    },
    ToggleBookmark,
    AddBookmark,
    RemoveBookmark,
    GoToBookmark,
    AddAnnotation(Annotation),
    AnnotateSelection {
        color: String,
    },
    RemoveAnnotation {
        index: usize,
    },
    GoToAnnotation {
        index: usize,
    },
    StartReadAloud,
    PauseReadAloud,
    ResumeReadAloud,
    StopReadAloud,
    SetSpeechSettings(SpeechSettings),
    Resize(ViewportSize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionOpened(DocumentId),
    SessionClosed(DocumentId),
    SessionFailed {
        document: DocumentId,
        error: ReaderError,
    },
    PositionChanged {
        reference: String,
        progress: Option<usize>,
    },
    NavigationFailed {
        source: NavSource,
        error: ReaderError,
    },
    IndexReady {
        total: usize,
    },
    IndexUnavailable {
        error: ReaderError,
    },
    BookmarkChanged {
        bookmarked: bool,
    },
    AnnotationsChanged {
        count: usize,
    },
    PersistFailed {
        error: ReaderError,
    },
    SelectionPending {
        text: String,
    },
    ReadAloudChanged(ReadAloudState),
    ReadAloudFailed {
        error: ReaderError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Closed,
    Loading,
    Ready,
    /// Terminal: the document could not be opened.
    Errored(String),
}

/// Snapshot of everything the UI chrome renders.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderView {
    pub status: SessionStatus,
    pub document_id: Option<DocumentId>,
    pub position: Option<CurrentPosition>,
    pub chapter_label: String,
    /// `None` while the location index is missing.
    pub progress_percent: Option<f32>,
    pub linear_progress: Option<usize>,
    pub total_locations: usize,
    pub slider_value: usize,
    pub is_bookmarked: bool,
    pub is_transitioning: bool,
    pub overlay_visible: bool,
    pub read_aloud: ReadAloudState,
    pub voices: Vec<Voice>,
    pub annotations: Vec<Annotation>,
    pub bookmark: Option<BookmarkRecord>,
    pub page_text: String,
}

impl Default for ReaderView {
    fn default() -> Self {
        Self::closed(SessionStatus::Closed)
    }
}

impl ReaderView {
    fn closed(status: SessionStatus) -> Self {
        Self {
            status,
            document_id: None,
            position: None,
            chapter_label: String::new(),
            progress_percent: None,
            linear_progress: None,
            total_locations: 0,
            slider_value: 0,
            is_bookmarked: false,
            is_transitioning: false,
            overlay_visible: false,
            read_aloud: ReadAloudState::Idle,
            voices: Vec::new(),
            annotations: Vec::new(),
            bookmark: None,
            page_text: String::new(),
        }
    }
}

/// External services a reader talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn EngineProvider>,
    pub cache: Arc<dyn LocalCache>,
    pub remote: Arc<dyn RemoteStore>,
    pub speech: Arc<dyn SpeechEngine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    Seek,
    Resize,
    ReadAloudSettle,
}

#[derive(Debug)]
enum Input {
    Engine(EngineEvent),
    Pointer(PointerEvent),
    NavigationSettled {
        ticket: u64,
        outcome: Result<(), EngineError>,
    },
    IndexBuilt(LocationIndex),
    AnnotationsFetched(Result<Vec<Annotation>, RemoteError>),
    Persisted {
        id: u64,
        outcome: Result<(), RemoteError>,
    },
    Speech(SpeechEvent),
    Timer {
        kind: TimerKind,
        generation: u64,
    },
}

#[derive(Debug)]
struct Envelope {
    epoch: u64,
    input: Input,
}

/// Sending half handed to callbacks and background tasks. Stamps every
/// input with the epoch of the session that created it.
#[derive(Clone)]
struct Courier {
    epoch: u64,
    tx: UnboundedSender<Envelope>,
}

impl Courier {
    fn send(&self, input: Input) {
        if self
            .tx
            .send(Envelope {
                epoch: self.epoch,
                input,
            })
            .is_err()
        {
            debug!(epoch = self.epoch, "reader is gone, dropping input");
        }
    }
}

#[derive(Default)]
struct Timers {
    generation: u64,
    active: HashMap<TimerKind, (u64, JoinHandle<()>)>,
}

impl Timers {
    /// Arms `kind` to fire at `deadline`, replacing any earlier arm.
    fn schedule(&mut self, kind: TimerKind, deadline: Instant, courier: &Courier) {
        self.cancel(kind);
        self.generation += 1;
        let generation = self.generation;
        let courier = courier.clone();
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            courier.send(Input::Timer { kind, generation });
        });
        self.active.insert(kind, (generation, handle));
    }

    fn accept(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.active.get(&kind) {
            Some((armed, _)) if *armed == generation => {
                self.active.remove(&kind);
                true
            }
            _ => false,
        }
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.active.remove(&kind) {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }
}

/// Hosts at most one live document session and routes every asynchronous
/// result back into it.
///
/// All state is mutated from [`Reader::dispatch`] and [`Reader::pump`], so
/// the controller is single-threaded even though engine calls, persistence
/// and timers run as Tokio tasks. Results carry the epoch of the session
/// that started them and are discarded once that session is gone.
pub struct Reader {
    collab: Collaborators,
    config: ReaderConfig,
    adapter: Arc<dyn ViewportAdapter>,
    epoch: u64,
    tx: UnboundedSender<Envelope>,
    rx: UnboundedReceiver<Envelope>,
    session: Option<DocumentSession>,
    status: SessionStatus,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Reader {
    pub fn new(
        collab: Collaborators,
        config: ReaderConfig,
        adapter: Arc<dyn ViewportAdapter>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            collab,
            config,
            adapter,
            epoch: 0,
            tx,
            rx,
            session: None,
            status: SessionStatus::Closed,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Opens `spec`, tearing down whatever session was live first.
    #[instrument(skip(self, spec), fields(document = %spec.document_id))]
    pub async fn open(&mut self, spec: DocumentSpec) -> Result<(), ReaderError> {
        self.close();
        self.epoch += 1;
        self.status = SessionStatus::Loading;
        let courier = Courier {
            epoch: self.epoch,
            tx: self.tx.clone(),
        };

        let options = self
            .adapter
            .render_options(spec.viewport, &self.config.layout);
        let rendition = match self.collab.engine.open(&spec.resource, &options).await {
            Ok(rendition) => rendition,
            Err(err) => return Err(self.fail(&spec, err)),
        };
        if let Err(err) = rendition.display(None).await {
            rendition.destroy();
            return Err(self.fail(&spec, err));
        }

        let document_id = spec.document_id.clone();
        let session = DocumentSession::start(
            spec,
            rendition,
            self.collab.clone(),
            self.config.clone(),
            Arc::clone(&self.adapter),
            courier,
            Arc::clone(&self.events),
        );
        self.session = Some(session);
        self.status = SessionStatus::Ready;
        self.events
            .lock()
            .push(SessionEvent::SessionOpened(document_id.clone()));
        info!(document = %document_id, "session opened");
        Ok(())
    }

    pub fn dispatch(&mut self, command: Command) -> Result<(), ReaderError> {
        let session = self.session.as_mut().ok_or(ReaderError::NoActiveSession)?;
        session.apply(command)
    }

    /// Processes queued results for up to `budget`. Returns how many inputs
    /// reached the live session.
    pub async fn pump(&mut self, budget: Duration) -> usize {
        let deadline = Instant::now() + budget;
        let mut handled = 0;
        while let Ok(Some(envelope)) = timeout_at(deadline, self.rx.recv()).await {
            if self.route(envelope) {
                handled += 1;
            }
        }
        handled
    }

    pub fn view(&self) -> ReaderView {
        match &self.session {
            Some(session) => session.view(self.status.clone()),
            None => ReaderView::closed(self.status.clone()),
        }
    }

    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let document_id = session.spec.document_id.clone();
            session.teardown();
            self.epoch += 1;
            self.events
                .lock()
                .push(SessionEvent::SessionClosed(document_id.clone()));
            info!(document = %document_id, "session closed");
        }
        self.status = SessionStatus::Closed;
    }

    fn route(&mut self, envelope: Envelope) -> bool {
        if envelope.epoch != self.epoch {
            debug!(
                stale = envelope.epoch,
                live = self.epoch,
                "dropping input from a closed session"
            );
            return false;
        }
        match self.session.as_mut() {
            Some(session) => {
                session.handle(envelope.input);
                true
            }
            None => false,
        }
    }

    fn fail(&mut self, spec: &DocumentSpec, err: EngineError) -> ReaderError {
        let error = ReaderError::EngineInit(err);
        warn!(document = %spec.document_id, %error, "failed to open document");
        self.status = SessionStatus::Errored(error.to_string());
        self.events.lock().push(SessionEvent::SessionFailed {
            document: spec.document_id.clone(),
            error: error.clone(),
        });
        error
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.teardown();
        }
    }
}

struct DocumentSession {
    spec: DocumentSpec,
    rendition: Arc<dyn Rendition>,
    collab: Collaborators,
    config: ReaderConfig,
    adapter: Arc<dyn ViewportAdapter>,
    courier: Courier,
    events: Arc<Mutex<Vec<SessionEvent>>>,
    nav: NavigationController,
    gesture: GestureRecognizer,
    seek: SeekDebouncer,
    index: LocationIndex,
    sync: SyncManager,
    read_aloud: ReadAloudLoop,
    timers: Timers,
    frames: HashSet<FrameId>,
    subscriptions: Vec<Subscription>,
    selection: Option<(String, String)>,
    pending_resize: Option<ViewportSize>,
    voices: Vec<Voice>,
    overlay_visible: bool,
    bookmarked: bool,
    reported_read_aloud: ReadAloudState,
    /// A read-aloud page turn arrived while another call was pending.
    turn_deferred: bool,
}

impl DocumentSession {
    fn start(
        spec: DocumentSpec,
        rendition: Arc<dyn Rendition>,
        collab: Collaborators,
        config: ReaderConfig,
        adapter: Arc<dyn ViewportAdapter>,
        courier: Courier,
        events: Arc<Mutex<Vec<SessionEvent>>>,
    ) -> Self {
        let voices = collab.speech.voices();
        let settings = SpeechSettings {
            rate: config.read_aloud.rate,
            volume: config.read_aloud.volume,
            voice: config
                .read_aloud
                .voice
                .clone()
                .or_else(|| preferred_voice(&voices).map(|voice| voice.name.clone())),
        };
        let sync = SyncManager::new(
            spec.document_id.clone(),
            spec.mode,
            Arc::clone(&collab.cache),
            config.bookmarks.policy,
        );

        let mut session = Self {
            gesture: GestureRecognizer::new(config.gesture.clone(), spec.viewport.width as f32),
            seek: SeekDebouncer::new(config.seek.settle),
            index: LocationIndex::unavailable(spec.document_id.clone()),
            read_aloud: ReadAloudLoop::new(settings, config.read_aloud.max_empty_pages),
            nav: NavigationController::new(),
            timers: Timers::default(),
            frames: HashSet::new(),
            subscriptions: Vec::new(),
            selection: None,
            pending_resize: None,
            overlay_visible: false,
            bookmarked: false,
            reported_read_aloud: ReadAloudState::Idle,
            turn_deferred: false,
            voices,
            sync,
            spec,
            rendition,
            collab,
            config,
            adapter,
            courier,
            events,
        };

        let courier = session.courier.clone();
        session
            .subscriptions
            .push(session.rendition.on(Arc::new(move |event| {
                courier.send(Input::Engine(event))
            })));
        let courier = session.courier.clone();
        session
            .subscriptions
            .push(session.collab.speech.on(Arc::new(move |event| {
                courier.send(Input::Speech(event))
            })));
        session.bind_frames();

        session.sync.load_local();
        session.emit(SessionEvent::AnnotationsChanged {
            count: session.sync.annotations().len(),
        });
        let last_read = session.last_read();
        session.refresh_position();
        if let Some(reference) = last_read {
            let current = session.nav.position().map(|p| p.canonical_ref.as_str());
            if current != Some(reference.as_str()) {
                debug!(%reference, "restoring last-read position");
                session.jump(reference, NavSource::Restore);
            }
        }
        session.spawn_index_build();
        if session.spec.mode == Mode::Remote {
            session.spawn_annotation_fetch();
        }
        session
    }

    fn teardown(mut self) {
        self.timers.cancel_all();
        if self.read_aloud.is_playing() || self.read_aloud.state() != ReadAloudState::Idle {
            self.collab.speech.cancel();
        }
        self.subscriptions.clear();
        self.frames.clear();
        self.rendition.destroy();
        debug!(document = %self.spec.document_id, "session torn down");
    }

    fn emit(&self, event: SessionEvent) {
        self.events.lock().push(event);
    }

    fn apply(&mut self, command: Command) -> Result<(), ReaderError> {
        match command {
            Command::Navigate { direction, source } => self.navigate(direction, source),
            Command::SeekTo { progress } => self.seek_to(progress),
            Command::ScrubBy { delta } => {
                if self.index.is_available() {
                    let base = self.seek.slider_value() as isize;
                    let last = self.index.total() as isize - 1;
                    self.seek_to((base + delta).clamp(0, last) as usize);
                }
            }
            Command::Pointer(event) => self.pointer(event),
            Command::SetOverlayVisible { visible } => {
                self.overlay_visible = visible;
                self.gesture.set_enabled(!visible);
            }
            Command::ToggleBookmark => {
                if self.bookmarked {
                    self.mutate(|sync| sync.set_bookmark(None))?;
                } else {
                    self.add_bookmark()?;
                }
            }
            Command::AddBookmark => self.add_bookmark()?,
            Command::RemoveBookmark => self.mutate(|sync| sync.set_bookmark(None))?,
            Command::GoToBookmark => {
                if let Some(bookmark) = self.sync.bookmark() {
                    let reference = bookmark.reference.clone();
                    self.jump(reference, NavSource::Jump);
                }
            }
            Command::AddAnnotation(annotation) => {
                self.mutate(|sync| sync.add_annotation(annotation))?;
            }
            Command::AnnotateSelection { color } => {
                if let Some((range, text)) = self.selection.take() {
                    let annotation = Annotation { range, text, color };
                    self.mutate(|sync| sync.add_annotation(annotation))?;
                }
            }
            Command::RemoveAnnotation { index } => {
                self.mutate(|sync| sync.remove_annotation(index))?;
            }
            Command::GoToAnnotation { index } => {
                if let Some(annotation) = self.sync.annotations().get(index) {
                    let reference = annotation.range.clone();
                    self.jump(reference, NavSource::Jump);
                }
            }
            Command::StartReadAloud => {
                let text = self.visible_text();
                let actions = self.read_aloud.start(&text);
                self.perform(actions);
            }
            Command::PauseReadAloud => {
                let actions = self.read_aloud.pause();
                self.perform(actions);
            }
            Command::ResumeReadAloud => {
                let actions = self.read_aloud.resume();
                self.perform(actions);
            }
            Command::StopReadAloud => {
                self.timers.cancel(TimerKind::ReadAloudSettle);
                let actions = self.read_aloud.stop();
                self.perform(actions);
            }
            Command::SetSpeechSettings(settings) => {
                let text = self.visible_text();
                let actions = self.read_aloud.settings_changed(settings, &text);
                self.perform(actions);
            }
            Command::Resize(size) => {
                self.pending_resize = Some(size);
                let deadline = Instant::now() + self.config.layout.resize_settle;
                self.timers
                    .schedule(TimerKind::Resize, deadline, &self.courier);
            }
        }
        Ok(())
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Engine(event) => self.engine_event(event),
            Input::Pointer(event) => self.pointer(event),
            Input::NavigationSettled { ticket, outcome } => self.settled(ticket, outcome),
            Input::IndexBuilt(index) => {
                self.index = index;
                if self.index.is_available() {
                    info!(total = self.index.total(), "location index ready");
                    self.emit(SessionEvent::IndexReady {
                        total: self.index.total(),
                    });
                } else {
                    self.emit(SessionEvent::IndexUnavailable {
                        error: ReaderError::IndexGeneration(
                            "engine produced no locations".into(),
                        ),
                    });
                }
                self.refresh_position();
            }
            Input::AnnotationsFetched(Ok(annotations)) => {
                if self.sync.apply_remote_annotations(annotations) {
                    self.emit(SessionEvent::AnnotationsChanged {
                        count: self.sync.annotations().len(),
                    });
                }
            }
            Input::AnnotationsFetched(Err(err)) => {
                warn!(%err, "annotation fetch failed, using local mirror");
                self.emit(SessionEvent::PersistFailed {
                    error: ReaderError::TransientNetwork(err),
                });
            }
            Input::Persisted { id, outcome } => self.persisted(id, outcome),
            Input::Speech(event) => self.speech_event(event),
            Input::Timer { kind, generation } => {
                if self.timers.accept(kind, generation) {
                    self.timer_fired(kind);
                }
            }
        }
    }

    fn engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Relocated(location) => self.apply_location(location),
            EngineEvent::Rendered { frame } => {
                debug!(frame, "content rendered");
                self.bind_frames();
            }
            EngineEvent::Selected { range, text } => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    return;
                }
                self.selection = Some((range, text.clone()));
                self.emit(SessionEvent::SelectionPending { text });
            }
            EngineEvent::KeyUp(Key::ArrowLeft) => {
                self.navigate(Direction::Prev, NavSource::Keyboard)
            }
            EngineEvent::KeyUp(Key::ArrowRight) => {
                self.navigate(Direction::Next, NavSource::Keyboard)
            }
            EngineEvent::KeyUp(Key::Other) | EngineEvent::Click => {}
        }
    }

    fn pointer(&mut self, event: PointerEvent) {
        if let GestureOutcome::Swipe(direction) = self.gesture.handle(event) {
            self.navigate(direction, NavSource::Gesture);
        }
    }

    fn navigate(&mut self, direction: Direction, source: NavSource) {
        if source.is_manual() {
            self.interrupt_read_aloud();
        }
        let admission = self.nav.request_step(direction, source);
        if admission == Admission::Dropped && source == NavSource::ReadAloud {
            debug!("read-aloud page turn waits for the pending call");
            self.turn_deferred = true;
            return;
        }
        self.admit(admission);
    }

    fn jump(&mut self, reference: String, source: NavSource) {
        if source.is_manual() {
            self.interrupt_read_aloud();
        }
        let admission = self.nav.request_jump(reference, source);
        self.admit(admission);
    }

    fn admit(&mut self, admission: Admission) {
        if let Admission::Dispatch(transition) = admission {
            self.issue(transition);
        }
    }

    /// Runs one engine call on its own task. The outcome comes back as
    /// `Input::NavigationSettled`.
    fn issue(&self, transition: Transition) {
        debug!(ticket = transition.ticket, call = ?transition.call, source = ?transition.source, "navigating");
        let rendition = Arc::clone(&self.rendition);
        let courier = self.courier.clone();
        tokio::spawn(async move {
            let outcome = match &transition.call {
                EngineCall::Next => rendition.next().await,
                EngineCall::Prev => rendition.prev().await,
                EngineCall::Display(reference) => rendition.display(Some(reference)).await,
            };
            courier.send(Input::NavigationSettled {
                ticket: transition.ticket,
                outcome,
            });
        });
    }

    fn settled(&mut self, ticket: u64, outcome: Result<(), EngineError>) {
        let Some(settled) = self.nav.settle(ticket, outcome) else {
            return;
        };
        let turned = settled.outcome.is_ok();
        match settled.outcome {
            Ok(()) => self.refresh_position(),
            Err(err) => {
                warn!(source = ?settled.source, %err, "navigation rejected");
                self.emit(SessionEvent::NavigationFailed {
                    source: settled.source,
                    error: ReaderError::NavigationRejected(err),
                });
            }
        }
        if settled.source == NavSource::ReadAloud {
            let actions = self.read_aloud.page_turned(turned);
            self.perform(actions);
        }
        if let Some(follow_up) = settled.follow_up {
            self.issue(follow_up);
        } else if std::mem::take(&mut self.turn_deferred) && self.read_aloud.is_turning_page() {
            self.navigate(Direction::Next, NavSource::ReadAloud);
        }
    }

    fn seek_to(&mut self, progress: usize) {
        if !self.index.is_available() {
            debug!(progress, "ignoring seek, location index unavailable");
            return;
        }
        let progress = progress.min(self.index.total() - 1);
        let deadline = self.seek.user_input(progress, Instant::now());
        self.timers.schedule(TimerKind::Seek, deadline, &self.courier);
    }

    fn timer_fired(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Seek => {
                let Some(progress) = self.seek.poll(Instant::now()) else {
                    return;
                };
                match self.index.ref_from_progress(progress) {
                    Some(reference) => self.jump(reference, NavSource::Seek),
                    None => warn!(progress, "no reference for settled seek"),
                }
            }
            TimerKind::Resize => {
                let Some(size) = self.pending_resize.take() else {
                    return;
                };
                let options = self.adapter.render_options(size, &self.config.layout);
                debug!(width = size.width, height = size.height, "relayout");
                self.rendition.resize(&options);
                self.gesture.set_viewport_width(size.width as f32);
                self.spec.viewport = size;
                self.refresh_position();
            }
            TimerKind::ReadAloudSettle => {
                let text = self.visible_text();
                let actions = self.read_aloud.layout_settled(&text);
                self.perform(actions);
            }
        }
    }

    fn refresh_position(&mut self) {
        if let Some(location) = self.rendition.current_location() {
            self.apply_location(location);
        }
    }

    /// Records a location the engine reports as rendered.
    fn apply_location(&mut self, location: RenderedLocation) {
        let reference = location.start.reference;
        let progress = if self.index.is_available() {
            location
                .start
                .location
                .or_else(|| self.index.progress_from_ref(&reference))
        } else {
            None
        };
        let position = CurrentPosition {
            linear_progress: progress,
            chapter_label: self.rendition.chapter_label(&reference).unwrap_or_default(),
            canonical_ref: reference.clone(),
            percentage: location.start.percentage,
        };
        if !self.nav.confirm(position) {
            return;
        }
        if let Some(progress) = progress {
            self.seek.feedback(progress);
        }
        if let Err(err) = self
            .collab
            .cache
            .set(&CacheKey::LastRead(self.spec.document_id.clone()), &reference)
        {
            warn!(error = %err, "failed to store last-read position");
        }
        self.selection = None;
        self.emit(SessionEvent::PositionChanged {
            reference,
            progress,
        });
        self.refresh_bookmark();
    }

    fn last_read(&self) -> Option<String> {
        let key = CacheKey::LastRead(self.spec.document_id.clone());
        match self.collab.cache.get(&key) {
            Ok(Some(reference)) if !reference.is_empty() => Some(reference),
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "failed to read last-read position");
                None
            }
        }
    }

    fn spawn_index_build(&self) {
        let builder = LocationIndexBuilder::new(
            Arc::clone(&self.collab.cache),
            self.config.locations.chunk_size,
        );
        let locations = self.rendition.locations();
        let document_id = self.spec.document_id.clone();
        let courier = self.courier.clone();
        tokio::spawn(async move {
            let index = builder.build_or_load(&document_id, locations).await;
            courier.send(Input::IndexBuilt(index));
        });
    }

    fn spawn_annotation_fetch(&self) {
        let remote = Arc::clone(&self.collab.remote);
        let document_id = self.spec.document_id.clone();
        let owner = self.spec.owner.clone();
        let courier = self.courier.clone();
        tokio::spawn(async move {
            let result = remote.fetch_annotations(&document_id, &owner).await;
            courier.send(Input::AnnotationsFetched(result));
        });
    }

    /// Binds pointer tracking to frames this session has not seen yet.
    fn bind_frames(&mut self) {
        for frame in self.rendition.contents() {
            if !self.frames.insert(frame.id()) {
                continue;
            }
            let courier = self.courier.clone();
            let subscription =
                frame.watch_pointer(Arc::new(move |event| courier.send(Input::Pointer(event))));
            self.subscriptions.push(subscription);
        }
    }

    fn visible_text(&self) -> String {
        self.rendition
            .contents()
            .iter()
            .map(|frame| frame.visible_text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn add_bookmark(&mut self) -> Result<(), ReaderError> {
        let Some(position) = self.nav.position() else {
            debug!("no confirmed position to bookmark");
            return Ok(());
        };
        let record = BookmarkRecord {
            reference: position.canonical_ref.clone(),
            percent: position.percentage,
        };
        self.mutate(|sync| sync.set_bookmark(Some(record)))
    }

    fn mutate(
        &mut self,
        change: impl FnOnce(&mut SyncManager) -> Result<Option<PendingPersist>, ReaderError>,
    ) -> Result<(), ReaderError> {
        let result = change(&mut self.sync);
        self.emit(SessionEvent::AnnotationsChanged {
            count: self.sync.annotations().len(),
        });
        self.refresh_bookmark();
        match result {
            Ok(Some(pending)) => {
                self.persist(pending);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => {
                warn!(%error, "local save failed");
                self.emit(SessionEvent::PersistFailed {
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    fn persist(&self, pending: PendingPersist) {
        let remote = Arc::clone(&self.collab.remote);
        let document_id = self.spec.document_id.clone();
        let owner = self.spec.owner.clone();
        let courier = self.courier.clone();
        tokio::spawn(async move {
            let outcome = match &pending.request {
                PersistRequest::Bookmark(bookmark) => {
                    remote
                        .save_bookmark(&document_id, &owner, bookmark.as_ref())
                        .await
                }
                PersistRequest::Annotations(annotations) => {
                    remote
                        .save_annotations(&document_id, &owner, annotations)
                        .await
                }
            };
            courier.send(Input::Persisted {
                id: pending.id,
                outcome,
            });
        });
    }

    fn persisted(&mut self, id: u64, outcome: Result<(), RemoteError>) {
        match self.sync.finish(id, outcome) {
            Some(SyncOutcome::Confirmed) => debug!(id, "remote save confirmed"),
            Some(SyncOutcome::Superseded(err)) => {
                debug!(id, %err, "remote save failed, left to a newer save")
            }
            Some(SyncOutcome::RolledBack(err)) => {
                self.emit(SessionEvent::PersistFailed {
                    error: ReaderError::TransientNetwork(err),
                });
                self.emit(SessionEvent::AnnotationsChanged {
                    count: self.sync.annotations().len(),
                });
                self.refresh_bookmark();
            }
            None => debug!(id, "unknown save id"),
        }
    }

    fn refresh_bookmark(&mut self) {
        let bookmarked = self
            .nav
            .position()
            .map(|position| self.sync.is_bookmarked(&position.canonical_ref))
            .unwrap_or(false);
        if bookmarked != self.bookmarked {
            self.bookmarked = bookmarked;
            self.emit(SessionEvent::BookmarkChanged { bookmarked });
        }
    }

    fn speech_event(&mut self, event: SpeechEvent) {
        let actions = match event.kind {
            SpeechEventKind::Started => {
                debug!(utterance = event.utterance, "utterance started");
                return;
            }
            SpeechEventKind::Ended => self.read_aloud.utterance_ended(event.utterance),
            SpeechEventKind::Failed(message) => self
                .read_aloud
                .utterance_failed(event.utterance, SpeechError::Failed(message)),
        };
        self.perform(actions);
    }

    fn interrupt_read_aloud(&mut self) {
        if self.read_aloud.is_playing() {
            self.timers.cancel(TimerKind::ReadAloudSettle);
            let actions = self.read_aloud.interrupt();
            self.perform(actions);
        }
    }

    fn perform(&mut self, actions: Vec<LoopAction>) {
        for action in actions {
            match action {
                LoopAction::Speak(utterance) => {
                    let id = utterance.id;
                    if let Err(err) = self.collab.speech.speak(utterance) {
                        let actions = self.read_aloud.utterance_failed(id, err);
                        self.perform(actions);
                    }
                }
                LoopAction::Pause => self.collab.speech.pause(),
                LoopAction::Resume => self.collab.speech.resume(),
                LoopAction::Cancel => self.collab.speech.cancel(),
                LoopAction::TurnPage => self.navigate(Direction::Next, NavSource::ReadAloud),
                LoopAction::AwaitLayout => {
                    let deadline = Instant::now() + self.config.read_aloud.layout_settle;
                    self.timers
                        .schedule(TimerKind::ReadAloudSettle, deadline, &self.courier);
                }
                LoopAction::Failed(err) => {
                    warn!(%err, "read-aloud stopped");
                    self.emit(SessionEvent::ReadAloudFailed {
                        error: ReaderError::Speech(err),
                    });
                }
            }
        }
        let state = self.read_aloud.state();
        if state != self.reported_read_aloud {
            self.reported_read_aloud = state;
            self.emit(SessionEvent::ReadAloudChanged(state));
        }
    }

    fn view(&self, status: SessionStatus) -> ReaderView {
        let position = self.nav.position().cloned();
        let linear_progress = position.as_ref().and_then(|p| p.linear_progress);
        ReaderView {
            status,
            document_id: Some(self.spec.document_id.clone()),
            chapter_label: position
                .as_ref()
                .map(|p| p.chapter_label.clone())
                .unwrap_or_default(),
            progress_percent: linear_progress.and_then(|p| self.index.percent(p)),
            linear_progress,
            position,
            total_locations: self.index.total(),
            slider_value: self.seek.slider_value(),
            is_bookmarked: self.bookmarked,
            is_transitioning: self.nav.is_pending(),
            overlay_visible: self.overlay_visible,
            read_aloud: self.read_aloud.state(),
            voices: self.voices.clone(),
            annotations: self.sync.annotations().to_vec(),
            bookmark: self.sync.bookmark().cloned(),
            page_text: self.visible_text(),
        }
    }
}

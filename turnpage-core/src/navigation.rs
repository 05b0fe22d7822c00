use tracing::debug;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Next,
    Prev,
}

/// Where a navigation request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavSource {
    Gesture,
    Keyboard,
    Control,
    Seek,
    Jump,
    Restore,
    ReadAloud,
}

impl NavSource {
    /// Navigation the reader asked for directly. Stops an active read-aloud
    /// loop.
    pub fn is_manual(self) -> bool {
        matches!(
            self,
            NavSource::Gesture
                | NavSource::Keyboard
                | NavSource::Control
                | NavSource::Seek
                | NavSource::Jump
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Next,
    Prev,
    Display(String),
}

impl EngineCall {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            EngineCall::Next => Some(Direction::Next),
            EngineCall::Prev => Some(Direction::Prev),
            EngineCall::Display(_) => None,
        }
    }
}

/// The reader's confirmed position. Only ever built from a location the
/// engine reported as rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentPosition {
    pub linear_progress: Option<usize>,
    pub canonical_ref: String,
    pub chapter_label: String,
    pub percentage: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub ticket: u64,
    pub call: EngineCall,
    pub source: NavSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Issue this call to the engine now.
    Dispatch(Transition),
    /// A step arrived while another transition was pending.
    Dropped,
    /// A jump arrived while pending; it runs once the current call settles,
    /// replacing any jump deferred earlier.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub source: NavSource,
    pub call: EngineCall,
    pub outcome: Result<(), EngineError>,
    pub follow_up: Option<Transition>,
}

/// Single owner of the current position and the in-flight transition.
#[derive(Debug, Default)]
pub struct NavigationController {
    pending: Option<Transition>,
    deferred: Option<(String, NavSource)>,
    position: Option<CurrentPosition>,
    next_ticket: u64,
}

impl NavigationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_step(&mut self, direction: Direction, source: NavSource) -> Admission {
        if let Some(pending) = &self.pending {
            debug!(?direction, ?source, pending = ?pending.source, "dropping step while pending");
            return Admission::Dropped;
        }
        let call = match direction {
            Direction::Next => EngineCall::Next,
            Direction::Prev => EngineCall::Prev,
        };
        Admission::Dispatch(self.begin(call, source))
    }

    pub fn request_jump(&mut self, reference: String, source: NavSource) -> Admission {
        if self.pending.is_some() {
            debug!(%reference, ?source, "deferring jump until the pending call settles");
            self.deferred = Some((reference, source));
            return Admission::Deferred;
        }
        Admission::Dispatch(self.begin(EngineCall::Display(reference), source))
    }

    /// Resolves the pending transition. Returns `None` for a ticket that is
    /// not the pending one.
    pub fn settle(&mut self, ticket: u64, outcome: Result<(), EngineError>) -> Option<Settled> {
        match &self.pending {
            Some(pending) if pending.ticket == ticket => {}
            _ => {
                debug!(ticket, "ignoring settlement for unknown ticket");
                return None;
            }
        }
        let finished = self.pending.take()?;
        let follow_up = self
            .deferred
            .take()
            .map(|(reference, source)| self.begin(EngineCall::Display(reference), source));
        Some(Settled {
            source: finished.source,
            call: finished.call,
            outcome,
            follow_up,
        })
    }

    /// Records a location the engine confirmed as rendered. Returns whether
    /// the position changed.
    pub fn confirm(&mut self, position: CurrentPosition) -> bool {
        if self.position.as_ref() == Some(&position) {
            return false;
        }
        self.position = Some(position);
        true
    }

    pub fn position(&self) -> Option<&CurrentPosition> {
        self.position.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn transition(&self) -> Option<&Transition> {
        self.pending.as_ref()
    }

    fn begin(&mut self, call: EngineCall, source: NavSource) -> Transition {
        self.next_ticket += 1;
        let transition = Transition {
            ticket: self.next_ticket,
            call,
            source,
        };
        self.pending = Some(transition.clone());
        transition
    }
}

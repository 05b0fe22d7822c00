use tracing::debug;

use crate::error::SpeechError;
use crate::speech::{SpeechSettings, Utterance, UtteranceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAloudState {
    Idle,
    Speaking,
    Paused,
    /// Waiting for the page turn issued after an utterance ended.
    TurningPage,
    /// The page turned; waiting for layout to settle before extracting.
    AwaitingLayout,
}

/// Side effects the host performs on behalf of the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopAction {
    Speak(Utterance),
    Pause,
    Resume,
    Cancel,
    TurnPage,
    AwaitLayout,
    Failed(SpeechError),
}

/// Page-by-page read-aloud driver. Pure state machine: every method returns
/// the actions to perform and never touches the speech engine itself.
#[derive(Debug)]
pub struct ReadAloudLoop {
    settings: SpeechSettings,
    max_empty_pages: usize,
    state: ReadAloudState,
    playing: bool,
    /// Pause requested between pages; the next utterance starts paused.
    hold: bool,
    current: Option<UtteranceId>,
    next_id: UtteranceId,
    empty_streak: usize,
}

impl ReadAloudLoop {
    pub fn new(settings: SpeechSettings, max_empty_pages: usize) -> Self {
        Self {
            settings,
            max_empty_pages,
            state: ReadAloudState::Idle,
            playing: false,
            hold: false,
            current: None,
            next_id: 0,
            empty_streak: 0,
        }
    }

    pub fn state(&self) -> ReadAloudState {
        if self.hold {
            ReadAloudState::Paused
        } else {
            self.state
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Waiting on the page turn requested by [`LoopAction::TurnPage`].
    pub fn is_turning_page(&self) -> bool {
        self.playing && self.state == ReadAloudState::TurningPage
    }

    pub fn settings(&self) -> &SpeechSettings {
        &self.settings
    }

    pub fn current_utterance(&self) -> Option<UtteranceId> {
        self.current
    }

    /// Starts reading `text`, the text visible in the viewport.
    pub fn start(&mut self, text: &str) -> Vec<LoopAction> {
        if self.playing {
            return Vec::new();
        }
        self.playing = true;
        self.empty_streak = 0;
        self.speak_or_skip(text)
    }

    /// Suspends the utterance; the loop keeps its intent to continue.
    pub fn pause(&mut self) -> Vec<LoopAction> {
        match self.state {
            ReadAloudState::Speaking => {
                self.state = ReadAloudState::Paused;
                vec![LoopAction::Pause]
            }
            ReadAloudState::TurningPage | ReadAloudState::AwaitingLayout if self.playing => {
                debug!("pause requested between pages");
                self.hold = true;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    pub fn resume(&mut self) -> Vec<LoopAction> {
        if self.hold {
            self.hold = false;
            return Vec::new();
        }
        if self.state != ReadAloudState::Paused {
            return Vec::new();
        }
        self.state = ReadAloudState::Speaking;
        vec![LoopAction::Resume]
    }

    /// Cancels speech and clears the intent to continue, so a later page
    /// render cannot restart the loop.
    pub fn stop(&mut self) -> Vec<LoopAction> {
        if !self.playing && self.state == ReadAloudState::Idle {
            return Vec::new();
        }
        self.halt();
        vec![LoopAction::Cancel]
    }

    /// Called when the reader navigates by hand.
    pub fn interrupt(&mut self) -> Vec<LoopAction> {
        if !self.playing {
            return Vec::new();
        }
        debug!("manual navigation stops read-aloud");
        self.stop()
    }

    pub fn utterance_ended(&mut self, id: UtteranceId) -> Vec<LoopAction> {
        if self.current != Some(id) {
            return Vec::new();
        }
        self.current = None;
        if !self.playing {
            self.state = ReadAloudState::Idle;
            return Vec::new();
        }
        self.state = ReadAloudState::TurningPage;
        vec![LoopAction::TurnPage]
    }

    pub fn utterance_failed(&mut self, id: UtteranceId, error: SpeechError) -> Vec<LoopAction> {
        if self.current != Some(id) {
            return Vec::new();
        }
        self.halt();
        vec![LoopAction::Failed(error)]
    }

    /// Result of the page turn requested by [`LoopAction::TurnPage`]. A
    /// rejected turn means the end of the document and ends the loop.
    pub fn page_turned(&mut self, turned: bool) -> Vec<LoopAction> {
        if self.state != ReadAloudState::TurningPage {
            return Vec::new();
        }
        if turned {
            self.state = ReadAloudState::AwaitingLayout;
            vec![LoopAction::AwaitLayout]
        } else {
            debug!("page turn rejected, read-aloud finished");
            self.halt();
            Vec::new()
        }
    }

    pub fn layout_settled(&mut self, text: &str) -> Vec<LoopAction> {
        if self.state != ReadAloudState::AwaitingLayout || !self.playing {
            return Vec::new();
        }
        self.speak_or_skip(text)
    }

    /// Applies new voice settings. An utterance in progress restarts against
    /// `text`, the current viewport text.
    pub fn settings_changed(&mut self, settings: SpeechSettings, text: &str) -> Vec<LoopAction> {
        self.settings = settings;
        if self.state != ReadAloudState::Speaking {
            return Vec::new();
        }
        let mut actions = vec![LoopAction::Cancel];
        self.current = None;
        self.empty_streak = 0;
        actions.extend(self.speak_or_skip(text));
        actions
    }

    fn speak_or_skip(&mut self, text: &str) -> Vec<LoopAction> {
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            self.empty_streak += 1;
            if self.empty_streak > self.max_empty_pages {
                debug!(pages = self.empty_streak, "too many empty pages, stopping read-aloud");
                self.halt();
                return Vec::new();
            }
            self.state = ReadAloudState::TurningPage;
            return vec![LoopAction::TurnPage];
        }

        self.empty_streak = 0;
        self.next_id += 1;
        self.current = Some(self.next_id);
        self.state = ReadAloudState::Speaking;
        let mut actions = vec![LoopAction::Speak(Utterance {
            id: self.next_id,
            text,
            rate: self.settings.rate,
            volume: self.settings.volume,
            voice: self.settings.voice.clone(),
        })];
        if std::mem::take(&mut self.hold) {
            self.state = ReadAloudState::Paused;
            actions.push(LoopAction::Pause);
        }
        actions
    }

    fn halt(&mut self) {
        self.playing = false;
        self.hold = false;
        self.current = None;
        self.state = ReadAloudState::Idle;
    }
}

use std::time::Duration;

use tokio::time::Instant;

/// Trailing debounce for the progress slider.
///
/// The slider value is written from two directions: the user scrubbing, and
/// relocation feedback after any navigation. Only user input arms the
/// debouncer, and the arm is consumed by the settled value, so feedback can
/// never re-trigger a seek.
#[derive(Debug)]
pub struct SeekDebouncer {
    window: Duration,
    slider: usize,
    armed: bool,
    deadline: Option<Instant>,
}

impl SeekDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slider: 0,
            armed: false,
            deadline: None,
        }
    }

    pub fn slider_value(&self) -> usize {
        self.slider
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Records a user-initiated seek and returns the new settle deadline.
    pub fn user_input(&mut self, progress: usize, now: Instant) -> Instant {
        self.slider = progress;
        self.armed = true;
        let deadline = now + self.window;
        self.deadline = Some(deadline);
        deadline
    }

    /// Relocation feedback. Ignored while a user seek is settling so the
    /// slider does not jump under the reader's finger.
    pub fn feedback(&mut self, progress: usize) {
        if !self.armed {
            self.slider = progress;
        }
    }

    /// Returns the settled value once the window has passed without further
    /// input. Yields each settled value at most once.
    pub fn poll(&mut self, now: Instant) -> Option<usize> {
        let deadline = self.deadline?;
        if !self.armed || now < deadline {
            return None;
        }
        self.armed = false;
        self.deadline = None;
        Some(self.slider)
    }

    pub fn cancel(&mut self) {
        self.armed = false;
        self.deadline = None;
    }
}

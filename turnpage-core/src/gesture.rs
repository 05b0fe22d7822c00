use tracing::debug;

use crate::config::GestureConfig;
use crate::navigation::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerPhase {
    Down,
    Move,
    Up,
    Cancel,
}

/// What the pointer landed on when the sequence started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTarget {
    Content,
    /// Buttons, sliders and other controls nested in the viewport.
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerEvent {
    pub phase: PointerPhase,
    pub x: f32,
    pub y: f32,
    pub touches: usize,
    pub target: HitTarget,
}

impl PointerEvent {
    pub fn new(phase: PointerPhase, x: f32, y: f32) -> Self {
        Self {
            phase,
            x,
            y,
            touches: 1,
            target: HitTarget::Content,
        }
    }

    pub fn on_control(mut self) -> Self {
        self.target = HitTarget::Control;
        self
    }

    pub fn with_touches(mut self, touches: usize) -> Self {
        self.touches = touches;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GestureOutcome {
    Ignored,
    Tracking,
    /// A horizontal drag is in progress; the front end should suppress the
    /// default scroll and selection behaviour.
    Dragging { dx: f32 },
    Swipe(Direction),
    /// The sequence ended without turning the page.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
struct Track {
    start_x: f32,
    start_y: f32,
    dragging: bool,
}

pub struct GestureRecognizer {
    config: GestureConfig,
    viewport_width: f32,
    enabled: bool,
    track: Option<Track>,
}

impl GestureRecognizer {
    pub fn new(config: GestureConfig, viewport_width: f32) -> Self {
        Self {
            config,
            viewport_width,
            enabled: true,
            track: None,
        }
    }

    /// Disabled while an exclusive overlay panel is visible.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.track = None;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_viewport_width(&mut self, width: f32) {
        self.viewport_width = width;
    }

    pub fn release_threshold(&self) -> f32 {
        self.viewport_width * self.config.release_fraction
    }

    pub fn handle(&mut self, event: PointerEvent) -> GestureOutcome {
        if !self.enabled {
            self.track = None;
            return GestureOutcome::Ignored;
        }
        if event.touches != 1 {
            self.track = None;
            return GestureOutcome::Ignored;
        }

        match event.phase {
            PointerPhase::Down => {
                if event.target == HitTarget::Control {
                    self.track = None;
                    return GestureOutcome::Ignored;
                }
                self.track = Some(Track {
                    start_x: event.x,
                    start_y: event.y,
                    dragging: false,
                });
                GestureOutcome::Tracking
            }
            PointerPhase::Move => {
                let Some(track) = self.track.as_mut() else {
                    return GestureOutcome::Ignored;
                };
                let dx = event.x - track.start_x;
                let dy = event.y - track.start_y;
                if !track.dragging
                    && dx.abs() > dy.abs()
                    && dx.abs() > self.config.activation_px
                {
                    track.dragging = true;
                }
                if track.dragging {
                    GestureOutcome::Dragging { dx }
                } else {
                    GestureOutcome::Tracking
                }
            }
            PointerPhase::Up => {
                let Some(track) = self.track.take() else {
                    return GestureOutcome::Ignored;
                };
                if !track.dragging {
                    return GestureOutcome::Cancelled;
                }
                let dx = event.x - track.start_x;
                if dx.abs() > self.release_threshold() {
                    let direction = if dx < 0.0 {
                        Direction::Next
                    } else {
                        Direction::Prev
                    };
                    debug!(dx, ?direction, "swipe committed");
                    GestureOutcome::Swipe(direction)
                } else {
                    GestureOutcome::Cancelled
                }
            }
            PointerPhase::Cancel => {
                if self.track.take().is_some() {
                    GestureOutcome::Cancelled
                } else {
                    GestureOutcome::Ignored
                }
            }
        }
    }
}

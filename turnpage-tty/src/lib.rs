use std::io::{self, Write};

use anyhow::Result;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind},
    style::Print,
    terminal::{Clear, ClearType},
};
use turnpage_core::{
    Command, Direction, NavSource, PointerEvent, PointerPhase, ReadAloudState, ReaderView,
    SessionStatus, ViewportSize,
};

/// Rows reserved below the page for the status line.
pub const STATUS_ROWS: u16 = 1;

pub fn page_viewport(columns: u16, rows: u16) -> ViewportSize {
    ViewportSize {
        width: u32::from(columns.max(1)),
        height: u32::from(rows.saturating_sub(STATUS_ROWS).max(1)),
    }
}

#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(Command),
    /// Start or stop read-aloud depending on the current state.
    ToggleReadAloud,
    /// Pause or resume read-aloud depending on the current state.
    TogglePause,
    ToggleOverlay,
    Quit,
    None,
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
}

impl EventMapper {
    /// Locations moved by one press of `[` or `]`.
    pub const SCRUB_STEP: isize = 10;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(key) => self.map_key(key),
            Event::Mouse(mouse) => self.map_mouse(mouse),
            Event::Resize(columns, rows) => {
                UiEvent::Command(Command::Resize(page_viewport(columns, rows)))
            }
            _ => UiEvent::None,
        }
    }

    fn map_key(&mut self, KeyEvent { code, modifiers, .. }: KeyEvent) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Right, KeyModifiers::NONE)
            | (KeyCode::Char('l'), KeyModifiers::NONE)
            | (KeyCode::Char(' '), KeyModifiers::NONE) => self.navigate(Direction::Next),
            (KeyCode::Left, KeyModifiers::NONE) | (KeyCode::Char('h'), KeyModifiers::NONE) => {
                self.navigate(Direction::Prev)
            }
            (KeyCode::Char('g'), KeyModifiers::NONE) => {
                let progress = self.pending_count.take().unwrap_or(0);
                self.pending_digits.clear();
                UiEvent::Command(Command::SeekTo { progress })
            }
            (KeyCode::Char(']'), _) => {
                let count = self.take_count() as isize;
                UiEvent::Command(Command::ScrubBy {
                    delta: count.saturating_mul(Self::SCRUB_STEP),
                })
            }
            (KeyCode::Char('['), _) => {
                let count = self.take_count() as isize;
                UiEvent::Command(Command::ScrubBy {
                    delta: count.saturating_mul(-Self::SCRUB_STEP),
                })
            }
            (KeyCode::Char('b'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(Command::ToggleBookmark)
            }
            (KeyCode::Char('B'), modifiers)
                if modifiers.is_empty() || modifiers == KeyModifiers::SHIFT =>
            {
                self.reset_count();
                UiEvent::Command(Command::GoToBookmark)
            }
            (KeyCode::Char('r'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::ToggleReadAloud
            }
            (KeyCode::Char('p'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::TogglePause
            }
            (KeyCode::Char('a'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::ToggleOverlay
            }
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_mouse(&mut self, mouse: MouseEvent) -> UiEvent {
        let phase = match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) => PointerPhase::Down,
            MouseEventKind::Drag(MouseButton::Left) => PointerPhase::Move,
            MouseEventKind::Up(MouseButton::Left) => PointerPhase::Up,
            _ => return UiEvent::None,
        };
        UiEvent::Command(Command::Pointer(PointerEvent::new(
            phase,
            f32::from(mouse.column),
            f32::from(mouse.row),
        )))
    }

    fn navigate(&mut self, direction: Direction) -> UiEvent {
        self.reset_count();
        UiEvent::Command(Command::Navigate {
            direction,
            source: NavSource::Keyboard,
        })
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}

/// One-line summary of the reader state for the bottom of the screen.
pub fn status_label(view: &ReaderView, pending: Option<&str>) -> String {
    let mut parts = Vec::new();
    match &view.status {
        SessionStatus::Loading => parts.push("loading…".to_string()),
        SessionStatus::Errored(reason) => parts.push(format!("failed to open document: {}", reason)),
        SessionStatus::Closed => parts.push("no document".to_string()),
        SessionStatus::Ready => {}
    }
    if !view.chapter_label.is_empty() {
        parts.push(view.chapter_label.clone());
    }
    match (view.progress_percent, view.linear_progress) {
        (Some(percent), Some(location)) => parts.push(format!(
            "{:.0}% ({}/{})",
            percent,
            location + 1,
            view.total_locations
        )),
        (Some(percent), None) => parts.push(format!("{:.0}%", percent)),
        _ => {}
    }
    if view.is_bookmarked {
        parts.push("[bookmarked]".to_string());
    }
    match view.read_aloud {
        ReadAloudState::Idle => {}
        ReadAloudState::Paused => parts.push("read-aloud paused".to_string()),
        _ => parts.push("reading aloud".to_string()),
    }
    if view.overlay_visible {
        parts.push(format!("{} annotations", view.annotations.len()));
    }
    if let Some(pending) = pending {
        parts.push(pending.to_string());
    }
    parts.join(" | ")
}

/// Draws `text` into the top `rows` rows, wrapping to `columns`.
pub fn draw_page<W: Write>(writer: &mut W, text: &str, columns: u16, rows: u16) -> Result<()> {
    crossterm::queue!(writer, Clear(ClearType::All))?;
    let width = usize::from(columns.max(1));
    let lines = text
        .lines()
        .flat_map(|line| {
            if line.is_empty() {
                vec![String::new()]
            } else {
                textwrap::wrap(line, width)
                    .into_iter()
                    .map(|wrapped| wrapped.into_owned())
                    .collect()
            }
        })
        .take(usize::from(rows));
    for (row, line) in lines.enumerate() {
        crossterm::queue!(writer, cursor::MoveTo(0, row as u16), Print(line))?;
    }
    Ok(())
}

/// Writes `label` on the last terminal row.
pub fn draw_status<W: Write>(writer: &mut W, label: &str, columns: u16, rows: u16) -> Result<()> {
    let label: String = label.chars().take(usize::from(columns)).collect();
    crossterm::queue!(
        writer,
        cursor::MoveTo(0, rows.saturating_sub(STATUS_ROWS)),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(writer, &label)?;
    Ok(())
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEventKind, KeyEventState};

    fn key_event(code: KeyCode) -> Event {
        key_event_with_modifiers(code, KeyModifiers::NONE)
    }

    fn key_event_with_modifiers(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        })
    }

    fn mouse(kind: MouseEventKind, column: u16, row: u16) -> Event {
        Event::Mouse(MouseEvent {
            kind,
            column,
            row,
            modifiers: KeyModifiers::NONE,
        })
    }

    #[test]
    fn arrows_and_letters_navigate_as_keyboard() {
        let mut mapper = EventMapper::new();
        for code in [KeyCode::Right, KeyCode::Char('l'), KeyCode::Char(' ')] {
            match mapper.map_event(key_event(code)) {
                UiEvent::Command(Command::Navigate {
                    direction: Direction::Next,
                    source: NavSource::Keyboard,
                }) => {}
                other => panic!("unexpected event: {:?}", other),
            }
        }
        match mapper.map_event(key_event(KeyCode::Char('h'))) {
            UiEvent::Command(Command::Navigate {
                direction: Direction::Prev,
                ..
            }) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn digits_then_g_seeks_to_location() {
        let mut mapper = EventMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('4'))),
            UiEvent::None
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('2'))),
            UiEvent::None
        ));
        assert_eq!(mapper.pending_input().as_deref(), Some("42"));

        match mapper.map_event(key_event(KeyCode::Char('g'))) {
            UiEvent::Command(Command::SeekTo { progress }) => assert_eq!(progress, 42),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(mapper.pending_input().is_none());

        match mapper.map_event(key_event(KeyCode::Char('g'))) {
            UiEvent::Command(Command::SeekTo { progress }) => assert_eq!(progress, 0),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn brackets_scrub_by_counted_steps() {
        let mut mapper = EventMapper::new();
        match mapper.map_event(key_event(KeyCode::Char(']'))) {
            UiEvent::Command(Command::ScrubBy { delta }) => {
                assert_eq!(delta, EventMapper::SCRUB_STEP)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        mapper.map_event(key_event(KeyCode::Char('3')));
        match mapper.map_event(key_event(KeyCode::Char('['))) {
            UiEvent::Command(Command::ScrubBy { delta }) => {
                assert_eq!(delta, -3 * EventMapper::SCRUB_STEP)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn prefix_is_dropped_by_other_keys() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('7')));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('b'))),
            UiEvent::Command(Command::ToggleBookmark)
        ));
        match mapper.map_event(key_event(KeyCode::Char('g'))) {
            UiEvent::Command(Command::SeekTo { progress }) => assert_eq!(progress, 0),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn letter_shortcuts() {
        let mut mapper = EventMapper::new();
        assert!(matches!(
            mapper.map_event(key_event_with_modifiers(
                KeyCode::Char('B'),
                KeyModifiers::SHIFT
            )),
            UiEvent::Command(Command::GoToBookmark)
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('r'))),
            UiEvent::ToggleReadAloud
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('p'))),
            UiEvent::TogglePause
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('a'))),
            UiEvent::ToggleOverlay
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('q'))),
            UiEvent::Quit
        ));
    }

    #[test]
    fn left_button_drags_become_pointer_events() {
        let mut mapper = EventMapper::new();
        let phases: Vec<PointerPhase> = [
            mouse(MouseEventKind::Down(MouseButton::Left), 60, 5),
            mouse(MouseEventKind::Drag(MouseButton::Left), 30, 5),
            mouse(MouseEventKind::Up(MouseButton::Left), 10, 6),
        ]
        .into_iter()
        .map(|event| match mapper.map_event(event) {
            UiEvent::Command(Command::Pointer(pointer)) => pointer.phase,
            other => panic!("unexpected event: {:?}", other),
        })
        .collect();
        assert_eq!(
            phases,
            vec![PointerPhase::Down, PointerPhase::Move, PointerPhase::Up]
        );
        assert!(matches!(
            mapper.map_event(mouse(MouseEventKind::Down(MouseButton::Right), 1, 1)),
            UiEvent::None
        ));
    }

    #[test]
    fn terminal_resize_leaves_room_for_status() {
        let mut mapper = EventMapper::new();
        match mapper.map_event(Event::Resize(100, 40)) {
            UiEvent::Command(Command::Resize(size)) => {
                assert_eq!(size.width, 100);
                assert_eq!(size.height, 39);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn status_label_summarises_view() {
        let view = ReaderView {
            status: SessionStatus::Ready,
            chapter_label: "Loomings".into(),
            progress_percent: Some(42.4),
            linear_progress: Some(9),
            total_locations: 200,
            is_bookmarked: true,
            read_aloud: ReadAloudState::Speaking,
            ..ReaderView::default()
        };
        assert_eq!(
            status_label(&view, Some("12")),
            "Loomings | 42% (10/200) | [bookmarked] | reading aloud | 12"
        );
    }

    #[test]
    fn draw_page_clips_to_rows() {
        let mut output = Vec::new();
        draw_page(&mut output, "one\ntwo\nthree", 20, 2).unwrap();
        let rendered = String::from_utf8(output).unwrap();
        assert!(rendered.contains("one"));
        assert!(rendered.contains("two"));
        assert!(!rendered.contains("three"));
    }

    #[test]
    fn write_status_line_flushes_label() {
        let mut output = Vec::new();
        draw_status(&mut output, "Loomings | 3%", 8, 24).unwrap();
        let rendered = String::from_utf8(output).unwrap();
        assert!(rendered.ends_with("Loomings"));
    }
}

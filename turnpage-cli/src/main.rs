mod speech;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use turnpage_core::{
    select_viewport_adapter, Collaborators, Command, DocumentId, DocumentSpec, FileCache,
    LocalCache, Mode, OfflineStore, ReadAloudState, Reader, ReaderConfig, ReaderView,
    RemoteStore, SessionEvent, SilentSpeech, SpeechEngine,
};
use turnpage_remote::HttpRemoteStore;
use turnpage_render::TextEngineProvider;
use turnpage_tty::{draw_page, draw_status, page_viewport, status_label, EventMapper, UiEvent};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::speech::SimulatedSpeech;

#[derive(Debug, Parser)]
#[command(
    name = "turnpage",
    version,
    about = "Paginated terminal reader with bookmarks, annotations and read-aloud"
)]
struct Args {
    /// Identity sent with remote bookmark and annotation saves
    #[arg(long, default_value = "local")]
    owner: String,

    /// Remote annotation store; switches the session to remote mode
    #[arg(long = "remote-url")]
    remote_url: Option<String>,

    /// Document id (defaults to one derived from the file path)
    #[arg(long = "document-id")]
    document_id: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disable read-aloud
    #[arg(long)]
    silent: bool,

    /// Text file to read
    file: PathBuf,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        crossterm::execute!(io::stdout(), EnableMouseCapture, cursor::Hide)?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, DisableMouseCapture, cursor::Show);
        let _ = terminal::disable_raw_mode();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "turnpage", "turnpage")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config = load_config(args.config.as_deref())?;
    let remote_url = args.remote_url.clone().or_else(|| config.remote.base_url.clone());
    let mode = if remote_url.is_some() {
        Mode::Remote
    } else {
        Mode::Preview
    };

    let cache: Arc<dyn LocalCache> = Arc::new(FileCache::new(
        project_dirs.data_local_dir().join("cache"),
    )?);
    let remote: Arc<dyn RemoteStore> = match &remote_url {
        Some(url) => Arc::new(HttpRemoteStore::new(url, config.remote.timeout)?),
        None => Arc::new(OfflineStore),
    };
    let speech: Arc<dyn SpeechEngine> = if args.silent {
        Arc::new(SilentSpeech)
    } else {
        Arc::new(SimulatedSpeech::new())
    };

    let (columns, rows) = terminal::size().context("failed to query terminal size")?;
    let viewport = page_viewport(columns, rows);
    let adapter = select_viewport_adapter(viewport, &config.layout);
    let collab = Collaborators {
        engine: Arc::new(TextEngineProvider::new()),
        cache,
        remote,
        speech,
    };
    let mut reader = Reader::new(collab, config, adapter);

    let document_id = match &args.document_id {
        Some(id) => DocumentId::new(id.clone()),
        None => DocumentId::for_path(&args.file),
    };
    let spec = DocumentSpec {
        document_id,
        resource: args.file.to_string_lossy().into_owned(),
        mode,
        owner: args.owner.clone(),
        viewport,
    };
    reader
        .open(spec)
        .await
        .with_context(|| format!("failed to open {:?}", args.file))?;
    info!(file = ?args.file, ?mode, "reading");

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    let mut mapper = EventMapper::new();
    let mut notices = Notices::new(&reader);
    let mut last_view: Option<ReaderView> = None;
    let mut size = (columns, rows);

    loop {
        reader.pump(Duration::from_millis(15)).await;
        notices.collect(&reader);

        let view = reader.view();
        if last_view.as_ref() != Some(&view) || notices.dirty {
            redraw(&mut stdout, &view, &mapper, &notices, size)?;
            notices.dirty = false;
            last_view = Some(view.clone());
        }

        if !event::poll(Duration::from_millis(35))? {
            continue;
        }
        let ui_event = mapper.map_event(event::read()?);
        if let UiEvent::Command(Command::Resize(_)) = &ui_event {
            size = terminal::size()?;
        }
        let command = match ui_event {
            UiEvent::Command(command) => Some(command),
            UiEvent::ToggleReadAloud => Some(match view.read_aloud {
                ReadAloudState::Idle => Command::StartReadAloud,
                _ => Command::StopReadAloud,
            }),
            UiEvent::TogglePause => match view.read_aloud {
                ReadAloudState::Paused => Some(Command::ResumeReadAloud),
                ReadAloudState::Speaking => Some(Command::PauseReadAloud),
                _ => None,
            },
            UiEvent::ToggleOverlay => Some(Command::SetOverlayVisible {
                visible: !view.overlay_visible,
            }),
            UiEvent::Quit => break,
            UiEvent::None => None,
        };
        // Pending digit prefixes change the status line without changing the view.
        notices.dirty = true;
        if let Some(command) = command {
            if let Err(err) = reader.dispatch(command) {
                warn!(error = %err, "command rejected");
                notices.push(err.to_string());
            }
        }
    }

    reader.close();
    crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    Ok(())
}

/// Recoverable errors surfaced on the status line until the next one.
struct Notices {
    seen: usize,
    latest: Option<String>,
    dirty: bool,
}

impl Notices {
    fn new(reader: &Reader) -> Self {
        Self {
            seen: reader.events().lock().len(),
            latest: None,
            dirty: true,
        }
    }

    fn collect(&mut self, reader: &Reader) {
        let events = reader.events();
        let events = events.lock();
        for event in events.iter().skip(self.seen) {
            let message = match event {
                SessionEvent::NavigationFailed { error, .. }
                | SessionEvent::PersistFailed { error }
                | SessionEvent::ReadAloudFailed { error }
                | SessionEvent::IndexUnavailable { error } => Some(error.to_string()),
                SessionEvent::PositionChanged { .. } => {
                    self.latest = None;
                    None
                }
                _ => None,
            };
            if let Some(message) = message {
                self.latest = Some(message);
            }
            self.dirty = true;
        }
        self.seen = events.len();
    }

    fn push(&mut self, message: String) {
        self.latest = Some(message);
        self.dirty = true;
    }
}

fn redraw<W: Write>(
    writer: &mut W,
    view: &ReaderView,
    mapper: &EventMapper,
    notices: &Notices,
    (columns, rows): (u16, u16),
) -> Result<()> {
    let page_rows = rows.saturating_sub(turnpage_tty::STATUS_ROWS);
    let body = if view.overlay_visible {
        overlay_text(view)
    } else {
        view.page_text.clone()
    };
    draw_page(writer, &body, columns, page_rows)?;

    let pending = mapper.pending_input();
    let mut label = status_label(view, pending.as_deref());
    if let Some(notice) = &notices.latest {
        label = format!("{} | {}", label, notice);
    }
    draw_status(writer, &label, columns, rows)?;
    Ok(())
}

fn overlay_text(view: &ReaderView) -> String {
    let mut lines = Vec::new();
    match &view.bookmark {
        Some(bookmark) => lines.push(format!("Bookmark: {:.0}%", bookmark.percent * 100.0)),
        None => lines.push("Bookmark: none".to_string()),
    }
    lines.push(String::new());
    if view.annotations.is_empty() {
        lines.push("No annotations".to_string());
    }
    for (index, annotation) in view.annotations.iter().enumerate() {
        lines.push(format!(
            "{}. [{}] {}",
            index + 1,
            annotation.color,
            annotation.text
        ));
    }
    lines.join("\n")
}

fn load_config(path: Option<&Path>) -> Result<ReaderConfig> {
    match path.map(Path::to_path_buf).or_else(ReaderConfig::default_path) {
        Some(path) => ReaderConfig::load(&path),
        None => Ok(ReaderConfig::default()),
    }
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "turnpage.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The terminal belongs to the page; logs only go to the file.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

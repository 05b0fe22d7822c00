use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, instrument};
use turnpage_core::{
    ContentFrame, EngineError, EngineEvent, EngineListener, EngineProvider, FrameId, LocationMark,
    Locations, PointerListener, RenderOptions, RenderedLocation, Rendition, Spread, Subscription,
};
use url::Url;

/// Paginates UTF-8 text files. Lines starting with `# ` open a new section.
#[derive(Default)]
pub struct TextEngineProvider {
    next_frame: AtomicU64,
}

impl TextEngineProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EngineProvider for TextEngineProvider {
    #[instrument(skip(self, options))]
    async fn open(
        &self,
        resource: &str,
        options: &RenderOptions,
    ) -> Result<Arc<dyn Rendition>, EngineError> {
        let document =
            load_document(resource).map_err(|err| EngineError::Init(format!("{err:#}")))?;
        let frame_id = self.next_frame.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(sections = document.sections.len(), "opened text document");
        Ok(Arc::new(TextRendition::new(
            Arc::new(document),
            options,
            frame_id,
        )))
    }
}

fn resolve_resource(resource: &str) -> Result<PathBuf> {
    match Url::parse(resource) {
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map_err(|_| anyhow!("invalid file url {}", resource)),
        // Single-letter schemes are Windows drive letters.
        Ok(url) if url.scheme().len() > 1 => {
            bail!("unsupported resource scheme `{}`", url.scheme())
        }
        _ => Ok(PathBuf::from(resource)),
    }
}

fn load_document(resource: &str) -> Result<TextDocument> {
    let path = resolve_resource(resource)?;
    let raw = fs::read_to_string(&path).with_context(|| format!("failed to read {:?}", path))?;
    let title = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Untitled".to_string());
    let document = TextDocument::parse(&raw, &title);
    if document.sections.is_empty() {
        bail!("{:?} contains no text", path);
    }
    Ok(document)
}

/// `text(/{section}!/{offset})`, offset in bytes from the section start.
pub fn format_reference(section: usize, offset: usize) -> String {
    format!("text(/{}!/{})", section, offset)
}

/// Parses a point reference or the start of a range reference
/// (`text(/{section}!/{start},/{end})`).
pub fn parse_reference(reference: &str) -> Option<(usize, usize)> {
    let inner = reference.strip_prefix("text(/")?.strip_suffix(')')?;
    let (section, rest) = inner.split_once("!/")?;
    let offset = rest.split(',').next()?;
    Some((section.parse().ok()?, offset.parse().ok()?))
}

struct Section {
    title: String,
    text: String,
    /// Bytes in all earlier sections.
    base: usize,
}

struct TextDocument {
    sections: Vec<Section>,
    total: usize,
}

impl TextDocument {
    fn parse(raw: &str, fallback_title: &str) -> Self {
        let mut sections = Vec::new();
        let mut title = fallback_title.to_string();
        let mut body = String::new();
        let mut base = 0;

        let mut flush = |title: String, body: &mut String, sections: &mut Vec<Section>| {
            let text = body.trim_matches('\n').to_string();
            body.clear();
            if text.trim().is_empty() {
                return;
            }
            let len = text.len();
            sections.push(Section { title, text, base });
            base += len;
        };

        for line in raw.lines() {
            if let Some(heading) = line.strip_prefix("# ") {
                let previous = std::mem::replace(&mut title, heading.trim().to_string());
                flush(previous, &mut body, &mut sections);
                continue;
            }
            body.push_str(line);
            body.push('\n');
        }
        flush(title, &mut body, &mut sections);

        let total = sections.iter().map(|section| section.text.len()).sum();
        Self { sections, total }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    columns: usize,
    rows: usize,
}

impl Geometry {
    fn from_options(options: &RenderOptions) -> Self {
        let (columns, rows) = match options.spread {
            Spread::None => (options.width as usize, options.height as usize),
            Spread::Both => (
                (options.width.saturating_sub(options.gap) / 2) as usize,
                options.height as usize * 2,
            ),
        };
        Self {
            columns: columns.max(8),
            rows: rows.max(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Page {
    section: usize,
    start: usize,
    end: usize,
    lines: Vec<String>,
}

fn paginate(document: &TextDocument, geometry: Geometry) -> Vec<Page> {
    let mut pages = Vec::new();
    for (index, section) in document.sections.iter().enumerate() {
        let mut lines: Vec<(usize, String)> = Vec::new();
        let mut offset = 0;
        for raw_line in section.text.split('\n') {
            if raw_line.trim().is_empty() {
                lines.push((offset, String::new()));
            } else {
                let mut cursor = 0;
                for wrapped in textwrap::wrap(raw_line, geometry.columns) {
                    let found = raw_line[cursor..]
                        .find(wrapped.as_ref())
                        .map(|position| cursor + position)
                        .unwrap_or(cursor);
                    cursor = (found + wrapped.len()).min(raw_line.len());
                    lines.push((offset + found, wrapped.into_owned()));
                }
            }
            offset += raw_line.len() + 1;
        }

        let first = pages.len();
        for chunk in lines.chunks(geometry.rows) {
            pages.push(Page {
                section: index,
                start: chunk[0].0,
                end: section.text.len(),
                lines: chunk.iter().map(|(_, line)| line.clone()).collect(),
            });
        }
        for page in first..pages.len().saturating_sub(1) {
            pages[page].end = pages[page + 1].start;
        }
    }
    pages
}

struct ViewState {
    geometry: Geometry,
    pages: Vec<Page>,
    current: usize,
}

impl ViewState {
    fn page(&self) -> Option<&Page> {
        self.pages.get(self.current)
    }

    fn page_for(&self, section: usize, offset: usize) -> Option<usize> {
        let in_section = |page: &Page| page.section == section;
        self.pages
            .iter()
            .rposition(|page| in_section(page) && page.start <= offset)
            .or_else(|| self.pages.iter().position(in_section))
    }
}

type Registry<T> = Arc<Mutex<Vec<(u64, T)>>>;

fn register<T: Send + 'static>(registry: &Registry<T>, next: &AtomicU64, item: T) -> Subscription {
    let id = next.fetch_add(1, Ordering::SeqCst);
    registry.lock().push((id, item));
    let registry = Arc::clone(registry);
    Subscription::new(move || registry.lock().retain(|(entry, _)| *entry != id))
}

fn snapshot<T: Clone>(registry: &Registry<T>) -> Vec<T> {
    registry.lock().iter().map(|(_, item)| item.clone()).collect()
}

struct TextFrame {
    id: FrameId,
    state: Arc<Mutex<ViewState>>,
    pointers: Registry<PointerListener>,
    next_pointer: AtomicU64,
}

impl ContentFrame for TextFrame {
    fn id(&self) -> FrameId {
        self.id
    }

    fn visible_text(&self) -> String {
        let state = self.state.lock();
        state
            .page()
            .map(|page| page.lines.join("\n"))
            .unwrap_or_default()
    }

    fn watch_pointer(&self, listener: PointerListener) -> Subscription {
        register(&self.pointers, &self.next_pointer, listener)
    }
}

struct TextLocations {
    document: Arc<TextDocument>,
    points: Mutex<Vec<(usize, usize)>>,
}

#[async_trait]
impl Locations for TextLocations {
    async fn generate(&self, chunk_size: usize) -> Result<usize, EngineError> {
        if chunk_size == 0 {
            return Err(EngineError::Locations("chunk size must be positive".into()));
        }
        let mut points = Vec::new();
        for (index, section) in self.document.sections.iter().enumerate() {
            points.extend(
                section
                    .text
                    .char_indices()
                    .step_by(chunk_size)
                    .map(|(offset, _)| (index, offset)),
            );
        }
        let total = points.len();
        *self.points.lock() = points;
        Ok(total)
    }

    fn load(&self, serialized: &str) -> Result<usize, EngineError> {
        let refs: Vec<String> = serde_json::from_str(serialized)
            .map_err(|err| EngineError::Locations(err.to_string()))?;
        let points = refs
            .iter()
            .map(|reference| {
                parse_reference(reference)
                    .filter(|(section, _)| *section < self.document.sections.len())
                    .ok_or_else(|| EngineError::InvalidReference(reference.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let total = points.len();
        *self.points.lock() = points;
        Ok(total)
    }

    fn save(&self) -> String {
        let refs: Vec<String> = self
            .points
            .lock()
            .iter()
            .map(|(section, offset)| format_reference(*section, *offset))
            .collect();
        serde_json::to_string(&refs).unwrap_or_default()
    }

    fn ref_from_location(&self, location: usize) -> Option<String> {
        self.points
            .lock()
            .get(location)
            .map(|(section, offset)| format_reference(*section, *offset))
    }

    fn location_from_ref(&self, reference: &str) -> Option<usize> {
        let target = parse_reference(reference)?;
        let points = self.points.lock();
        points.partition_point(|point| *point <= target).checked_sub(1)
    }

    fn total(&self) -> usize {
        self.points.lock().len()
    }
}

pub struct TextRendition {
    document: Arc<TextDocument>,
    state: Arc<Mutex<ViewState>>,
    frame: Arc<TextFrame>,
    locations: Arc<TextLocations>,
    listeners: Registry<EngineListener>,
    next_listener: AtomicU64,
    destroyed: AtomicBool,
}

impl TextRendition {
    fn new(document: Arc<TextDocument>, options: &RenderOptions, frame_id: FrameId) -> Self {
        let geometry = Geometry::from_options(options);
        let state = Arc::new(Mutex::new(ViewState {
            geometry,
            pages: paginate(&document, geometry),
            current: 0,
        }));
        Self {
            frame: Arc::new(TextFrame {
                id: frame_id,
                state: Arc::clone(&state),
                pointers: Arc::new(Mutex::new(Vec::new())),
                next_pointer: AtomicU64::new(0),
            }),
            locations: Arc::new(TextLocations {
                document: Arc::clone(&document),
                points: Mutex::new(Vec::new()),
            }),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            document,
            state,
        }
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(EngineError::Other("rendition destroyed".into()));
        }
        Ok(())
    }

    fn location_of(&self, page: &Page) -> RenderedLocation {
        let mark = |offset: usize| {
            let reference = format_reference(page.section, offset);
            let base = self.document.sections[page.section].base;
            LocationMark {
                percentage: if self.document.total == 0 {
                    0.0
                } else {
                    (base + offset) as f32 / self.document.total as f32
                },
                location: self.locations.location_from_ref(&reference),
                reference,
            }
        };
        RenderedLocation {
            start: mark(page.start),
            end: Some(mark(page.end)),
        }
    }

    fn show(&self, index: usize) {
        let location = {
            let mut state = self.state.lock();
            state.current = index;
            state.page().map(|page| self.location_of(page))
        };
        self.emit(EngineEvent::Rendered {
            frame: self.frame.id,
        });
        if let Some(location) = location {
            self.emit(EngineEvent::Relocated(location));
        }
    }

    fn emit(&self, event: EngineEvent) {
        for listener in snapshot(&self.listeners) {
            listener(event.clone());
        }
    }
}

#[async_trait]
impl Rendition for TextRendition {
    async fn next(&self) -> Result<(), EngineError> {
        self.ensure_live()?;
        let target = {
            let state = self.state.lock();
            if state.current + 1 >= state.pages.len() {
                return Err(EngineError::Boundary("end"));
            }
            state.current + 1
        };
        self.show(target);
        Ok(())
    }

    async fn prev(&self) -> Result<(), EngineError> {
        self.ensure_live()?;
        let target = {
            let state = self.state.lock();
            if state.current == 0 {
                return Err(EngineError::Boundary("start"));
            }
            state.current - 1
        };
        self.show(target);
        Ok(())
    }

    async fn display(&self, target: Option<&str>) -> Result<(), EngineError> {
        self.ensure_live()?;
        let index = match target {
            None => 0,
            Some(reference) => {
                let (section, offset) = parse_reference(reference)
                    .ok_or_else(|| EngineError::InvalidReference(reference.to_string()))?;
                self.state
                    .lock()
                    .page_for(section, offset)
                    .ok_or_else(|| EngineError::InvalidReference(reference.to_string()))?
            }
        };
        self.show(index);
        Ok(())
    }

    fn current_location(&self) -> Option<RenderedLocation> {
        let state = self.state.lock();
        state.page().map(|page| self.location_of(page))
    }

    fn contents(&self) -> Vec<Arc<dyn ContentFrame>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        vec![Arc::clone(&self.frame) as Arc<dyn ContentFrame>]
    }

    fn chapter_label(&self, reference: &str) -> Option<String> {
        let (section, _) = parse_reference(reference)?;
        self.document
            .sections
            .get(section)
            .map(|section| section.title.clone())
    }

    fn locations(&self) -> Arc<dyn Locations> {
        Arc::clone(&self.locations) as Arc<dyn Locations>
    }

    fn resize(&self, options: &RenderOptions) {
        let geometry = Geometry::from_options(options);
        let index = {
            let mut state = self.state.lock();
            if state.geometry == geometry {
                return;
            }
            let anchor = state.page().map(|page| (page.section, page.start));
            state.geometry = geometry;
            state.pages = paginate(&self.document, geometry);
            anchor
                .and_then(|(section, offset)| state.page_for(section, offset))
                .unwrap_or(0)
        };
        debug!(columns = geometry.columns, rows = geometry.rows, "relaid out text");
        self.show(index);
    }

    fn on(&self, listener: EngineListener) -> Subscription {
        register(&self.listeners, &self.next_listener, listener)
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.listeners.lock().clear();
        self.frame.pointers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    use tempfile::NamedTempFile;
    use turnpage_core::{Pagination, PointerEvent};

    fn sample() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# Loomings").unwrap();
        for n in 0..12 {
            writeln!(file, "Loomings paragraph {n} has a handful of words in it.").unwrap();
        }
        writeln!(file, "# The Carpet-Bag").unwrap();
        for n in 0..12 {
            writeln!(file, "Carpet-bag paragraph {n} also has a handful of words.").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn options(width: u32, height: u32) -> RenderOptions {
        RenderOptions {
            width,
            height,
            pagination: Pagination::Paginated,
            spread: Spread::None,
            gap: 2,
        }
    }

    async fn open(file: &NamedTempFile, width: u32, height: u32) -> Arc<dyn Rendition> {
        TextEngineProvider::new()
            .open(file.path().to_str().unwrap(), &options(width, height))
            .await
            .unwrap()
    }

    #[test]
    fn references_parse_points_and_ranges() {
        assert_eq!(parse_reference("text(/2!/480)"), Some((2, 480)));
        assert_eq!(parse_reference("text(/1!/40,/96)"), Some((1, 40)));
        assert_eq!(parse_reference("epubcfi(/6/4)"), None);
        assert_eq!(format_reference(3, 12), "text(/3!/12)");
    }

    #[test]
    fn headings_split_sections() {
        let document = TextDocument::parse("preface\n# One\nalpha\n\n# Two\nbeta\n", "book");
        let titles: Vec<_> = document.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["book", "One", "Two"]);
        assert_eq!(document.sections[2].base, "preface".len() + "alpha".len());
    }

    #[tokio::test]
    async fn opens_at_the_first_page_of_the_first_section() {
        let file = sample();
        let rendition = open(&file, 40, 5).await;
        rendition.display(None).await.unwrap();

        let location = rendition.current_location().unwrap();
        assert_eq!(location.start.reference, "text(/0!/0)");
        assert_eq!(
            rendition.chapter_label(&location.start.reference).as_deref(),
            Some("Loomings")
        );
        let text = rendition.contents()[0].visible_text();
        assert!(text.starts_with("Loomings paragraph 0"));
        assert!(text.lines().count() <= 5);
    }

    #[tokio::test]
    async fn stepping_past_either_end_is_rejected() {
        let file = sample();
        let rendition = open(&file, 80, 20).await;
        rendition.display(None).await.unwrap();

        assert_eq!(rendition.prev().await, Err(EngineError::Boundary("start")));
        let mut turns = 0;
        while rendition.next().await.is_ok() {
            turns += 1;
        }
        assert!(turns >= 1);
        assert_eq!(rendition.next().await, Err(EngineError::Boundary("end")));
        let last = rendition.current_location().unwrap();
        assert!(last.start.reference.starts_with("text(/1!/"));
    }

    #[tokio::test]
    async fn display_lands_on_the_page_holding_the_offset() {
        let file = sample();
        let rendition = open(&file, 40, 4).await;
        rendition.display(Some("text(/1!/200)")).await.unwrap();

        let location = rendition.current_location().unwrap();
        let (section, start) = parse_reference(&location.start.reference).unwrap();
        let (_, end) = parse_reference(&location.end.unwrap().reference).unwrap();
        assert_eq!(section, 1);
        assert!(start <= 200 && 200 < end);
        assert_eq!(
            rendition.display(Some("text(/9!/0)")).await,
            Err(EngineError::InvalidReference("text(/9!/0)".into()))
        );
    }

    #[tokio::test]
    async fn saved_locations_reload_identically() {
        let file = sample();
        let first = open(&file, 40, 4).await;
        let total = first.locations().generate(64).await.unwrap();
        assert!(total > 2);
        let saved = first.locations().save();

        let second = open(&file, 80, 10).await;
        assert_eq!(second.locations().load(&saved).unwrap(), total);
        for n in [0, 1, total / 2, total - 1] {
            assert_eq!(
                second.locations().ref_from_location(n),
                first.locations().ref_from_location(n)
            );
        }
        let reference = first.locations().ref_from_location(2).unwrap();
        assert_eq!(second.locations().location_from_ref(&reference), Some(2));
    }

    #[tokio::test]
    async fn relocations_report_index_positions_once_generated() {
        let file = sample();
        let rendition = open(&file, 40, 4).await;
        rendition.display(None).await.unwrap();
        assert_eq!(rendition.current_location().unwrap().start.location, None);

        rendition.locations().generate(32).await.unwrap();
        rendition.next().await.unwrap();
        let location = rendition.current_location().unwrap();
        assert!(location.start.location.is_some());
        assert!(location.start.percentage > 0.0);
    }

    #[tokio::test]
    async fn listeners_stop_after_the_subscription_drops() {
        let file = sample();
        let rendition = open(&file, 40, 4).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let subscription = rendition.on(Arc::new(move |event: EngineEvent| {
            if matches!(event, EngineEvent::Relocated(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        rendition.display(None).await.unwrap();
        rendition.next().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        drop(subscription);
        rendition.prev().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resize_keeps_the_reading_position() {
        let file = sample();
        let rendition = open(&file, 40, 4).await;
        rendition.display(Some("text(/1!/300)")).await.unwrap();

        rendition.resize(&options(100, 30));
        let location = rendition.current_location().unwrap();
        let (section, start) = parse_reference(&location.start.reference).unwrap();
        assert_eq!(section, 1);
        assert!(start <= 300);
    }

    #[tokio::test]
    async fn destroyed_rendition_refuses_work() {
        let file = sample();
        let provider = TextEngineProvider::new();
        let rendition = provider
            .open(file.path().to_str().unwrap(), &options(40, 4))
            .await
            .unwrap();
        let frame = rendition.contents().remove(0);
        let _pointer = frame.watch_pointer(Arc::new(|_event: PointerEvent| {}));

        rendition.destroy();
        assert!(rendition.contents().is_empty());
        assert!(rendition.next().await.is_err());
    }

    #[tokio::test]
    async fn file_urls_and_missing_files() {
        let file = sample();
        let url = Url::from_file_path(file.path()).unwrap();
        let provider = TextEngineProvider::new();
        assert!(provider.open(url.as_str(), &options(40, 4)).await.is_ok());

        let missing = provider
            .open("/definitely/not/here.txt", &options(40, 4))
            .await;
        assert!(matches!(missing, Err(EngineError::Init(_))));

        let remote = provider
            .open("https://example.com/book.txt", &options(40, 4))
            .await;
        assert!(matches!(remote, Err(EngineError::Init(_))));
    }
}

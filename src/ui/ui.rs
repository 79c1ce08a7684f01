use std::path::PathBuf;

use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
};
use ratatui_image::{Resize, StatefulImage, picker::Picker, protocol::StatefulProtocol};

use crate::backend::cache::{CacheStats, PageImage};
use crate::backend::page_loader::Page;
use crate::backend::source::SourceKind;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    #[default]
    Loading,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterLocation {
    Local(PathBuf),
    Remote { source: SourceKind, chapter_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterEntry {
    pub label: String,
    pub location: ChapterLocation,
}

impl ChapterEntry {
    /// Key under which reading progress is saved.
    pub fn progress_key(&self) -> String {
        match &self.location {
            ChapterLocation::Local(path) => path.to_string_lossy().into_owned(),
            ChapterLocation::Remote { source, chapter_id } => format!("{}:{}", source, chapter_id),
        }
    }
}

pub struct App {
    pub state: AppState,
    pub loading_message: String,
    pub title: String,
    pub chapters: Vec<ChapterEntry>,
    pub current_chapter: usize,
    pub pages: Vec<Page>,
    pub current_page: usize,
    pub picker: Option<Picker>,
    pub page_state: Option<StatefulProtocol>,
    /// Last error shown in place of the page
    pub message: Option<String>,
    pub stats: CacheStats,
}

impl App {
    pub fn new(title: &str) -> Self {
        Self::with_picker(title, Picker::from_query_stdio().ok())
    }

    pub fn with_picker(title: &str, picker: Option<Picker>) -> Self {
        Self {
            state: AppState::Loading,
            loading_message: "Initializing...".to_string(),
            title: title.to_string(),
            chapters: Vec::new(),
            current_chapter: 0,
            pages: Vec::new(),
            current_page: 0,
            picker,
            page_state: None,
            message: None,
            stats: CacheStats::default(),
        }
    }

    pub fn set_loading(&mut self, message: &str) {
        self.state = AppState::Loading;
        self.loading_message = message.to_string();
    }

    pub fn set_ready(&mut self) {
        self.state = AppState::Ready;
    }

    pub fn chapter(&self) -> Option<&ChapterEntry> {
        self.chapters.get(self.current_chapter)
    }

    pub fn page(&self) -> Option<&Page> {
        self.pages.get(self.current_page)
    }

    /// Shows `pages` starting at `start`, clamped to the last page.
    pub fn open_chapter(&mut self, pages: Vec<Page>, start: usize) {
        self.current_page = start.min(pages.len().saturating_sub(1));
        self.pages = pages;
        self.page_state = None;
        self.message = None;
    }

    pub fn next_page(&mut self) -> bool {
        if self.current_page + 1 < self.pages.len() {
            self.current_page += 1;
            self.page_state = None;
            true
        } else {
            false
        }
    }

    pub fn prev_page(&mut self) -> bool {
        if self.current_page > 0 {
            self.current_page -= 1;
            self.page_state = None;
            true
        } else {
            false
        }
    }

    pub fn next_chapter(&mut self) -> bool {
        if self.current_chapter + 1 < self.chapters.len() {
            self.current_chapter += 1;
            self.pages.clear();
            true
        } else {
            false
        }
    }

    pub fn prev_chapter(&mut self) -> bool {
        if self.current_chapter > 0 {
            self.current_chapter -= 1;
            self.pages.clear();
            true
        } else {
            false
        }
    }

    /// Displays a loaded page. Returns false for a page the reader has
    /// already moved away from.
    pub fn set_page_image(&mut self, page: &Page, image: &PageImage) -> bool {
        if self.page() != Some(page) {
            return false;
        }
        self.message = None;
        if let Some(ref picker) = self.picker {
            self.page_state = Some(picker.new_resize_protocol(image.as_ref().clone()));
        }
        true
    }

    pub fn set_message(&mut self, message: String) {
        self.message = Some(message);
    }
}

pub fn ui(f: &mut Frame, app: &mut App) {
    match app.state {
        AppState::Loading => draw_loading_screen(f, app),
        AppState::Ready => draw_reader(f, app),
    }
}

fn draw_loading_screen(f: &mut Frame, app: &App) {
    let area = f.area();

    let block = Block::default()
        .borders(Borders::ALL)
        .title("Manga Pager")
        .border_style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    let center_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(40),
            Constraint::Length(3),
            Constraint::Length(2),
            Constraint::Percentage(40),
        ])
        .split(inner);

    let spinner_frames = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
    let frame_idx = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        / 100) as usize
        % spinner_frames.len();

    let loading_text = Line::from(vec![
        Span::styled(
            format!(" {} ", spinner_frames[frame_idx]),
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            "Loading...",
            Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        ),
    ]);

    let loading_paragraph = Paragraph::new(loading_text).alignment(Alignment::Center);
    f.render_widget(loading_paragraph, center_layout[1]);

    let message = Paragraph::new(&*app.loading_message)
        .style(Style::default().fg(Color::DarkGray))
        .alignment(Alignment::Center);
    f.render_widget(message, center_layout[2]);
}

fn draw_reader(f: &mut Frame, app: &mut App) {
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // title and chapter
            Constraint::Min(5),    // page
            Constraint::Length(4), // position, cache stats and keys
        ])
        .split(f.area());

    draw_header(f, root[0], app);
    draw_page(f, root[1], app);
    draw_footer(f, root[2], app);
}

fn draw_header(f: &mut Frame, area: Rect, app: &App) {
    let chapter = app
        .chapter()
        .map(|c| c.label.as_str())
        .unwrap_or("No chapter");

    let line = Line::from(vec![
        Span::styled(
            &app.title,
            Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled("  ·  ", Style::default().fg(Color::DarkGray)),
        Span::styled(chapter, Style::default().fg(Color::Cyan)),
    ]);

    let header = Paragraph::new(line).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Manga Pager")
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(header, area);
}

fn draw_page(f: &mut Frame, area: Rect, app: &mut App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));
    let inner = block.inner(area);
    f.render_widget(block, area);

    if let Some(state) = app.page_state.as_mut() {
        let image_widget = StatefulImage::new().resize(Resize::Scale(None));
        f.render_stateful_widget(image_widget, inner, state);
        return;
    }

    let (text, color) = match (&app.message, app.pages.is_empty(), app.picker.is_some()) {
        (Some(message), _, _) => (message.as_str(), Color::Red),
        (None, true, _) => ("This chapter has no pages", Color::DarkGray),
        (None, false, false) => ("Terminal does not support images", Color::DarkGray),
        (None, false, true) => ("Loading page...", Color::DarkGray),
    };

    let placeholder = Paragraph::new(vec![
        Line::from(""),
        Line::from(Span::styled(text, Style::default().fg(color))),
    ])
    .alignment(Alignment::Center);
    f.render_widget(placeholder, inner);
}

fn draw_footer(f: &mut Frame, area: Rect, app: &App) {
    let position = if app.pages.is_empty() {
        "-/-".to_string()
    } else {
        format!("{}/{}", app.current_page + 1, app.pages.len())
    };

    let stats = &app.stats;
    let status = Line::from(vec![
        Span::styled(
            format!("Page {}", position),
            Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw("  "),
        Span::styled(cache_summary(stats), Style::default().fg(Color::DarkGray)),
    ]);

    let keys = Line::from(vec![
        Span::styled("←/→", Style::default().fg(Color::Yellow)),
        Span::raw(": page  "),
        Span::styled("n/p", Style::default().fg(Color::Yellow)),
        Span::raw(": chapter  "),
        Span::styled("x", Style::default().fg(Color::Yellow)),
        Span::raw(": clear memory cache  "),
        Span::styled("q", Style::default().fg(Color::Yellow)),
        Span::raw(": quit"),
    ]);

    let p = Paragraph::new(vec![status, keys])
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .alignment(Alignment::Center);
    f.render_widget(p, area);
}

fn cache_summary(stats: &CacheStats) -> String {
    format!(
        "mem {} ({}/{})  disk {}/{}  hits {:.0}%",
        stats.memory_items,
        format_bytes(stats.memory_bytes),
        format_bytes(stats.memory_budget),
        format_bytes(stats.disk_bytes),
        format_bytes(stats.disk_budget),
        stats.hit_rate() * 100.0
    )
}

fn format_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    let bytes = bytes as f64;
    if bytes >= MIB {
        format!("{:.1}M", bytes / MIB)
    } else if bytes >= KIB {
        format!("{:.0}K", bytes / KIB)
    } else {
        format!("{}B", bytes)
    }
}

use manga_pager::backend::cache::{ImageCache, PageImage};
use manga_pager::backend::filesystem;
use manga_pager::backend::library::Library;
use manga_pager::backend::mangadex::MangaDexSource;
use manga_pager::backend::page_loader::{Page, PageLoader};
use manga_pager::backend::progress::ProgressStore;
use manga_pager::backend::source::{SourceKind, Sources};
use manga_pager::config::Config;
use manga_pager::ui::ui::{App, ChapterEntry, ChapterLocation, ui};

use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures::StreamExt;
use log::{info, warn};
use ratatui::{Terminal, backend::CrosstermBackend};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{error::Error, io};
use tokio::sync::{Mutex, mpsc};

const USAGE: &str = "usage: manga-pager <manga-dir> | --mangadex <manga-id> [--lang <code>] [--chapter <n>] [--config <file>]";

enum BackgroundTask {
    ChaptersLoaded { title: String, chapters: Vec<ChapterEntry> },
    PagesLoaded { chapter: usize, pages: Vec<Page> },
    PageLoaded { page: Page, image: PageImage },
    Failed { message: String },
}

enum Target {
    Local(PathBuf),
    MangaDex(String),
}

struct Args {
    target: Target,
    language: String,
    /// 1-based chapter position to open first
    chapter: Option<usize>,
    config: Option<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut target = None;
    let mut language = "en".to_string();
    let mut chapter = None;
    let mut config = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mangadex" => target = Some(Target::MangaDex(args.next().ok_or(USAGE)?)),
            "--lang" => language = args.next().ok_or(USAGE)?,
            "--chapter" => {
                let value = args.next().ok_or(USAGE)?;
                let n = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid chapter position: {value}"))?;
                chapter = Some(n.max(1));
            }
            "--config" => config = Some(PathBuf::from(args.next().ok_or(USAGE)?)),
            "-h" | "--help" => return Err(USAGE.to_string()),
            other if other.starts_with("--") => return Err(format!("unknown option {other}\n{USAGE}")),
            path => target = Some(Target::Local(PathBuf::from(path))),
        }
    }

    Ok(Args {
        target: target.ok_or(USAGE)?,
        language,
        chapter,
        config,
    })
}

/// The terminal belongs to the UI, so logs go to a file next to the cache.
fn init_logging(config: &Config) {
    let cache_dir = &config.cache.cache_dir;
    let log_dir = cache_dir.parent().unwrap_or(cache_dir);
    let file = fs::create_dir_all(log_dir).and_then(|()| File::create(log_dir.join("manga-pager.log")));

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    match file {
        Ok(file) => {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        Err(_) => {
            // without a log file, stay quiet rather than draw over the UI
            builder.filter_level(log::LevelFilter::Off);
        }
    }
    builder.init();
}

/// Everything the event loop needs besides the UI state.
struct Reader {
    loader: PageLoader,
    library: Arc<Mutex<Library>>,
    progress: ProgressStore,
    radius: usize,
    language: String,
    tx: mpsc::UnboundedSender<BackgroundTask>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args(std::env::args().skip(1))?;
    let config = Config::load(args.config.as_deref())?;
    init_logging(&config);
    info!("Starting manga-pager with cache at {}", config.cache.cache_dir.display());

    let cache = ImageCache::open(&config.cache)?;
    let sources = Sources::new().with(MangaDexSource::new(&config.source));
    let loader = PageLoader::new(cache, sources);

    let (task_tx, mut task_rx) = mpsc::unbounded_channel::<BackgroundTask>();
    let mut reader = Reader {
        loader,
        library: Arc::new(Mutex::new(Library::open(&Library::default_path()))),
        progress: ProgressStore::open(&ProgressStore::default_path()),
        radius: config.prefetch.radius,
        language: args.language.clone(),
        tx: task_tx,
    };

    let title = match &args.target {
        Target::Local(dir) => dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string()),
        Target::MangaDex(id) => id.clone(),
    };

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(&title);

    match &args.target {
        Target::Local(dir) => {
            app.set_loading("Scanning chapters...");
            let chapters = local_chapters(dir);
            let _ = reader.tx.send(BackgroundTask::ChaptersLoaded { title, chapters });
        }
        Target::MangaDex(id) => {
            app.set_loading("Fetching chapters from MangaDex...");
            spawn_chapters_loader(id.clone(), &reader);
        }
    }

    let res = run_app(&mut terminal, &mut app, &mut reader, &mut task_rx, args.chapter).await;

    reader.loader.close();

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        eprintln!("{err}");
    }
    Ok(())
}

/// Chapter directories of `dir`, or `dir` itself when it directly holds pages.
fn local_chapters(dir: &Path) -> Vec<ChapterEntry> {
    let names = filesystem::list_chapters(dir).unwrap_or_else(|e| {
        warn!("Failed to list chapters in {}: {}", dir.display(), e);
        Vec::new()
    });

    if names.is_empty() {
        return vec![ChapterEntry {
            label: dir.display().to_string(),
            location: ChapterLocation::Local(dir.to_path_buf()),
        }];
    }

    names
        .into_iter()
        .map(|name| ChapterEntry {
            location: ChapterLocation::Local(dir.join(&name)),
            label: name,
        })
        .collect()
}

fn spawn_chapters_loader(manga_id: String, reader: &Reader) {
    let sources = reader.loader.sources().clone();
    let library = reader.library.clone();
    let language = reader.language.clone();
    let tx = reader.tx.clone();

    tokio::spawn(async move {
        let task = async {
            let source = sources.get(SourceKind::MangaDex)?;
            let mut library = library.lock().await;
            let manga = library.fetch_and_store_manga(&*source, &manga_id).await?;
            let chapters = library
                .fetch_and_store_chapters(&*source, &manga_id, &language)
                .await?;
            Ok::<_, manga_pager::Error>((manga.title, chapters))
        };

        let message = match task.await {
            Ok((title, chapters)) => {
                let chapters = chapters
                    .into_iter()
                    .map(|c| ChapterEntry {
                        label: match &c.title {
                            Some(title) => format!("Chapter {}: {}", c.number, title),
                            None => format!("Chapter {}", c.number),
                        },
                        location: ChapterLocation::Remote {
                            source: SourceKind::MangaDex,
                            chapter_id: c.id,
                        },
                    })
                    .collect();
                BackgroundTask::ChaptersLoaded { title, chapters }
            }
            Err(e) => BackgroundTask::Failed {
                message: format!("Could not load chapters: {e}"),
            },
        };
        let _ = tx.send(message);
    });
}

fn spawn_pages_loader(chapter: usize, entry: ChapterEntry, reader: &Reader) {
    let sources = reader.loader.sources().clone();
    let library = reader.library.clone();
    let tx = reader.tx.clone();

    tokio::spawn(async move {
        let pages = match entry.location {
            ChapterLocation::Local(dir) => {
                tokio::task::spawn_blocking(move || filesystem::local_pages(&dir))
                    .await
                    .map_err(manga_pager::Error::from)
                    .and_then(|pages| pages)
            }
            ChapterLocation::Remote { source, chapter_id } => {
                let pages = async {
                    let remote = sources.get(source)?;
                    let infos = library
                        .lock()
                        .await
                        .fetch_and_store_pages(&*remote, &chapter_id)
                        .await?;
                    Ok::<_, manga_pager::Error>(
                        infos
                            .into_iter()
                            .map(|info| Page::remote(&chapter_id, source, info))
                            .collect::<Vec<_>>(),
                    )
                };
                pages.await
            }
        };

        let message = match pages {
            Ok(pages) => BackgroundTask::PagesLoaded { chapter, pages },
            Err(e) => BackgroundTask::Failed {
                message: format!("Could not load {}: {e}", entry.label),
            },
        };
        let _ = tx.send(message);
    });
}

fn spawn_page_loader(page: Page, reader: &Reader) {
    let loader = reader.loader.clone();
    let tx = reader.tx.clone();

    tokio::spawn(async move {
        let message = match loader.load(&page).await {
            Ok(image) => BackgroundTask::PageLoaded { page, image },
            Err(e) => BackgroundTask::Failed {
                message: format!("Could not load page {}: {e}", page.index + 1),
            },
        };
        let _ = tx.send(message);
    });
}

/// Loads the page under the cursor, records progress and moves the
/// prefetch window.
fn show_current_page(app: &mut App, reader: &mut Reader) {
    let Some(page) = app.page().cloned() else {
        return;
    };

    if let Some(snapshot) = app
        .chapter()
        .and_then(|chapter| reader.progress.record(&chapter.progress_key(), page.index))
    {
        tokio::task::spawn_blocking(move || {
            if let Err(e) = snapshot.write() {
                warn!("Failed to save reading progress: {}", e);
            }
        });
    }

    reader.loader.prefetch(&app.pages, app.current_page, reader.radius);
    spawn_page_loader(page, reader);
}

fn open_current_chapter(app: &mut App, reader: &Reader) {
    reader.loader.cancel_all_prefetch();
    if let Some(entry) = app.chapter().cloned() {
        app.set_loading(&format!("Loading {}...", entry.label));
        spawn_pages_loader(app.current_chapter, entry, reader);
    }
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    reader: &mut Reader,
    task_rx: &mut mpsc::UnboundedReceiver<BackgroundTask>,
    start_chapter: Option<usize>,
) -> io::Result<()> {
    let mut event_stream = EventStream::new();

    loop {
        app.stats = reader.loader.cache().stats();
        terminal.draw(|f| ui(f, app))?;

        tokio::select! {
            // Redraw for the spinner and live cache stats
            _ = tokio::time::sleep(tokio::time::Duration::from_millis(250)) => {}

            Some(Ok(event)) = event_stream.next() => {
                if let Event::Key(key) = event {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    match key.code {
                        KeyCode::Char('q') => return Ok(()),
                        KeyCode::Right => {
                            if app.next_page() {
                                show_current_page(app, reader);
                            }
                        }
                        KeyCode::Left => {
                            if app.prev_page() {
                                show_current_page(app, reader);
                            }
                        }
                        KeyCode::Char('n') => {
                            if app.next_chapter() {
                                open_current_chapter(app, reader);
                            }
                        }
                        KeyCode::Char('p') => {
                            if app.prev_chapter() {
                                open_current_chapter(app, reader);
                            }
                        }
                        KeyCode::Char('x') => {
                            reader.loader.cache().clear_memory();
                            info!("Cleared memory cache");
                        }
                        _ => {}
                    }
                }
            }

            Some(task) = task_rx.recv() => {
                match task {
                    BackgroundTask::ChaptersLoaded { title, chapters } => {
                        app.title = title;
                        app.chapters = chapters;
                        if app.chapters.is_empty() {
                            app.set_ready();
                            app.set_message("No chapters available".to_string());
                        } else {
                            let last = app.chapters.len() - 1;
                            app.current_chapter =
                                start_chapter.map_or(0, |n| n.saturating_sub(1)).min(last);
                            open_current_chapter(app, reader);
                        }
                    }
                    BackgroundTask::PagesLoaded { chapter, pages } => {
                        // ignore listings for a chapter the reader already left
                        if chapter == app.current_chapter {
                            let start = app
                                .chapter()
                                .map(|c| reader.progress.load_clamped(&c.progress_key(), pages.len()))
                                .unwrap_or(0);
                            app.open_chapter(pages, start);
                            app.set_ready();
                            show_current_page(app, reader);
                        }
                    }
                    BackgroundTask::PageLoaded { page, image } => {
                        app.set_page_image(&page, &image);
                    }
                    BackgroundTask::Failed { message } => {
                        warn!("{}", message);
                        app.set_ready();
                        app.set_message(message);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, String> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_local_dir() {
        let args = parse(&["/manga/yotsuba"]).unwrap();
        assert!(matches!(args.target, Target::Local(ref p) if p == Path::new("/manga/yotsuba")));
        assert_eq!(args.language, "en");
        assert_eq!(args.chapter, None);
    }

    #[test]
    fn test_parse_mangadex_options() {
        let args = parse(&["--mangadex", "abc", "--lang", "fr", "--chapter", "3"]).unwrap();
        assert!(matches!(args.target, Target::MangaDex(ref id) if id == "abc"));
        assert_eq!(args.language, "fr");
        assert_eq!(args.chapter, Some(3));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--mangadex"]).is_err());
        assert!(parse(&["--chapter", "x", "dir"]).is_err());
        assert!(parse(&["--verbose", "dir"]).is_err());
    }

    #[test]
    fn test_local_chapters_fall_back_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let chapters = local_chapters(dir.path());
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].location, ChapterLocation::Local(dir.path().to_path_buf()));

        fs::create_dir(dir.path().join("Ch 2")).unwrap();
        fs::create_dir(dir.path().join("Ch 10")).unwrap();
        let labels: Vec<String> = local_chapters(dir.path()).into_iter().map(|c| c.label).collect();
        assert_eq!(labels, vec!["Ch 2", "Ch 10"]);
    }
}

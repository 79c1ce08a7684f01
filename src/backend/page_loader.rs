//! Page loading and background prefetch.
//!
//! [`PageLoader::load`] is the foreground path for a page turn. It checks the
//! cache, then fetches, decodes and stores the page. [`PageLoader::prefetch`]
//! runs the same path in spawned tasks for the pages around the reader's
//! position, cancelling tasks that fall out of that window.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::task;
use tokio_util::sync::CancellationToken;

use super::cache::{ImageCache, PageImage};
use super::lock;
use super::source::{MangaSource, PageInfo, SourceKind, Sources};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageLocation {
    Local(PathBuf),
    Remote { source: SourceKind, url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub chapter_id: String,
    /// 0-based position within the chapter
    pub index: usize,
    pub location: PageLocation,
}

impl Page {
    pub fn local(chapter_id: &str, index: usize, path: PathBuf) -> Self {
        Self {
            chapter_id: chapter_id.to_string(),
            index,
            location: PageLocation::Local(path),
        }
    }

    pub fn remote(chapter_id: &str, source: SourceKind, info: PageInfo) -> Self {
        Self {
            chapter_id: chapter_id.to_string(),
            index: info.index,
            location: PageLocation::Remote {
                source,
                url: info.url,
            },
        }
    }

    /// Cache identifier: the file path or the download URL.
    pub fn identifier(&self) -> String {
        match &self.location {
            PageLocation::Local(path) => path.to_string_lossy().into_owned(),
            PageLocation::Remote { url, .. } => url.clone(),
        }
    }
}

type TaskKey = (String, usize);

struct PrefetchTask {
    token: CancellationToken,
    /// Distinguishes a task from a later one started for the same page.
    generation: u64,
    /// Running for the page being read: still tracked so no second task
    /// starts for it, but not reported as pending.
    detached: bool,
}

#[derive(Default)]
struct TaskRegistry {
    tasks: HashMap<TaskKey, PrefetchTask>,
    next_generation: u64,
}

#[derive(Clone)]
pub struct PageLoader {
    cache: ImageCache,
    sources: Sources,
    registry: Arc<Mutex<TaskRegistry>>,
}

impl PageLoader {
    pub fn new(cache: ImageCache, sources: Sources) -> Self {
        Self {
            cache,
            sources,
            registry: Arc::new(Mutex::new(TaskRegistry::default())),
        }
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    /// Returns the decoded page, fetching and caching it on a miss.
    pub async fn load(&self, page: &Page) -> Result<PageImage> {
        let identifier = page.identifier();

        let cache = self.cache.clone();
        let id = identifier.clone();
        if let Some(image) = task::spawn_blocking(move || cache.get(&id, None)).await? {
            return Ok(image);
        }

        let bytes = fetch_bytes(&self.sources, &page.location).await?;
        let cache = self.cache.clone();
        task::spawn_blocking(move || -> Result<PageImage> {
            let image = Arc::new(image::load_from_memory(&bytes)?);
            cache.put(&identifier, image.clone(), None, true);
            Ok(image)
        })
        .await?
    }

    /// Recomputes the prefetch window around `current`.
    ///
    /// Tasks outside `[current - radius, current + radius]` are cancelled,
    /// including those left over from other chapters. Uncached pages inside
    /// the window, except `current` itself, get a task unless one is already
    /// running. Must be called from within a Tokio runtime.
    pub fn prefetch(&self, pages: &[Page], current: usize, radius: usize) {
        let Some(last) = pages.len().checked_sub(1) else {
            self.cancel_all_prefetch();
            return;
        };
        let current = current.min(last);
        let start = current.saturating_sub(radius);
        let end = current.saturating_add(radius).min(last);
        let chapter = pages[current].chapter_id.clone();

        let candidates: Vec<&Page> = {
            let mut registry = lock(&self.registry);
            registry.tasks.retain(|(chapter_id, index), task| {
                if *chapter_id != chapter || !(start..=end).contains(index) {
                    task.token.cancel();
                    return false;
                }
                // the page being read is left to finish
                task.detached = *index == current;
                true
            });
            pages[start..=end]
                .iter()
                .filter(|page| page.index != current)
                .filter(|page| {
                    !registry
                        .tasks
                        .contains_key(&(page.chapter_id.clone(), page.index))
                })
                .collect()
        };

        // presence checks may stat the disk, so they run outside the registry lock
        let uncached: Vec<&Page> = candidates
            .into_iter()
            .filter(|page| !self.cache.has(&page.identifier(), None))
            .collect();

        let mut registry = lock(&self.registry);
        for page in uncached {
            let key = (page.chapter_id.clone(), page.index);
            if registry.tasks.contains_key(&key) {
                continue;
            }

            let token = CancellationToken::new();
            let generation = registry.next_generation;
            registry.next_generation += 1;
            registry.tasks.insert(
                key.clone(),
                PrefetchTask {
                    token: token.clone(),
                    generation,
                    detached: false,
                },
            );

            let loader = self.clone();
            let page = page.clone();
            tokio::spawn(async move {
                match loader.prefetch_one(&page, &token).await {
                    Ok(true) => debug!("Prefetched page {} of {}", page.index, page.chapter_id),
                    Ok(false) => debug!("Prefetch of page {} cancelled", page.index),
                    Err(e) => warn!(
                        "Prefetch of page {} of {} failed: {}",
                        page.index, page.chapter_id, e
                    ),
                }
                loader.finish(&key, generation);
            });
        }
    }

    pub fn cancel_all_prefetch(&self) {
        cancel_all(&mut lock(&self.registry));
    }

    /// Pages with a prefetch task still in flight, ordered by chapter and index.
    /// A task left running for the page being read is not counted.
    pub fn pending_prefetch(&self) -> Vec<(String, usize)> {
        let mut pending: Vec<_> = lock(&self.registry)
            .tasks
            .iter()
            .filter(|(_, task)| !task.detached)
            .map(|(key, _)| key.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Cancels prefetching and closes every source's network session.
    pub fn close(&self) {
        self.cancel_all_prefetch();
        self.sources.close_all();
    }

    /// Returns `Ok(false)` when cancelled before anything was stored.
    async fn prefetch_one(&self, page: &Page, token: &CancellationToken) -> Result<bool> {
        if token.is_cancelled() {
            return Ok(false);
        }

        let bytes = tokio::select! {
            _ = token.cancelled() => return Ok(false),
            bytes = fetch_bytes(&self.sources, &page.location) => bytes?,
        };

        let cache = self.cache.clone();
        let token = token.clone();
        let identifier = page.identifier();
        task::spawn_blocking(move || -> Result<bool> {
            if token.is_cancelled() {
                return Ok(false);
            }
            let image = Arc::new(image::load_from_memory(&bytes)?);
            if token.is_cancelled() {
                return Ok(false);
            }
            cache.put(&identifier, image, None, true);
            Ok(true)
        })
        .await?
    }

    fn finish(&self, key: &TaskKey, generation: u64) {
        let mut registry = lock(&self.registry);
        if registry
            .tasks
            .get(key)
            .is_some_and(|task| task.generation == generation)
        {
            registry.tasks.remove(key);
        }
    }
}

fn cancel_all(registry: &mut TaskRegistry) {
    for (_, task) in registry.tasks.drain() {
        task.token.cancel();
    }
}

async fn fetch_bytes(sources: &Sources, location: &PageLocation) -> Result<Vec<u8>> {
    match location {
        PageLocation::Local(path) => match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::PageNotFound(path.clone())),
            Err(e) => Err(e.into()),
        },
        PageLocation::Remote { source, url } => sources.get(*source)?.download_image(url).await,
    }
}

//! Remote catalog abstraction.
//!
//! Every catalog implements [`MangaSource`]. The set of catalogs is closed:
//! [`Source`] wraps each implementation in a variant and [`Sources`] holds at
//! most one instance per [`SourceKind`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::mangadex::MangaDexSource;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    MangaDex,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::MangaDex => f.write_str("mangadex"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MangaSummary {
    pub source: SourceKind,
    pub id: String,
    pub title: String,
    pub title_english: Option<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub author: Option<String>,
    pub artist: Option<String>,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
    pub status: Option<String>,
    pub year: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub id: String,
    /// Chapter label as published, usually numeric ("12", "12.5") but not always
    pub number: String,
    pub title: Option<String>,
    pub volume: Option<String>,
    pub language: String,
    pub page_count: usize,
    pub scanlation_group: Option<String>,
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    /// 0-based position within the chapter
    pub index: usize,
    pub url: String,
}

/// Capabilities a remote catalog offers.
pub trait MangaSource {
    fn kind(&self) -> SourceKind;

    /// `page` is 1-based.
    fn search(
        &self,
        query: &str,
        page: usize,
        page_size: usize,
    ) -> impl Future<Output = Result<Vec<MangaSummary>>> + Send;

    fn get_manga(&self, manga_id: &str) -> impl Future<Output = Result<MangaSummary>> + Send;

    /// All chapters in `language`, sorted with [`sort_chapters`].
    fn get_chapters(
        &self,
        manga_id: &str,
        language: &str,
    ) -> impl Future<Output = Result<Vec<ChapterSummary>>> + Send;

    fn get_pages(&self, chapter_id: &str) -> impl Future<Output = Result<Vec<PageInfo>>> + Send;

    fn download_image(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Drops the network session. The next request opens a new one.
    fn close(&self);
}

pub enum Source {
    MangaDex(MangaDexSource),
}

impl From<MangaDexSource> for Source {
    fn from(source: MangaDexSource) -> Self {
        Source::MangaDex(source)
    }
}

impl MangaSource for Source {
    fn kind(&self) -> SourceKind {
        match self {
            Source::MangaDex(source) => source.kind(),
        }
    }

    async fn search(&self, query: &str, page: usize, page_size: usize) -> Result<Vec<MangaSummary>> {
        match self {
            Source::MangaDex(source) => source.search(query, page, page_size).await,
        }
    }

    async fn get_manga(&self, manga_id: &str) -> Result<MangaSummary> {
        match self {
            Source::MangaDex(source) => source.get_manga(manga_id).await,
        }
    }

    async fn get_chapters(&self, manga_id: &str, language: &str) -> Result<Vec<ChapterSummary>> {
        match self {
            Source::MangaDex(source) => source.get_chapters(manga_id, language).await,
        }
    }

    async fn get_pages(&self, chapter_id: &str) -> Result<Vec<PageInfo>> {
        match self {
            Source::MangaDex(source) => source.get_pages(chapter_id).await,
        }
    }

    async fn download_image(&self, url: &str) -> Result<Vec<u8>> {
        match self {
            Source::MangaDex(source) => source.download_image(url).await,
        }
    }

    fn close(&self) {
        match self {
            Source::MangaDex(source) => source.close(),
        }
    }
}

/// Registered sources, one per kind.
#[derive(Clone, Default)]
pub struct Sources {
    entries: HashMap<SourceKind, Arc<Source>>,
}

impl Sources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: impl Into<Source>) -> Self {
        self.register(source);
        self
    }

    /// Replaces any source already registered for the same kind.
    pub fn register(&mut self, source: impl Into<Source>) {
        let source = source.into();
        self.entries.insert(source.kind(), Arc::new(source));
    }

    pub fn get(&self, kind: SourceKind) -> Result<Arc<Source>> {
        self.entries
            .get(&kind)
            .cloned()
            .ok_or(Error::SourceUnavailable(kind))
    }

    pub fn close_all(&self) {
        for source in self.entries.values() {
            source.close();
        }
    }
}

/// Numeric labels ascending, then non-numeric labels lexically.
pub fn sort_chapters(chapters: &mut [ChapterSummary]) {
    chapters.sort_by(|a, b| compare_labels(&a.number, &b.number));
}

fn compare_labels(a: &str, b: &str) -> Ordering {
    match (parse_label(a), parse_label(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn parse_label(label: &str) -> Option<f64> {
    label.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

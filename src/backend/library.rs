//! Chapter and page listings already fetched from a source, persisted so
//! reopening a manga or chapter does not hit the network again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::source::{ChapterSummary, MangaSource, MangaSummary, PageInfo, SourceKind};
use super::store::{load_json, save_json};
use crate::config::app_dir;
use crate::error::Result;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibraryFile {
    #[serde(default)]
    manga: BTreeMap<String, MangaSummary>,
    /// Keyed by `<source>:<manga id>:<language>`
    #[serde(default)]
    chapters: BTreeMap<String, Vec<ChapterSummary>>,
    /// Keyed by `<source>:<chapter id>`
    #[serde(default)]
    pages: BTreeMap<String, Vec<PageInfo>>,
}

pub struct Library {
    path: PathBuf,
    data: LibraryFile,
}

fn manga_key(source: SourceKind, manga_id: &str) -> String {
    format!("{}:{}", source, manga_id)
}

fn chapters_key(source: SourceKind, manga_id: &str, language: &str) -> String {
    format!("{}:{}:{}", source, manga_id, language)
}

fn pages_key(source: SourceKind, chapter_id: &str) -> String {
    format!("{}:{}", source, chapter_id)
}

impl Library {
    pub fn default_path() -> PathBuf {
        app_dir().join("library.json")
    }

    pub fn open(path: &Path) -> Self {
        let data: LibraryFile = load_json(path);
        info!(
            "Loaded library with {} manga and {} chapter listings",
            data.manga.len(),
            data.chapters.len()
        );
        Self {
            path: path.to_path_buf(),
            data,
        }
    }

    pub fn manga(&self, source: SourceKind, manga_id: &str) -> Option<&MangaSummary> {
        self.data.manga.get(&manga_key(source, manga_id))
    }

    pub fn chapters(
        &self,
        source: SourceKind,
        manga_id: &str,
        language: &str,
    ) -> Option<&[ChapterSummary]> {
        self.data
            .chapters
            .get(&chapters_key(source, manga_id, language))
            .map(Vec::as_slice)
    }

    pub fn pages(&self, source: SourceKind, chapter_id: &str) -> Option<&[PageInfo]> {
        self.data
            .pages
            .get(&pages_key(source, chapter_id))
            .map(Vec::as_slice)
    }

    pub async fn fetch_and_store_manga<S: MangaSource>(
        &mut self,
        source: &S,
        manga_id: &str,
    ) -> Result<MangaSummary> {
        let key = manga_key(source.kind(), manga_id);
        if let Some(manga) = self.data.manga.get(&key) {
            return Ok(manga.clone());
        }

        let manga = source.get_manga(manga_id).await?;
        self.data.manga.insert(key, manga.clone());
        self.save()?;
        Ok(manga)
    }

    /// Stored chapter list, or the source's list which is then stored.
    /// An empty listing is returned but not stored.
    pub async fn fetch_and_store_chapters<S: MangaSource>(
        &mut self,
        source: &S,
        manga_id: &str,
        language: &str,
    ) -> Result<Vec<ChapterSummary>> {
        let key = chapters_key(source.kind(), manga_id, language);
        if let Some(chapters) = self.data.chapters.get(&key) {
            debug!("Using {} stored chapters for {}", chapters.len(), key);
            return Ok(chapters.clone());
        }

        let chapters = source.get_chapters(manga_id, language).await?;
        if !chapters.is_empty() {
            self.data.chapters.insert(key, chapters.clone());
            self.save()?;
        }
        Ok(chapters)
    }

    /// Stored page list, or the source's list which is then stored. Stored
    /// chapters get their page count updated to match.
    pub async fn fetch_and_store_pages<S: MangaSource>(
        &mut self,
        source: &S,
        chapter_id: &str,
    ) -> Result<Vec<PageInfo>> {
        let kind = source.kind();
        let key = pages_key(kind, chapter_id);
        if let Some(pages) = self.data.pages.get(&key) {
            debug!("Using {} stored pages for {}", pages.len(), key);
            return Ok(pages.clone());
        }

        let pages = source.get_pages(chapter_id).await?;
        if pages.is_empty() {
            return Ok(pages);
        }

        let prefix = format!("{}:", kind);
        for (_, chapters) in self
            .data
            .chapters
            .iter_mut()
            .filter(|(key, _)| key.starts_with(&prefix))
        {
            for chapter in chapters.iter_mut().filter(|c| c.id == chapter_id) {
                chapter.page_count = pages.len();
            }
        }
        self.data.pages.insert(key, pages.clone());
        self.save()?;
        Ok(pages)
    }

    fn save(&self) -> Result<()> {
        save_json(&self.path, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mangadex::MangaDexSource;
    use crate::backend::test_server::{Reply, TestServer};
    use crate::config::SourceConfig;
    use serde_json::json;

    fn source_for(server: &TestServer) -> MangaDexSource {
        MangaDexSource::new(&SourceConfig {
            api_url: server.url(),
            request_interval_ms: 0,
            ..SourceConfig::default()
        })
    }

    fn chapter_list() -> serde_json::Value {
        json!({
            "data": [
                { "id": "c2", "attributes": { "chapter": "2", "pages": 0, "translatedLanguage": "en" } },
                { "id": "c1", "attributes": { "chapter": "1", "pages": 0, "translatedLanguage": "en" } }
            ],
            "total": 2
        })
    }

    fn at_home() -> serde_json::Value {
        json!({
            "baseUrl": "https://node.example",
            "chapter": { "hash": "h", "data": ["a.png", "b.png", "c.png"] }
        })
    }

    #[tokio::test]
    async fn test_chapters_fetched_once() {
        let server = TestServer::start().await;
        server.route("/chapter", [Reply::json(chapter_list())]);
        let source = source_for(&server);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");

        let mut library = Library::open(&path);
        let chapters = library.fetch_and_store_chapters(&source, "m1", "en").await.unwrap();
        assert_eq!(chapters[0].id, "c1");
        let again = library.fetch_and_store_chapters(&source, "m1", "en").await.unwrap();
        assert_eq!(again, chapters);
        assert_eq!(server.requests("/chapter").len(), 1);

        let mut reopened = Library::open(&path);
        assert_eq!(
            reopened.chapters(SourceKind::MangaDex, "m1", "en").map(<[_]>::len),
            Some(2)
        );
        reopened.fetch_and_store_chapters(&source, "m1", "en").await.unwrap();
        assert_eq!(server.requests("/chapter").len(), 1);
        assert!(reopened.chapters(SourceKind::MangaDex, "m1", "fr").is_none());
    }

    #[tokio::test]
    async fn test_empty_listing_is_not_stored() {
        let server = TestServer::start().await;
        server.route("/chapter", [Reply::json(json!({ "data": [], "total": 0 }))]);
        let source = source_for(&server);
        let dir = tempfile::tempdir().unwrap();

        let mut library = Library::open(&dir.path().join("library.json"));
        assert!(library.fetch_and_store_chapters(&source, "m1", "en").await.unwrap().is_empty());
        library.fetch_and_store_chapters(&source, "m1", "en").await.unwrap();
        assert_eq!(server.requests("/chapter").len(), 2);
    }

    #[tokio::test]
    async fn test_pages_update_chapter_page_count() {
        let server = TestServer::start().await;
        server.route("/chapter", [Reply::json(chapter_list())]);
        server.route("/at-home/server/c1", [Reply::json(at_home())]);
        let source = source_for(&server);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");

        let mut library = Library::open(&path);
        library.fetch_and_store_chapters(&source, "m1", "en").await.unwrap();
        let pages = library.fetch_and_store_pages(&source, "c1").await.unwrap();
        assert_eq!(pages.len(), 3);
        library.fetch_and_store_pages(&source, "c1").await.unwrap();
        assert_eq!(server.requests("/at-home/server/c1").len(), 1);

        let reopened = Library::open(&path);
        let chapters = reopened.chapters(SourceKind::MangaDex, "m1", "en").unwrap();
        assert_eq!(chapters[0].page_count, 3);
        assert_eq!(chapters[1].page_count, 0);
        assert_eq!(reopened.pages(SourceKind::MangaDex, "c1").unwrap()[2].index, 2);
    }

    #[tokio::test]
    async fn test_manga_fetched_once() {
        let server = TestServer::start().await;
        server.route(
            "/manga/m1",
            [Reply::json(json!({
                "data": { "id": "m1", "attributes": { "title": { "en": "Title" } } }
            }))],
        );
        let source = source_for(&server);
        let dir = tempfile::tempdir().unwrap();

        let mut library = Library::open(&dir.path().join("library.json"));
        let manga = library.fetch_and_store_manga(&source, "m1").await.unwrap();
        assert_eq!(manga.title, "Title");
        library.fetch_and_store_manga(&source, "m1").await.unwrap();
        assert_eq!(server.requests("/manga/m1").len(), 1);
        assert!(library.manga(SourceKind::MangaDex, "m1").is_some());
    }
}

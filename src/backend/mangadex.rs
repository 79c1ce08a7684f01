use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use super::lock;
use super::rate_limit::RateLimiter;
use super::source::{
    ChapterSummary, MangaSource, MangaSummary, PageInfo, SourceKind, sort_chapters,
};
use crate::config::SourceConfig;
use crate::error::{Error, Result};

const CDN_URL: &str = "https://uploads.mangadex.org";
const INCLUDES: &str = "includes[]=cover_art&includes[]=author&includes[]=artist";
const CONTENT_RATINGS: &str =
    "contentRating[]=safe&contentRating[]=suggestive&contentRating[]=erotica";
const MAX_SEARCH_LIMIT: usize = 100;
/// Retry hints above this are absolute Unix timestamps rather than delays.
const EPOCH_HINT_THRESHOLD: u64 = 1_000_000_000;

/// Which image set the at-home server should hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageQuality {
    #[default]
    Data,
    DataSaver,
}

impl ImageQuality {
    fn path_segment(self) -> &'static str {
        match self {
            ImageQuality::Data => "data",
            ImageQuality::DataSaver => "data-saver",
        }
    }
}

#[derive(Debug, Deserialize)]
struct MangaListResponse {
    data: Vec<MangaData>,
}

#[derive(Debug, Deserialize)]
struct MangaResponse {
    data: MangaData,
}

#[derive(Debug, Deserialize)]
struct MangaData {
    id: String,
    attributes: MangaAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Deserialize)]
struct MangaAttributes {
    #[serde(default, deserialize_with = "localized")]
    title: BTreeMap<String, String>,
    #[serde(default, rename = "altTitles")]
    alt_titles: Vec<BTreeMap<String, String>>,
    #[serde(default, deserialize_with = "localized")]
    description: BTreeMap<String, String>,
    status: Option<String>,
    year: Option<u32>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    attributes: TagAttributes,
}

#[derive(Debug, Deserialize)]
struct TagAttributes {
    #[serde(default, deserialize_with = "localized")]
    name: BTreeMap<String, String>,
    #[serde(default)]
    group: String,
}

#[derive(Debug, Deserialize)]
struct Relationship {
    #[serde(rename = "type")]
    rel_type: String,
    attributes: Option<RelationshipAttributes>,
}

#[derive(Debug, Deserialize)]
struct RelationshipAttributes {
    name: Option<String>,
    #[serde(rename = "fileName")]
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChapterListResponse {
    data: Vec<ChapterData>,
    #[serde(default)]
    total: usize,
}

#[derive(Debug, Deserialize)]
struct ChapterData {
    id: String,
    attributes: ChapterAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Deserialize)]
struct ChapterAttributes {
    chapter: Option<String>,
    title: Option<String>,
    volume: Option<String>,
    #[serde(default)]
    pages: usize,
    #[serde(rename = "translatedLanguage")]
    translated_language: Option<String>,
    #[serde(rename = "publishAt")]
    publish_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtHomeResponse {
    #[serde(rename = "baseUrl")]
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Debug, Deserialize)]
struct AtHomeChapter {
    hash: String,
    data: Vec<String>,
    #[serde(default, rename = "dataSaver")]
    data_saver: Vec<String>,
}

/// MangaDex serializes an empty localized map as `[]`.
fn localized<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Localized {
        Map(BTreeMap<String, String>),
        Other(serde_json::Value),
    }

    Ok(match Localized::deserialize(deserializer)? {
        Localized::Map(map) => map,
        Localized::Other(_) => BTreeMap::new(),
    })
}

fn pick_localized(map: &BTreeMap<String, String>, preferred: &[&str]) -> Option<String> {
    preferred
        .iter()
        .find_map(|lang| map.get(*lang))
        .or_else(|| map.values().next())
        .filter(|value| !value.is_empty())
        .cloned()
}

fn parse_manga(m: MangaData) -> MangaSummary {
    let mut author = None;
    let mut artist = None;
    let mut cover_filename = None;

    for rel in &m.relationships {
        let Some(attrs) = &rel.attributes else {
            continue;
        };
        match rel.rel_type.as_str() {
            "author" => author = attrs.name.clone(),
            "artist" => artist = attrs.name.clone(),
            "cover_art" => cover_filename = attrs.file_name.clone(),
            _ => {}
        }
    }

    let cover_url =
        cover_filename.map(|file| format!("{}/covers/{}/{}.512.jpg", CDN_URL, m.id, file));

    let attrs = m.attributes;
    let title =
        pick_localized(&attrs.title, &["en", "ja-ro"]).unwrap_or_else(|| "Unknown".to_string());
    let title_english = attrs.alt_titles.iter().find_map(|alt| alt.get("en").cloned());
    let description = pick_localized(&attrs.description, &["en"]);

    let mut tags = Vec::new();
    let mut genres = Vec::new();
    for tag in attrs.tags {
        let Some(name) = tag.attributes.name.get("en").filter(|n| !n.is_empty()) else {
            continue;
        };
        if tag.attributes.group == "genre" {
            genres.push(name.clone());
        }
        tags.push(name.clone());
    }

    MangaSummary {
        source: SourceKind::MangaDex,
        id: m.id,
        title,
        title_english,
        description,
        cover_url,
        author,
        artist,
        genres,
        tags,
        status: attrs.status,
        year: attrs.year,
    }
}

fn parse_chapter(c: ChapterData, language: &str) -> ChapterSummary {
    let scanlation_group = c
        .relationships
        .iter()
        .find(|rel| rel.rel_type == "scanlation_group")
        .and_then(|rel| rel.attributes.as_ref())
        .and_then(|attrs| attrs.name.clone());

    ChapterSummary {
        id: c.id,
        number: c.attributes.chapter.unwrap_or_else(|| "0".to_string()),
        title: c.attributes.title.filter(|t| !t.is_empty()),
        volume: c.attributes.volume,
        language: c
            .attributes
            .translated_language
            .unwrap_or_else(|| language.to_string()),
        page_count: c.attributes.pages,
        scanlation_group,
        published_at: c.attributes.publish_at,
    }
}

/// Reads the server's retry hint: a delay in seconds or an absolute Unix
/// timestamp, from `X-RateLimit-Retry-After` or `Retry-After`.
fn retry_delay(headers: &HeaderMap, fallback: Duration) -> Duration {
    let hint = ["x-ratelimit-retry-after", "retry-after"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| value.trim().parse::<u64>().ok());

    match hint {
        Some(at) if at > EPOCH_HINT_THRESHOLD => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            Duration::from_secs(at.saturating_sub(now))
        }
        Some(secs) => Duration::from_secs(secs),
        None => fallback,
    }
}

fn ensure_success(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::Status {
            status,
            url: url.to_string(),
        })
    }
}

/// MangaDex metadata API plus its image CDN.
pub struct MangaDexSource {
    api_url: String,
    user_agent: String,
    quality: ImageQuality,
    batch_size: usize,
    retry_fallback: Duration,
    limiter: RateLimiter,
    client: Mutex<Option<reqwest::Client>>,
}

impl MangaDexSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            user_agent: config.user_agent.clone(),
            quality: config.quality,
            batch_size: config.chapter_batch_size.max(1),
            retry_fallback: config.retry_after_default(),
            limiter: RateLimiter::new(config.request_interval()),
            client: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.client).is_some()
    }

    fn client(&self) -> Result<reqwest::Client> {
        let mut slot = lock(&self.client);
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .build()?;
        info!("Opened MangaDex session");
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Rate-limited GET. A 429 is retried once after the server's hint;
    /// any other non-success status is an error.
    async fn get(&self, url: &str) -> Result<Response> {
        let client = self.client()?;

        self.limiter.acquire().await;
        let response = client.get(url).send().await?;
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return ensure_success(response, url);
        }

        let delay = retry_delay(response.headers(), self.retry_fallback);
        warn!("Rate limited on {}, retrying in {:?}", url, delay);
        tokio::time::sleep(delay).await;

        self.limiter.acquire().await;
        let response = client.get(url).send().await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited {
                url: url.to_string(),
            });
        }
        ensure_success(response, url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let body = self.get(url).await?.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| Error::payload(format!("{url}: {e}")))
    }
}

impl MangaSource for MangaDexSource {
    fn kind(&self) -> SourceKind {
        SourceKind::MangaDex
    }

    /// An empty query lists the most followed titles instead.
    async fn search(&self, query: &str, page: usize, page_size: usize) -> Result<Vec<MangaSummary>> {
        let limit = page_size.clamp(1, MAX_SEARCH_LIMIT);
        let offset = page.saturating_sub(1) * limit;
        let filter = if query.trim().is_empty() {
            "order[followedCount]=desc".to_string()
        } else {
            format!(
                "title={}&order[relevance]=desc",
                urlencoding::encode(query.trim())
            )
        };
        let url = format!(
            "{}/manga?{}&limit={}&offset={}&{}&{}",
            self.api_url, filter, limit, offset, INCLUDES, CONTENT_RATINGS
        );

        let response: MangaListResponse = self.get_json(&url).await?;
        Ok(response.data.into_iter().map(parse_manga).collect())
    }

    async fn get_manga(&self, manga_id: &str) -> Result<MangaSummary> {
        let url = format!(
            "{}/manga/{}?{}",
            self.api_url,
            urlencoding::encode(manga_id),
            INCLUDES
        );
        let response: MangaResponse = self.get_json(&url).await?;
        Ok(parse_manga(response.data))
    }

    async fn get_chapters(&self, manga_id: &str, language: &str) -> Result<Vec<ChapterSummary>> {
        let mut chapters = Vec::new();
        let mut offset = 0;

        loop {
            let url = format!(
                "{}/chapter?manga={}&translatedLanguage[]={}&limit={}&offset={}&order[chapter]=asc&includes[]=scanlation_group&{}",
                self.api_url,
                urlencoding::encode(manga_id),
                urlencoding::encode(language),
                self.batch_size,
                offset,
                CONTENT_RATINGS
            );
            let batch: ChapterListResponse = self.get_json(&url).await?;
            if batch.data.is_empty() {
                break;
            }
            chapters.extend(batch.data.into_iter().map(|c| parse_chapter(c, language)));

            offset += self.batch_size;
            if offset >= batch.total {
                break;
            }
        }

        debug!("Fetched {} chapters for manga {}", chapters.len(), manga_id);
        sort_chapters(&mut chapters);
        Ok(chapters)
    }

    async fn get_pages(&self, chapter_id: &str) -> Result<Vec<PageInfo>> {
        let url = format!(
            "{}/at-home/server/{}",
            self.api_url,
            urlencoding::encode(chapter_id)
        );
        let response: AtHomeResponse = self.get_json(&url).await?;

        // fall back to full quality when the server has no data-saver set
        let (files, quality) = match self.quality {
            ImageQuality::DataSaver if !response.chapter.data_saver.is_empty() => {
                (response.chapter.data_saver, ImageQuality::DataSaver)
            }
            _ => (response.chapter.data, ImageQuality::Data),
        };

        let base_url = response.base_url.trim_end_matches('/');
        Ok(files
            .into_iter()
            .enumerate()
            .map(|(index, file)| PageInfo {
                index,
                url: format!(
                    "{}/{}/{}/{}",
                    base_url,
                    quality.path_segment(),
                    response.chapter.hash,
                    file
                ),
            })
            .collect())
    }

    async fn download_image(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self.get(url).await?.bytes().await?;
        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }

    fn close(&self) {
        if lock(&self.client).take().is_some() {
            info!("Closed MangaDex session");
        }
    }
}

//! Layered configuration: defaults, then an optional JSON file, then
//! `MANGA_PAGER_*` environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::backend::mangadex::ImageQuality;
use crate::error::{Error, Result};

pub const APP_NAME: &str = "manga-pager";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub source: SourceConfig,
    pub prefetch: PrefetchConfig,
}

/// Budgets and location for the two-tier image cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory tier budget in bytes of decoded RGBA pixels
    pub memory_budget: u64,
    /// Disk tier budget in bytes of encoded cache files
    pub disk_budget: u64,
    pub cache_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget: 200 * MIB,
            disk_budget: 1000 * MIB,
            cache_dir: default_cache_dir(),
        }
    }
}

impl CacheConfig {
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_budget = mb.saturating_mul(MIB);
        self
    }

    pub fn with_disk_mb(mut self, mb: u64) -> Self {
        self.disk_budget = mb.saturating_mul(MIB);
        self
    }

    pub fn with_cache_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.cache_dir = path.as_ref().to_path_buf();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub api_url: String,
    /// Minimum spacing between two requests issued by one source instance
    pub request_interval_ms: u64,
    /// Used when a 429 response carries no usable retry hint
    pub retry_after_default_secs: u64,
    pub chapter_batch_size: usize,
    pub quality: ImageQuality,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.mangadex.org".to_string(),
            request_interval_ms: 200,
            retry_after_default_secs: 60,
            chapter_batch_size: 100,
            quality: ImageQuality::Data,
            user_agent: format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SourceConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn retry_after_default(&self) -> Duration {
        Duration::from_secs(self.retry_after_default_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Pages prefetched on each side of the current one
    pub radius: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self { radius: 2 }
    }
}

/// Per-user directory holding the config file, progress and library stores.
pub fn app_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("images")
}

impl Config {
    /// Loads the configuration. An explicit `path` must exist; the default
    /// location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = app_dir().join("config.json");
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content).map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Applies `MANGA_PAGER_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bytes) = parse_mib(&lookup, "MANGA_PAGER_MEMORY_CACHE_MB")? {
            self.cache.memory_budget = bytes;
        }
        if let Some(bytes) = parse_mib(&lookup, "MANGA_PAGER_DISK_CACHE_MB")? {
            self.cache.disk_budget = bytes;
        }
        if let Some(dir) = lookup("MANGA_PAGER_CACHE_DIR") {
            self.cache.cache_dir = PathBuf::from(dir);
        }
        if let Some(radius) = parse_var(&lookup, "MANGA_PAGER_PREFETCH_RADIUS")? {
            self.prefetch.radius = radius as usize;
        }
        Ok(())
    }
}

fn parse_var<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::Config {
                key: key.to_string(),
                value,
            }),
    }
}

/// A megabyte count converted to bytes, rejected when the product overflows.
fn parse_mib<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(mb) = parse_var(lookup, key)? else {
        return Ok(None);
    };
    mb.checked_mul(MIB).map(Some).ok_or_else(|| Error::Config {
        key: key.to_string(),
        value: mb.to_string(),
    })
}

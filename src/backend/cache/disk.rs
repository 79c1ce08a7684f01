use std::fs::{self, File, FileTimes};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use image::{DynamicImage, ImageFormat};
use log::{debug, warn};

use super::key::CacheKey;
use crate::error::Result;

const CACHE_EXT: &str = "cache";

/// Flat directory of `<digest>.cache` PNG files.
///
/// Only a running byte counter is kept in memory. Recency comes from the
/// files' access times, so eviction rescans the directory each time it runs.
pub(crate) struct DiskTier {
    dir: PathBuf,
    budget: u64,
    used: u64,
    evictions: u64,
}

impl DiskTier {
    pub(crate) fn open(dir: &Path, budget: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let used = scan(dir).iter().map(|file| file.size).sum();
        debug!("Disk cache at {} holds {} bytes", dir.display(), used);
        Ok(Self {
            dir: dir.to_path_buf(),
            budget,
            used,
            evictions: 0,
        })
    }

    pub(crate) fn used(&self) -> u64 {
        self.used
    }

    pub(crate) fn budget(&self) -> u64 {
        self.budget
    }

    pub(crate) fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Moves a staged file into place. Evicts by the estimate first, then
    /// reconciles the counter with the real size and whatever file it replaces.
    pub(crate) fn commit(&mut self, key: &CacheKey, staged: Staged, estimate: u64) -> Result<()> {
        let path = entry_path(&self.dir, key);
        self.evict_to_fit(estimate);
        // eviction may already have removed the file being replaced
        let previous = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        if let Err(e) = fs::rename(&staged.path, &path) {
            let _ = fs::remove_file(&staged.path);
            return Err(e.into());
        }

        self.used = (self.used + staged.len).saturating_sub(previous);
        debug!(
            "Stored {} on disk ({} bytes, estimated {})",
            key, staged.len, estimate
        );
        Ok(())
    }

    fn evict_to_fit(&mut self, incoming: u64) {
        if self.used + incoming <= self.budget {
            return;
        }

        let mut files = scan(&self.dir);
        files.sort_by_key(|file| file.accessed);

        for file in files {
            if self.used + incoming <= self.budget {
                break;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to evict {}: {}", file.path.display(), e);
                    continue;
                }
            }
            self.used = self.used.saturating_sub(file.size);
            self.evictions += 1;
            debug!("Evicted {} from disk cache", file.path.display());
        }
    }

    pub(crate) fn clear(&mut self) {
        for file in scan(&self.dir) {
            if let Err(e) = fs::remove_file(&file.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", file.path.display(), e);
                }
            }
        }
        self.used = 0;
    }
}

pub(crate) fn entry_path(dir: &Path, key: &CacheKey) -> PathBuf {
    dir.join(key.file_name())
}

/// Refreshes the entry's access time so eviction treats it as recent.
pub(crate) fn touch(path: &Path) -> io::Result<()> {
    let now = SystemTime::now();
    let file = File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_accessed(now).set_modified(now))
}

/// A PNG written next to its final location, waiting for [`DiskTier::commit`].
pub(crate) struct Staged {
    path: PathBuf,
    len: u64,
}

static STAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Encodes and writes the entry to a temporary file. Runs without the tier lock.
pub(crate) fn stage(dir: &Path, key: &CacheKey, image: &DynamicImage) -> Result<Staged> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;

    let seq = STAGE_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!("{}.{}.tmp", key, seq));
    if let Err(e) = fs::write(&path, &bytes) {
        let _ = fs::remove_file(&path);
        return Err(e.into());
    }
    Ok(Staged {
        path,
        len: bytes.len() as u64,
    })
}

struct CacheFile {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
}

fn scan(dir: &Path) -> Vec<CacheFile> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == CACHE_EXT))
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let accessed = meta
                .accessed()
                .or_else(|_| meta.modified())
                .unwrap_or(UNIX_EPOCH);
            Some(CacheFile {
                path: e.path(),
                size: meta.len(),
                accessed,
            })
        })
        .collect()
}

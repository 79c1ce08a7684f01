//! Two-tier page image cache.
//!
//! Decoded pages live in a byte-budgeted LRU map; every stored page can also
//! be written to a flat directory of PNG files that survives restarts. A
//! memory hit never touches the disk, and a disk hit is promoted back into
//! memory.

mod disk;
mod key;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::DynamicImage;
use log::{debug, warn};
use lru::LruCache;

use super::lock;
use crate::config::CacheConfig;
use crate::error::Result;
use disk::DiskTier;

pub use key::{CacheKey, TargetSize};

/// Decoded page shared between the cache and its readers.
pub type PageImage = Arc<DynamicImage>;

/// Budget accounting size of a decoded page: four bytes per RGBA pixel.
pub fn estimate_size(image: &DynamicImage) -> u64 {
    u64::from(image.width()) * u64::from(image.height()) * 4
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_items: usize,
    pub memory_bytes: u64,
    pub memory_budget: u64,
    pub disk_bytes: u64,
    pub disk_budget: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub memory_evictions: u64,
    pub disk_evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct MemoryEntry {
    image: PageImage,
    size: u64,
}

struct MemoryTier {
    entries: LruCache<CacheKey, MemoryEntry>,
    used: u64,
    budget: u64,
    hits: u64,
    disk_hits: u64,
    misses: u64,
    evictions: u64,
}

impl MemoryTier {
    fn new(budget: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            used: 0,
            budget,
            hits: 0,
            disk_hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<PageImage> {
        self.entries.get(key).map(|entry| entry.image.clone())
    }

    /// Admits the entry even when it alone exceeds the budget.
    fn insert(&mut self, key: CacheKey, image: PageImage, size: u64) {
        if let Some(old) = self.entries.pop(&key) {
            self.used -= old.size;
        }

        while self.used + size > self.budget {
            let Some((evicted, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.used -= entry.size;
            self.evictions += 1;
            debug!("Evicted {} from memory cache ({} bytes)", evicted, entry.size);
        }

        self.used += size;
        self.entries.put(key, MemoryEntry { image, size });
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.used = 0;
    }
}

struct CacheInner {
    dir: PathBuf,
    memory: Mutex<MemoryTier>,
    disk: Mutex<DiskTier>,
}

/// Cheap to clone; all clones share the same tiers.
///
/// Every method does blocking file I/O on a miss or a persisting put, so
/// async callers should run them on the blocking pool.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<CacheInner>,
}

impl ImageCache {
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let disk = DiskTier::open(&config.cache_dir, config.disk_budget)?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                dir: config.cache_dir.clone(),
                memory: Mutex::new(MemoryTier::new(config.memory_budget)),
                disk: Mutex::new(disk),
            }),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn get(&self, identifier: &str, size: Option<TargetSize>) -> Option<PageImage> {
        let key = CacheKey::new(identifier, size);

        {
            let mut memory = lock(&self.inner.memory);
            if let Some(image) = memory.get(&key) {
                memory.hits += 1;
                debug!("Memory cache hit for {}", identifier);
                return Some(image);
            }
        }

        let path = disk::entry_path(&self.inner.dir, &key);
        let Some(image) = read_entry(&path) else {
            lock(&self.inner.memory).misses += 1;
            debug!("Cache miss for {}", identifier);
            return None;
        };

        if let Err(e) = disk::touch(&path) {
            debug!("Could not refresh access time of {}: {}", path.display(), e);
        }

        let image = Arc::new(image);
        let size = estimate_size(&image);
        let mut memory = lock(&self.inner.memory);
        memory.disk_hits += 1;
        memory.insert(key, image.clone(), size);
        debug!("Disk cache hit for {}", identifier);
        Some(image)
    }

    /// Stores `image` in memory and, when `persist` is set, on disk.
    ///
    /// Disk failures are logged and otherwise ignored: the page is still
    /// served from memory.
    pub fn put(&self, identifier: &str, image: PageImage, size: Option<TargetSize>, persist: bool) {
        let key = CacheKey::new(identifier, size);
        let estimate = estimate_size(&image);

        lock(&self.inner.memory).insert(key.clone(), image.clone(), estimate);

        if persist {
            if let Err(e) = self.persist(&key, &image, estimate) {
                warn!("Failed to persist {} to disk cache: {}", identifier, e);
            }
        }
    }

    /// The encode and write happen before the disk tier is locked; only
    /// eviction and the rename run under it.
    fn persist(&self, key: &CacheKey, image: &DynamicImage, estimate: u64) -> Result<()> {
        let staged = disk::stage(&self.inner.dir, key, image)?;
        // compressed size is not known to eviction; half the raw size stands in
        lock(&self.inner.disk).commit(key, staged, estimate / 2)
    }

    /// Presence check that neither promotes nor loads the entry.
    pub fn has(&self, identifier: &str, size: Option<TargetSize>) -> bool {
        let key = CacheKey::new(identifier, size);
        if lock(&self.inner.memory).entries.contains(&key) {
            return true;
        }
        disk::entry_path(&self.inner.dir, &key).is_file()
    }

    pub fn clear_memory(&self) {
        lock(&self.inner.memory).clear();
    }

    pub fn clear_disk(&self) {
        lock(&self.inner.disk).clear();
    }

    pub fn clear_all(&self) {
        self.clear_memory();
        self.clear_disk();
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = {
            let memory = lock(&self.inner.memory);
            CacheStats {
                memory_items: memory.entries.len(),
                memory_bytes: memory.used,
                memory_budget: memory.budget,
                memory_hits: memory.hits,
                disk_hits: memory.disk_hits,
                misses: memory.misses,
                memory_evictions: memory.evictions,
                ..Default::default()
            }
        };
        let disk = lock(&self.inner.disk);
        stats.disk_bytes = disk.used();
        stats.disk_budget = disk.budget();
        stats.disk_evictions = disk.evictions();
        stats
    }
}

/// Missing and undecodable entries both read as a miss.
fn read_entry(path: &Path) -> Option<DynamicImage> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Failed to read cache file {}: {}", path.display(), e);
            return None;
        }
    };

    match image::load_from_memory(&bytes) {
        Ok(image) => Some(image),
        Err(e) => {
            warn!("Ignoring corrupt cache file {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::time::{Duration, Instant};

    const SIDE: u32 = 10;
    const ENTRY: u64 = (SIDE * SIDE * 4) as u64;

    fn page(shade: u8) -> PageImage {
        Arc::new(DynamicImage::ImageRgba8(RgbaImage::from_fn(
            SIDE,
            SIDE,
            |x, y| Rgba([shade, x as u8, y as u8, 255]),
        )))
    }

    fn open(dir: &Path, memory_budget: u64, disk_budget: u64) -> ImageCache {
        ImageCache::open(&CacheConfig {
            memory_budget,
            disk_budget,
            cache_dir: dir.to_path_buf(),
        })
        .unwrap()
    }

    fn in_memory(cache: &ImageCache, identifier: &str) -> bool {
        lock(&cache.inner.memory)
            .entries
            .contains(&CacheKey::new(identifier, None))
    }

    #[test]
    fn test_miss_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY * 4, 1 << 20);
        assert!(cache.get("nothing", None).is_none());
        assert!(!cache.has("nothing", None));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_memory_stays_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY * 3, 1 << 20);

        for i in 0..10 {
            cache.put(&format!("page-{i}"), page(i as u8), None, false);
            let stats = cache.stats();
            assert!(stats.memory_bytes <= stats.memory_budget);
            assert!(stats.memory_items <= 3);
        }
        assert_eq!(cache.stats().memory_evictions, 7);
    }

    #[test]
    fn test_oversized_entry_is_still_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY / 2, 1 << 20);

        cache.put("a", page(1), None, false);
        cache.put("b", page(2), None, false);

        let stats = cache.stats();
        assert_eq!(stats.memory_items, 1);
        assert_eq!(stats.memory_bytes, ENTRY);
        assert!(in_memory(&cache, "b"));
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY * 2, 1 << 20);

        cache.put("a", page(1), None, false);
        cache.put("b", page(2), None, false);
        cache.put("c", page(3), None, false);

        assert!(!in_memory(&cache, "a"));
        assert!(in_memory(&cache, "b"));
        assert!(in_memory(&cache, "c"));
    }

    #[test]
    fn test_get_refreshes_recency() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY * 2, 1 << 20);

        cache.put("a", page(1), None, false);
        cache.put("b", page(2), None, false);
        assert!(cache.get("a", None).is_some());
        cache.put("c", page(3), None, false);

        assert!(in_memory(&cache, "a"));
        assert!(!in_memory(&cache, "b"));
        assert!(in_memory(&cache, "c"));
    }

    #[test]
    fn test_reput_does_not_double_count() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY * 2, 1 << 20);

        cache.put("a", page(1), None, false);
        cache.put("a", page(2), None, false);

        let stats = cache.stats();
        assert_eq!(stats.memory_items, 1);
        assert_eq!(stats.memory_bytes, ENTRY);
    }

    #[test]
    fn test_sizes_are_separate_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY * 8, 1 << 20);
        let small = Some(TargetSize::new(100, 100));
        let large = Some(TargetSize::new(200, 200));

        cache.put("id", page(200), large, true);

        assert!(cache.get("id", small).is_none());
        assert!(cache.get("id", None).is_none());
        assert!(!cache.has("id", small));
        assert!(cache.has("id", large));

        let hit = cache.get("id", large).unwrap();
        assert_eq!(hit.to_rgba8(), page(200).to_rgba8());
    }

    #[test]
    fn test_disk_round_trip_after_clear_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY * 4, 1 << 20);
        let original = page(42);

        cache.put("persisted", original.clone(), None, true);
        cache.clear_memory();
        assert_eq!(cache.stats().memory_items, 0);
        assert!(cache.has("persisted", None));

        let loaded = cache.get("persisted", None).unwrap();
        assert_eq!(loaded.to_rgba8(), original.to_rgba8());

        let stats = cache.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.memory_items, 1);
    }

    #[test]
    fn test_put_without_persist_skips_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY * 4, 1 << 20);

        cache.put("volatile", page(7), None, false);
        cache.clear_memory();

        assert!(!cache.has("volatile", None));
        assert!(cache.get("volatile", None).is_none());
        assert_eq!(cache.stats().disk_bytes, 0);
    }

    #[test]
    fn test_disk_promotion_evicts_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY, 1 << 30);

        cache.put("A", page(1), None, true);
        cache.put("B", page(2), None, true);
        assert!(!in_memory(&cache, "A"));
        assert!(in_memory(&cache, "B"));

        let a = cache.get("A", None).unwrap();
        assert_eq!(a.to_rgba8(), page(1).to_rgba8());
        assert!(in_memory(&cache, "A"));
        assert!(!in_memory(&cache, "B"));

        let stats = cache.stats();
        assert_eq!(stats.memory_items, 1);
        assert_eq!(stats.disk_hits, 1);
        assert!(cache.has("B", None));
    }

    #[test]
    fn test_corrupt_disk_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY * 4, 1 << 20);
        let key = CacheKey::new("broken", None);
        fs::write(dir.path().join(key.file_name()), b"definitely not a png").unwrap();

        assert!(cache.has("broken", None));
        assert!(cache.get("broken", None).is_none());

        // a fresh put overwrites the corrupt file
        cache.put("broken", page(9), None, true);
        cache.clear_memory();
        assert!(cache.get("broken", None).is_some());
    }

    #[test]
    fn test_disk_counter_survives_reopen_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), ENTRY * 4, 1 << 20);
        cache.put("a", page(1), None, true);
        cache.put("b", page(2), None, true);
        let written = cache.stats().disk_bytes;
        assert!(written > 0);
        drop(cache);

        let reopened = open(dir.path(), ENTRY * 4, 1 << 20);
        assert_eq!(reopened.stats().disk_bytes, written);

        reopened.clear_all();
        let stats = reopened.stats();
        assert_eq!(stats.disk_bytes, 0);
        assert_eq!(stats.memory_items, 0);
        assert!(!reopened.has("a", None));
    }

    #[test]
    fn test_disk_budget_evicts_before_write() {
        let dir = tempfile::tempdir().unwrap();
        // room for a single estimate (ENTRY / 2) and nothing else
        let cache = open(dir.path(), ENTRY * 8, ENTRY / 2);

        cache.put("first", page(1), None, true);
        cache.put("second", page(2), None, true);

        assert!(!cache.has_on_disk("first"));
        assert!(cache.has_on_disk("second"));
        assert!(cache.stats().disk_evictions >= 1);
    }

    #[test]
    fn test_stats_not_blocked_by_persisting_put() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1 << 30, 1 << 30);
        let mut state = 0x9e37_79b9u32;
        let large = Arc::new(DynamicImage::ImageRgba8(RgbaImage::from_fn(2000, 2000, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            Rgba(state.to_le_bytes())
        })));

        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                cache.put("large", large, None, true);
                started.elapsed()
            })
        };
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        cache.stats();
        let waited = started.elapsed();
        let put_took = writer.join().unwrap();

        assert!(
            waited < Duration::from_millis(200) || waited * 2 < put_took,
            "stats waited {waited:?} for a put that took {put_took:?}"
        );
        assert!(cache.has_on_disk("large"));
    }

    impl ImageCache {
        fn has_on_disk(&self, identifier: &str) -> bool {
            disk::entry_path(&self.inner.dir, &CacheKey::new(identifier, None)).is_file()
        }
    }
}

use std::fmt;

/// Target dimensions a page was rendered at. Each size is its own cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Hex md5 digest of an identifier and optional target size.
///
/// Doubles as the disk file stem, so it must stay stable across releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(identifier: &str, size: Option<TargetSize>) -> Self {
        let digest = match size {
            Some(size) => md5::compute(format!(
                "{}_{}x{}",
                identifier, size.width, size.height
            )),
            None => md5::compute(identifier.as_bytes()),
        };
        Self(format!("{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        format!("{}.cache", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_stable_hex() {
        let key = CacheKey::new("https://cdn.example/data/abc/1.png", None);
        assert_eq!(key.as_str().len(), 32);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, CacheKey::new("https://cdn.example/data/abc/1.png", None));
    }

    #[test]
    fn test_known_digest() {
        // md5("page") and md5("page_100x200")
        assert_eq!(
            CacheKey::new("page", None).as_str(),
            format!("{:x}", md5::compute("page"))
        );
        assert_eq!(
            CacheKey::new("page", Some(TargetSize::new(100, 200))).as_str(),
            format!("{:x}", md5::compute("page_100x200"))
        );
    }

    #[test]
    fn test_sizes_produce_distinct_keys() {
        let plain = CacheKey::new("/manga/ch1/001.jpg", None);
        let small = CacheKey::new("/manga/ch1/001.jpg", Some(TargetSize::new(100, 100)));
        let large = CacheKey::new("/manga/ch1/001.jpg", Some(TargetSize::new(200, 200)));
        assert_ne!(plain, small);
        assert_ne!(plain, large);
        assert_ne!(small, large);
    }

    #[test]
    fn test_file_name() {
        let key = CacheKey::new("x", None);
        assert_eq!(key.file_name(), format!("{}.cache", key));
    }
}

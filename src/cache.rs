//! Memory cache boundary and the default concurrent implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use moka::sync::Cache;

use crate::decoder::{DecodedImage, ImageInformation};

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub size_bytes: u64,
    pub num_images: u64,
}

/// Key → decoded image store. Implementations must tolerate concurrent
/// `get`/`add`/`clear` from many lifecycles; a `clear` may race an `add`.
pub trait MemoryCache: Send + Sync {
    fn get(&self, key: &str) -> Option<(DecodedImage, ImageInformation)>;

    fn add(&self, key: &str, info: ImageInformation, image: DecodedImage);

    fn contains(&self, key: &str) -> bool;

    fn remove(&self, key: &str);

    /// Remove every entry whose key starts with `base_key` (all geometry and
    /// transformation variants of one resource).
    fn remove_similar(&self, base_key: &str);

    fn clear(&self);
}

#[derive(Clone)]
struct CachedImage {
    image: DecodedImage,
    info: ImageInformation,
}

/// Thread-safe decoded image cache using moka (TinyLFU eviction), weighted
/// by pixel bytes.
pub struct ImageCache {
    cache: Cache<String, CachedImage>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ImageCache {
    /// Create a new cache with the given size limit in megabytes.
    pub fn new(max_size_mb: usize) -> Self {
        let max_bytes = (max_size_mb as u64) * 1024 * 1024;
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &String, value: &CachedImage| -> u32 {
                value.image.size_bytes().try_into().unwrap_or(u32::MAX)
            })
            .build();

        Self {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get cache statistics. Flushes pending moka maintenance first so
    /// sizes reflect recent inserts.
    pub fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            size_bytes: self.cache.weighted_size(),
            num_images: self.cache.entry_count(),
        }
    }

    /// Reset hit/miss counters to zero.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl MemoryCache for ImageCache {
    fn get(&self, key: &str) -> Option<(DecodedImage, ImageInformation)> {
        match self.cache.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some((entry.image, entry.info))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn add(&self, key: &str, info: ImageInformation, image: DecodedImage) {
        self.cache.insert(key.to_string(), CachedImage { image, info });
    }

    fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }

    fn remove_similar(&self, base_key: &str) {
        let matching: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(base_key))
            .map(|(key, _)| key.to_string())
            .collect();
        for key in matching {
            self.cache.invalidate(&key);
        }
    }

    fn clear(&self) {
        self.cache.invalidate_all();
        // Don't reset stats - keep for debugging
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ImageSource;

    fn make_image(size: usize) -> DecodedImage {
        DecodedImage::new(vec![0u8; size], 1, 1, 3)
    }

    fn info(key: &str) -> ImageInformation {
        let mut info = ImageInformation::new("a.jpg", ImageSource::Url);
        info.cache_key = key.to_string();
        info
    }

    #[test]
    fn test_cache_insert_and_get() {
        let cache = ImageCache::new(10);
        cache.add("a.jpg", info("a.jpg"), make_image(1000));

        let (image, meta) = cache.get("a.jpg").unwrap();
        assert_eq!(image.size_bytes(), 1000);
        assert_eq!(meta.cache_key, "a.jpg");
    }

    #[test]
    fn test_cache_miss() {
        let cache = ImageCache::new(10);
        assert!(cache.get("missing").is_none());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_cache_hit_stats() {
        let cache = ImageCache::new(10);
        cache.add("a.jpg", info("a.jpg"), make_image(100));

        cache.get("a.jpg");
        cache.get("a.jpg");
        cache.get("b.jpg");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.num_images, 1);
        assert_eq!(stats.size_bytes, 100);

        cache.reset_stats();
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_remove() {
        let cache = ImageCache::new(10);
        cache.add("a.jpg", info("a.jpg"), make_image(10));
        cache.remove("a.jpg");
        assert!(!cache.contains("a.jpg"));
    }

    #[test]
    fn test_remove_similar() {
        let cache = ImageCache::new(10);
        cache.add("a.jpg", info("a.jpg"), make_image(10));
        cache.add("a.jpg;10x10", info("a.jpg;10x10"), make_image(10));
        cache.add("b.jpg", info("b.jpg"), make_image(10));

        cache.remove_similar("a.jpg");

        assert!(!cache.contains("a.jpg"));
        assert!(!cache.contains("a.jpg;10x10"));
        assert!(cache.contains("b.jpg"));
    }

    #[test]
    fn test_cache_clear() {
        let cache = ImageCache::new(10);
        cache.add("a.jpg", info("a.jpg"), make_image(100));
        cache.add("b.jpg", info("b.jpg"), make_image(100));

        cache.clear();

        assert!(cache.get("a.jpg").is_none());
        assert_eq!(cache.stats().num_images, 0);
    }
}

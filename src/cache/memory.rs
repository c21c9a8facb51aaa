//! Memory Cache
//!
//! Process-fast tier of the cache: an id -> file path map and a bounded
//! id -> decoded image map, both queried synchronously from any caller.
//! Decoding is delegated to a pluggable decoder; without one installed,
//! image lookups simply miss.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use moka::sync::Cache;

/// Decoded image held by the memory cache. The decoder implementation is
/// external; the engine only stores what it returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Pluggable image decoder.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<ImageData>;
}

/// Two moka maps fronting the local store.
pub struct MemoryCache {
    files: Cache<String, PathBuf>,
    images: Cache<String, Arc<ImageData>>,
    decoder: Mutex<Option<Arc<dyn ImageDecoder>>>,
}

impl MemoryCache {
    pub fn new(file_capacity: u64, image_capacity: u64) -> Self {
        Self {
            files: Cache::builder().max_capacity(file_capacity).build(),
            images: Cache::builder().max_capacity(image_capacity).build(),
            decoder: Mutex::new(None),
        }
    }

    pub fn set_decoder(&self, decoder: Arc<dyn ImageDecoder>) {
        *self.decoder.lock().unwrap() = Some(decoder);
    }

    /// Record where a resource's file landed.
    pub fn set_file(&self, id: &str, path: PathBuf) {
        self.files.insert(id.to_string(), path);
        // a new file invalidates any previously decoded image
        self.images.invalidate(id);
    }

    pub fn remove(&self, id: &str) {
        self.files.invalidate(id);
        self.images.invalidate(id);
    }

    pub fn file_url(&self, id: &str) -> Option<PathBuf> {
        self.files.get(id)
    }

    /// Raw bytes of a cached resource, read through the file map.
    pub fn data(&self, id: &str) -> Option<Vec<u8>> {
        let path = self.files.get(id)?;
        match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::debug!("Memory cache read miss for {} at {:?}: {}", id, path, err);
                None
            }
        }
    }

    /// Decoded image for a cached resource; decoded lazily and kept in the
    /// bounded image map.
    pub fn image(&self, id: &str) -> Option<Arc<ImageData>> {
        if let Some(image) = self.images.get(id) {
            return Some(image);
        }
        let decoder = self.decoder.lock().unwrap().clone()?;
        let bytes = self.data(id)?;
        match decoder.decode(&bytes) {
            Ok(image) => {
                let image = Arc::new(image);
                self.images.insert(id.to_string(), Arc::clone(&image));
                Some(image)
            }
            Err(err) => {
                tracing::warn!("Image decode failed for {}: {}", id, err);
                None
            }
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000, 500)
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("files", &self.files.entry_count())
            .field("images", &self.images.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RawDecoder;

    impl ImageDecoder for RawDecoder {
        fn decode(&self, bytes: &[u8]) -> anyhow::Result<ImageData> {
            Ok(ImageData {
                bytes: bytes.to_vec(),
                width: 1,
                height: 1,
            })
        }
    }

    #[test]
    fn test_file_map_round_trip() {
        let cache = MemoryCache::default();
        cache.set_file("r1", PathBuf::from("/data/resources/r1.bin"));
        assert_eq!(
            cache.file_url("r1"),
            Some(PathBuf::from("/data/resources/r1.bin"))
        );
        cache.remove("r1");
        assert_eq!(cache.file_url("r1"), None);
    }

    #[test]
    fn test_data_reads_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r1.bin");
        std::fs::write(&path, b"bytes").unwrap();

        let cache = MemoryCache::default();
        cache.set_file("r1", path);
        assert_eq!(cache.data("r1"), Some(b"bytes".to_vec()));
        assert_eq!(cache.data("missing"), None);
    }

    #[test]
    fn test_image_requires_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r1.png");
        std::fs::write(&path, b"img").unwrap();

        let cache = MemoryCache::default();
        cache.set_file("r1", path);
        assert!(cache.image("r1").is_none());

        cache.set_decoder(Arc::new(RawDecoder));
        let image = cache.image("r1").unwrap();
        assert_eq!(image.bytes, b"img");
    }

    #[test]
    fn test_new_file_invalidates_decoded_image() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.png");
        let second = dir.path().join("b.png");
        std::fs::write(&first, b"one").unwrap();
        std::fs::write(&second, b"two").unwrap();

        let cache = MemoryCache::default();
        cache.set_decoder(Arc::new(RawDecoder));
        cache.set_file("r1", first);
        assert_eq!(cache.image("r1").unwrap().bytes, b"one");

        cache.set_file("r1", second);
        assert_eq!(cache.image("r1").unwrap().bytes, b"two");
    }
}

//! Bounded cache of static file contents.

use crate::{errors::Error, http::mime, limits::CacheLimits};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::debug;

/// File contents as handed to a [`Response`](crate::Response).
#[derive(Debug, Clone)]
pub enum FileData {
    /// Shared cached buffer; cloning is cheap and never touches the disk.
    Buffered(Bytes),
    /// Too big for the cache, opened again for each response.
    Unbuffered,
}

/// A file resolved through the [`FileCache`].
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub(crate) path: PathBuf,
    pub(crate) data: FileData,
    pub(crate) content_type: &'static str,
    pub(crate) modified: SystemTime,
    pub(crate) size: u64,
}

impl CachedFile {
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn data(&self) -> &FileData {
        &self.data
    }

    #[inline]
    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    #[inline]
    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug, Default)]
struct Entries {
    // Oldest first.
    files: VecDeque<CachedFile>,
    total: u64,
}

/// Static file cache keyed by path.
///
/// - a hit with an unchanged modification time returns the stored buffer
/// - a newer modification time drops the entry and loads the file again
/// - files over the ceiling are never buffered
/// - after an insert the oldest entries go until the total fits
///
/// Lookups are serialized by one lock.
#[derive(Debug)]
pub struct FileCache {
    entries: Mutex<Entries>,
    max_size: u64,
}

impl FileCache {
    pub fn new(limits: &CacheLimits) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            max_size: limits.max_size,
        }
    }

    /// Resolves `path`; blocking, run it off the async workers.
    pub fn get<P: AsRef<Path>>(&self, path: P) -> Result<CachedFile, Error> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound,
            _ => Error::Io(err),
        })?;

        if !metadata.is_file() {
            return Err(Error::NotFound);
        }

        let modified = metadata.modified()?;
        let size = metadata.len();
        let mut entries = self.entries.lock();

        if let Some(index) = entries.files.iter().position(|file| file.path == path) {
            match modified > entries.files[index].modified {
                false => return Ok(entries.files[index].clone()),
                true => {
                    debug!(path = %path.display(), "cached file changed on disk");
                    if let Some(stale) = entries.files.remove(index) {
                        entries.total -= stale.size;
                    }
                }
            }
        }

        let mut file = CachedFile {
            path: path.to_owned(),
            data: FileData::Unbuffered,
            content_type: mime::guess(path),
            modified,
            size,
        };

        if size > self.max_size {
            return Ok(file);
        }

        let content = Bytes::from(fs::read(path)?);
        file.size = content.len() as u64;
        file.data = FileData::Buffered(content);

        entries.total += file.size;
        entries.files.push_back(file.clone());

        while entries.total > self.max_size {
            let Some(oldest) = entries.files.pop_front() else {
                break;
            };
            debug!(path = %oldest.path.display(), "evicted from file cache");
            entries.total -= oldest.size;
        }

        Ok(file)
    }

    /// Number of buffered files.
    pub fn len(&self) -> usize {
        self.entries.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate size of buffered files.
    pub fn total_size(&self) -> u64 {
        self.entries.lock().total
    }

    pub fn contains<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        self.entries.lock().files.iter().any(|file| file.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache(max_size: u64) -> FileCache {
        FileCache::new(&CacheLimits {
            max_size,
            ..CacheLimits::default()
        })
    }

    fn buffer(file: &CachedFile) -> &Bytes {
        match &file.data {
            FileData::Buffered(bytes) => bytes,
            FileData::Unbuffered => panic!("expected a buffered file"),
        }
    }

    #[test]
    fn hit_returns_same_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.html");
        fs::write(&path, "<h1>hi</h1>").unwrap();

        let cache = cache(1024);
        let first = cache.get(&path).unwrap();
        let second = cache.get(&path).unwrap();

        assert_eq!(buffer(&first).as_ptr(), buffer(&second).as_ptr());
        assert_eq!(first.content_type(), "text/html; charset=utf-8");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn newer_mtime_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, "one").unwrap();

        let cache = cache(1024);
        let first = cache.get(&path).unwrap();

        fs::write(&path, "two!").unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(first.modified() + Duration::from_secs(10)).unwrap();

        let second = cache.get(&path).unwrap();
        assert_ne!(buffer(&first).as_ptr(), buffer(&second).as_ptr());
        assert_eq!(buffer(&second).as_ref(), b"two!");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_size(), 4);
    }

    #[test]
    fn oversized_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        fs::write(&path, vec![0u8; 200]).unwrap();

        let cache = cache(100);
        let file = cache.get(&path).unwrap();

        assert!(matches!(file.data(), FileData::Unbuffered));
        assert_eq!(file.size(), 200);
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..3)
            .map(|i| {
                let path = dir.path().join(format!("{i}.bin"));
                fs::write(&path, vec![i as u8; 40]).unwrap();
                path
            })
            .collect();

        let cache = cache(100);
        for path in &paths {
            cache.get(path).unwrap();
        }

        assert!(!cache.contains(&paths[0]));
        assert!(cache.contains(&paths[1]));
        assert!(cache.contains(&paths[2]));
        assert_eq!(cache.total_size(), 80);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(cache(10).get(dir.path().join("nope")), Err(Error::NotFound)));
        assert!(matches!(cache(10).get(dir.path()), Err(Error::NotFound)));
    }
}

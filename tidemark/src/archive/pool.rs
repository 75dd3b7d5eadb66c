//! Bounded pool of open local archive readers.
//!
//! Opening an archive maps the file and parses its header, so readers are
//! kept around between requests. The pool holds at most `max_size` readers
//! in insertion order; an access promotes the entry to most-recent, and an
//! insertion past the bound evicts the least-recent entry, unmapping its
//! file when the last reference drops.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::{ArchiveError, TileArchive};

/// Insertion-ordered map with touch-on-access, least-recent entry first.
///
/// The bound is small enough that a linear scan beats any keyed structure.
struct LruList<T> {
    entries: Vec<(PathBuf, T)>,
    max_size: usize,
}

impl<T> LruList<T> {
    fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_size: max_size.max(1),
        }
    }

    /// Promotes an existing entry to most-recent and returns it.
    fn touch(&mut self, path: &Path) -> Option<&T> {
        let idx = self.entries.iter().position(|(p, _)| p == path)?;
        let entry = self.entries.remove(idx);
        self.entries.push(entry);
        self.entries.last().map(|(_, v)| v)
    }

    /// Inserts a new most-recent entry, returning the evicted one if the
    /// bound was exceeded.
    fn insert(&mut self, path: PathBuf, value: T) -> Option<(PathBuf, T)> {
        self.entries.push((path, value));
        if self.entries.len() > self.max_size {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct ArchivePool {
    inner: Mutex<LruList<Arc<TileArchive>>>,
}

impl ArchivePool {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(LruList::new(max_size)),
        }
    }

    /// Returns the reader for `path`, opening it on first use.
    ///
    /// Access is serialized by the pool lock, including the open itself.
    /// Holding the returned reader across a suspension point is fine; the
    /// underlying archive uses positional reads only.
    pub async fn acquire(&self, path: &Path) -> Result<Arc<TileArchive>, ArchiveError> {
        let mut inner = self.inner.lock().await;

        if let Some(reader) = inner.touch(path) {
            return Ok(Arc::clone(reader));
        }

        let reader = Arc::new(TileArchive::open_local(path).await?);
        if let Some((evicted, _)) = inner.insert(path.to_path_buf(), Arc::clone(&reader)) {
            debug!(path = %evicted.display(), "evicted least-recent archive reader");
        }

        Ok(reader)
    }

    /// Drains the pool, dropping every reader. Called on shutdown.
    pub async fn close_all(&self) {
        self.inner.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(list: &LruList<u32>) -> Vec<&str> {
        list.entries
            .iter()
            .map(|(p, _)| p.to_str().unwrap())
            .collect()
    }

    #[test]
    fn insert_never_exceeds_bound() {
        let mut list = LruList::new(3);
        for i in 0..10u32 {
            list.insert(PathBuf::from(format!("/a/{i}")), i);
        }
        assert_eq!(list.len(), 3);
        assert_eq!(paths(&list), vec!["/a/7", "/a/8", "/a/9"]);
    }

    #[test]
    fn insert_returns_least_recent_on_overflow() {
        let mut list = LruList::new(2);
        assert!(list.insert(PathBuf::from("/a/0"), 0).is_none());
        assert!(list.insert(PathBuf::from("/a/1"), 1).is_none());
        let evicted = list.insert(PathBuf::from("/a/2"), 2).unwrap();
        assert_eq!(evicted.0, PathBuf::from("/a/0"));
    }

    #[test]
    fn touch_promotes_to_most_recent() {
        let mut list = LruList::new(3);
        list.insert(PathBuf::from("/a/0"), 0);
        list.insert(PathBuf::from("/a/1"), 1);
        list.insert(PathBuf::from("/a/2"), 2);

        assert_eq!(list.touch(Path::new("/a/0")), Some(&0));
        let evicted = list.insert(PathBuf::from("/a/3"), 3).unwrap();

        // 1 is now the least-recent, 0 survives.
        assert_eq!(evicted.0, PathBuf::from("/a/1"));
        assert_eq!(paths(&list), vec!["/a/2", "/a/0", "/a/3"]);
    }

    #[test]
    fn touch_missing_returns_none() {
        let mut list: LruList<u32> = LruList::new(3);
        assert!(list.touch(Path::new("/a/0")).is_none());
    }

    #[test]
    fn retains_most_recent_distinct_paths() {
        let mut list = LruList::new(4);
        for i in 0..8u32 {
            let path = PathBuf::from(format!("/a/{}", i % 5));
            if list.touch(&path).is_none() {
                list.insert(path, i);
            }
        }
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn clear_drains_everything() {
        let mut list = LruList::new(3);
        list.insert(PathBuf::from("/a/0"), 0);
        list.insert(PathBuf::from("/a/1"), 1);
        list.clear();
        assert_eq!(list.len(), 0);
    }
}

//! Size-bounded on-disk LRU of fully downloaded file payloads.
//!
//! Each cached remote file lives at `<cache_root>/<16-hex xxh64(path)>`.
//! The manager tracks `(local path → byte size)` in recency order and
//! keeps the running sum under `max_size` by unlinking least-recently used
//! entries after every `put`. Downloads land under a `.tmpfile` suffix and
//! are renamed into place before `put` is called, so every entry always
//! refers to a complete file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use lru::LruCache;
use parking_lot::Mutex;
use xxhash_rust::xxh64::xxh64;

/// Suffix of in-flight downloads.
pub const TMP_SUFFIX: &str = "tmpfile";
/// Suffix of pre-lock markers. Never created by this implementation but
/// tolerated (and skipped) during the startup scan.
pub const LOCK_SUFFIX: &str = "lock";

struct State {
    size: u64,
    entries: LruCache<PathBuf, u64>,
}

pub struct DiskCache {
    root: PathBuf,
    max_size: u64,
    state: Mutex<State>,
}

impl DiskCache {
    /// Open the cache directory, creating it if missing, and adopt every
    /// non-transient file already present. The adopted total may exceed
    /// `max_size`; the next `put` evicts down to the cap.
    pub fn new(root: impl Into<PathBuf>, max_size: u64) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut entries = LruCache::unbounded();
        let mut size = 0;
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(&format!(".{TMP_SUFFIX}")) || name.ends_with(&format!(".{LOCK_SUFFIX}")) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            size += meta.len();
            entries.put(entry.path(), meta.len());
        }
        debug!("disk cache: adopted {} entries, {} bytes", entries.len(), size);
        Ok(Self {
            root,
            max_size,
            state: Mutex::new(State { size, entries }),
        })
    }

    /// Local cache path for a remote path. Pure; touches no state.
    pub fn cache_file(&self, remote_path: &str) -> PathBuf {
        self.root.join(format!("{:016x}", xxh64(remote_path.as_bytes(), 0)))
    }

    /// Sibling name a download streams into before the atomic rename.
    pub fn tmp_file(key: &Path) -> PathBuf {
        let mut name = key.as_os_str().to_owned();
        name.push(".");
        name.push(TMP_SUFFIX);
        PathBuf::from(name)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn contains(&self, key: &Path) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Promote an entry to most-recently used, if present.
    pub fn renew(&self, key: &Path) {
        self.state.lock().entries.promote(key);
    }

    /// Account for `key` after its on-disk contents reached their final
    /// state, then evict least-recently used entries until the size cap
    /// holds again. Files are unlinked outside the internal lock.
    pub fn put(&self, key: &Path) -> io::Result<()> {
        let new_size = fs::metadata(key)?.len();
        let mut evicted = Vec::new();
        {
            let mut st = self.state.lock();
            if let Some(old) = st.entries.pop(key) {
                st.size -= old;
            }
            st.size += new_size;
            st.entries.put(key.to_path_buf(), new_size);
            while st.size > self.max_size {
                match st.entries.pop_lru() {
                    Some((path, size)) => {
                        st.size -= size;
                        evicted.push(path);
                    }
                    None => break,
                }
            }
        }
        for path in evicted {
            debug!("disk cache: evict {}", path.display());
            unlink_quiet(&path);
        }
        Ok(())
    }

    /// Drop the entry and its file. Succeeds silently when absent.
    pub fn pop(&self, key: &Path) {
        {
            let mut st = self.state.lock();
            if let Some(size) = st.entries.pop(key) {
                st.size -= size;
            }
        }
        unlink_quiet(key);
    }

    /// Flush everything (admin surface).
    pub fn clear(&self) {
        let drained: Vec<PathBuf> = {
            let mut st = self.state.lock();
            st.size = 0;
            let mut keys = Vec::with_capacity(st.entries.len());
            while let Some((path, _)) = st.entries.pop_lru() {
                keys.push(path);
            }
            keys
        };
        for path in drained {
            unlink_quiet(&path);
        }
    }
}

fn unlink_quiet(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("unlink {} failed: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, name: &str, size: usize) -> PathBuf {
        let path = root.join(name);
        fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn cache_file_is_hex_hash_of_remote_path() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), 1024).unwrap();
        let a = cache.cache_file("/data/a");
        let b = cache.cache_file("/data/b");
        assert_ne!(a, b);
        assert_eq!(a, cache.cache_file("/data/a"));
        let name = a.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 16);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn put_accounts_and_reput_replaces_old_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), 1024).unwrap();
        let f = touch(dir.path(), "aaaa", 10);
        cache.put(&f).unwrap();
        assert_eq!(cache.size(), 10);
        fs::write(&f, vec![0u8; 25]).unwrap();
        cache.put(&f).unwrap();
        assert_eq!(cache.size(), 25);
    }

    #[test]
    fn eviction_follows_recency_and_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), 11).unwrap();
        let a = touch(dir.path(), "a", 6);
        let b = touch(dir.path(), "b", 3);
        let c = touch(dir.path(), "c", 1);
        for f in [&a, &b, &c] {
            cache.put(f).unwrap();
        }
        // A read of `a` promotes it; `b` is now least-recently used.
        cache.renew(&a);
        let d = touch(dir.path(), "d", 4);
        cache.put(&d).unwrap();
        assert!(!cache.contains(&b));
        assert!(!b.exists());
        for f in [&a, &c, &d] {
            assert!(cache.contains(f));
            assert!(f.exists());
        }
        assert_eq!(cache.size(), 11);
        assert!(cache.size() <= cache.max_size());
    }

    #[test]
    fn oversized_put_evicts_down_to_cap() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), 10).unwrap();
        let small = touch(dir.path(), "small", 4);
        cache.put(&small).unwrap();
        let big = touch(dir.path(), "big", 9);
        cache.put(&big).unwrap();
        assert!(!cache.contains(&small));
        assert!(!small.exists());
        assert_eq!(cache.size(), 9);
    }

    #[test]
    fn startup_scan_adopts_files_and_skips_transients() {
        let dir = tempfile::tempdir().unwrap();
        let kept = touch(dir.path(), "00d3adb33f000000", 7);
        touch(dir.path(), "00d3adb33f000001.tmpfile", 100);
        touch(dir.path(), "00d3adb33f000002.lock", 0);
        let cache = DiskCache::new(dir.path(), 1024).unwrap();
        assert_eq!(cache.size(), 7);
        assert!(cache.contains(&kept));
    }

    #[test]
    fn pop_is_idempotent_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), 1024).unwrap();
        let f = touch(dir.path(), "f", 3);
        cache.put(&f).unwrap();
        cache.pop(&f);
        assert!(!f.exists());
        assert_eq!(cache.size(), 0);
        cache.pop(&f);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn clear_empties_directory_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), 1024).unwrap();
        let a = touch(dir.path(), "a", 3);
        let b = touch(dir.path(), "b", 5);
        cache.put(&a).unwrap();
        cache.put(&b).unwrap();
        cache.clear();
        assert_eq!(cache.size(), 0);
        assert!(!a.exists() && !b.exists());
    }

    #[test]
    fn tmp_file_appends_suffix() {
        let key = PathBuf::from("/cache/0011223344556677");
        assert_eq!(
            DiskCache::tmp_file(&key),
            PathBuf::from("/cache/0011223344556677.tmpfile")
        );
    }
}

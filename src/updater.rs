//! Periodic cache-freshness sweep.
//!
//! A dedicated thread with its own SFTP session re-checks every cached
//! attribute and directory listing against the server. Drifted files are
//! dropped from the disk cache and refetched in the background; drifted
//! listings are replaced in place. This is cooperative coherence: changes
//! made behind the mount's back become visible within one period plus a
//! download, no sooner.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::cache::meta::AttrEntry;
use crate::fs::{Shared, transfer};
use crate::sftp::{RemoteAttr, SftpSession, local_md5};

pub struct CacheUpdater {
    shared: Arc<Shared>,
    period: Duration,
    running: Arc<AtomicBool>,
}

/// Held by `main`; stops and joins the updater thread at unmount.
pub struct UpdaterHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl UpdaterHandle {
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("updater thread panicked");
            }
        }
    }
}

impl CacheUpdater {
    pub fn spawn(shared: Arc<Shared>, period: Duration) -> UpdaterHandle {
        let running = Arc::new(AtomicBool::new(true));
        let updater = CacheUpdater {
            shared,
            period,
            running: running.clone(),
        };
        let thread = thread::Builder::new()
            .name("sftpfs-updater".to_string())
            .spawn(move || updater.run())
            .ok();
        if thread.is_none() {
            warn!("failed to spawn the cache updater");
        }
        UpdaterHandle { running, thread }
    }

    fn run(self) {
        let sftp = match SftpSession::connect(&self.shared.ssh) {
            Ok(sftp) => sftp,
            Err(e) => {
                // The mount still works, just without freshness checks.
                error!("cache updater could not connect: {e}");
                return;
            }
        };
        info!("cache updater running, period {:?}", self.period);
        while self.running.load(Ordering::Relaxed) {
            self.update_attributes(&sftp);
            self.update_directories(&sftp);
            self.sleep();
        }
    }

    /// Sleep one period in one-second ticks so shutdown stays responsive.
    fn sleep(&self) {
        for _ in 0..self.period.as_secs().max(1) {
            if !self.running.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }

    fn update_attributes(&self, sftp: &SftpSession) {
        for (path, cached) in self.shared.attributes.snapshot() {
            if !self.running.load(Ordering::Relaxed) {
                return;
            }
            // A pending write-back means the local copy is the newer one.
            if self.shared.writeback.is_dirty(&path) {
                debug!("updater: {path} has write-backs in flight, skip");
                continue;
            }
            let Some(guard) = self.shared.locks.try_lock(&path) else {
                continue;
            };
            let remote = match sftp.lstat(&path) {
                Ok(st) => AttrEntry::Present(RemoteAttr::from(&st)),
                Err(e) => {
                    debug!("updater: lstat {path}: {e}");
                    AttrEntry::Missing
                }
            };
            if remote == cached {
                continue;
            }
            let cache = self.shared.disk.cache_file(&path);
            let mut refetch = false;
            match (cached, remote) {
                (AttrEntry::Present(c), _) if c.is_dir() => {
                    self.shared.attributes.put(path.clone(), remote);
                }
                (AttrEntry::Missing, _) | (_, AttrEntry::Missing) => {
                    self.shared.disk.pop(&cache);
                    self.shared.attributes.put(path.clone(), remote);
                }
                (AttrEntry::Present(_), AttrEntry::Present(r)) => {
                    let skip =
                        should_skip_resync(&cache, r.size, || md5_matches(sftp, &path, &cache));
                    self.shared.attributes.put(path.clone(), remote);
                    if !skip {
                        info!("updater: {path} drifted, refetching");
                        self.shared.disk.pop(&cache);
                        refetch = true;
                    }
                }
            }
            // Release the path before enqueueing, or the worker's own
            // try_lock could lose the race and skip the refetch.
            drop(guard);
            if refetch {
                transfer::submit_getfile(&self.shared, &path);
            }
        }
    }

    fn update_directories(&self, sftp: &SftpSession) {
        for (path, cached) in self.shared.directories.snapshot() {
            if !self.running.load(Ordering::Relaxed) {
                return;
            }
            match sftp.readdir(&path) {
                Ok(entries) => {
                    if listings_differ(&cached, &entries) {
                        info!("updater: directory {path} changed");
                        self.shared.directories.put(path, entries);
                    }
                }
                Err(e) => debug!("updater: readdir {path}: {e}"),
            }
        }
    }
}

/// Decide whether an attribute drift warrants refetching the payload.
///
/// Nothing cached means nothing to refetch. Otherwise the content is kept
/// only when the cached file's size equals the remote size and the MD5s
/// agree — a pure metadata change (owner, mode, times) then keeps the
/// cached bytes.
fn should_skip_resync(cache: &Path, remote_size: u64, md5_match: impl FnOnce() -> bool) -> bool {
    match cache.metadata() {
        Err(_) => true,
        Ok(meta) => meta.len() == remote_size && md5_match(),
    }
}

fn md5_matches(sftp: &SftpSession, path: &str, cache: &Path) -> bool {
    let local = match local_md5(cache) {
        Ok(digest) => digest,
        Err(e) => {
            debug!("updater: local md5 {}: {e}", cache.display());
            return false;
        }
    };
    match sftp.remote_md5(path) {
        Ok(Some(remote)) => local == remote,
        Ok(None) => false,
        Err(e) => {
            debug!("updater: remote md5 {path}: {e}");
            false
        }
    }
}

/// Order-insensitive listing comparison.
fn listings_differ(a: &[String], b: &[String]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a != b
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn absent_cache_file_always_skips() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(should_skip_resync(&missing, 42, || panic!("md5 must not run")));
    }

    #[test]
    fn size_mismatch_never_consults_md5() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"abc").unwrap();
        assert!(!should_skip_resync(&file, 5, || panic!("md5 must not run")));
    }

    #[test]
    fn equal_sizes_defer_to_md5() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"abc").unwrap();
        assert!(should_skip_resync(&file, 3, || true));
        assert!(!should_skip_resync(&file, 3, || false));
    }

    #[test]
    fn listing_comparison_ignores_order() {
        let a = vec!["b".to_string(), "a".to_string()];
        let b = vec!["a".to_string(), "b".to_string()];
        assert!(!listings_differ(&a, &b));
        let c = vec!["a".to_string()];
        assert!(listings_differ(&a, &c));
    }
}

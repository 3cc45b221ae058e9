//! Background transfer tasks and write-back bookkeeping.
//!
//! Three task kinds run on the executor pool, all steered by the xxh64 of
//! the remote path so that same-path tasks keep their submission order:
//!
//! - `getfile`: download a whole remote file into the disk cache,
//! - `write back`: replay one locally written range against the remote,
//! - `truncate`: replay a local truncate against the remote.
//!
//! Task failures are logged by the pool and surface to nobody; the caller
//! already saw success against the local cache, and the updater repairs
//! divergence on its next sweep.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use parking_lot::Mutex;

use super::Shared;
use crate::cache::disk::DiskCache;
use crate::sftp::{SftpError, SftpSession};
use crate::task::{Task, WorkerCtx};

/// Counts write-backs in flight per remote path.
///
/// While a path has pending write-backs its cached copy is newer than the
/// remote, so the staleness updater must not "repair" it backwards. The
/// count goes up when `write`/`truncate` enqueue their task and down when
/// the task finishes, successfully or not.
#[derive(Default)]
pub struct WritebackTracker {
    pending: Mutex<HashMap<String, u32>>,
}

impl WritebackTracker {
    pub fn begin(&self, path: &str) {
        *self.pending.lock().entry(path.to_string()).or_insert(0) += 1;
    }

    pub fn finish(&self, path: &str) {
        let mut pending = self.pending.lock();
        if let Some(count) = pending.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                pending.remove(path);
            }
        }
    }

    pub fn is_dirty(&self, path: &str) -> bool {
        self.pending.lock().contains_key(path)
    }
}

/// Enqueue a whole-file download for `remote` unless one is already
/// running or the file is already cached.
pub fn submit_getfile(shared: &Arc<Shared>, remote: &str) {
    let task_shared = Arc::clone(shared);
    let remote = remote.to_string();
    let key = Shared::task_key(&remote);
    shared.tasks.submit(Task::new(key, move |ctx| {
        getfile(ctx, &task_shared, &remote)
    }));
}

fn getfile(ctx: &mut WorkerCtx, shared: &Shared, remote: &str) -> Result<(), SftpError> {
    // Whoever holds the path lock is already handling this file.
    let Some(_guard) = shared.locks.try_lock(remote) else {
        debug!("getfile {remote}: lock busy, skip");
        return Ok(());
    };
    let cache = shared.disk.cache_file(remote);
    if cache.exists() {
        debug!("getfile {remote}: already cached, skip");
        return Ok(());
    }
    let sftp = ctx.sftp()?;
    let size = sftp.lstat(remote)?.size.unwrap_or(0);
    if size > shared.disk.max_size() {
        // Uncacheable; reads keep falling through to passthrough.
        info!("getfile {remote}: {size} bytes exceeds the cache cap, skip");
        return Ok(());
    }
    let tmp = DiskCache::tmp_file(&cache);
    match download_into(sftp, remote, &tmp, &cache) {
        Ok(n) => {
            shared.disk.put(&cache)?;
            debug!("getfile {remote}: cached {n} bytes");
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn download_into(
    sftp: &SftpSession,
    remote: &str,
    tmp: &std::path::Path,
    cache: &std::path::Path,
) -> Result<u64, SftpError> {
    let n = sftp.download(remote, tmp)?;
    // The cache key only ever names a complete file.
    fs::rename(tmp, cache)?;
    Ok(n)
}

/// Enqueue the remote replay of a written range.
pub fn submit_write_back(shared: &Arc<Shared>, remote: &str, data: Bytes, offset: u64) {
    shared.writeback.begin(remote);
    let task_shared = Arc::clone(shared);
    let remote = remote.to_string();
    let key = Shared::task_key(&remote);
    shared.tasks.submit(Task::new(key, move |ctx| {
        let result = ctx
            .sftp()
            .and_then(|sftp| sftp.write_at(&remote, offset, &data));
        task_shared.writeback.finish(&remote);
        result
    }));
}

/// Enqueue the remote replay of a truncate.
pub fn submit_truncate(shared: &Arc<Shared>, remote: &str, size: u64) {
    shared.writeback.begin(remote);
    let task_shared = Arc::clone(shared);
    let remote = remote.to_string();
    let key = Shared::task_key(&remote);
    shared.tasks.submit(Task::new(key, move |ctx| {
        let result = ctx.sftp().and_then(|sftp| sftp.truncate(&remote, size));
        task_shared.writeback.finish(&remote);
        result
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts_nested_writebacks() {
        let tracker = WritebackTracker::default();
        assert!(!tracker.is_dirty("/a"));
        tracker.begin("/a");
        tracker.begin("/a");
        tracker.finish("/a");
        assert!(tracker.is_dirty("/a"));
        tracker.finish("/a");
        assert!(!tracker.is_dirty("/a"));
    }

    #[test]
    fn tracker_finish_without_begin_is_harmless() {
        let tracker = WritebackTracker::default();
        tracker.finish("/never");
        assert!(!tracker.is_dirty("/never"));
    }
}

//! Write-side operations: positional `write` and `truncate`.
//!
//! Both mutate the cached copy under the path lock, refresh the attribute
//! cache from the local file, and hand the remote replay to the task pool.
//! The caller gets its answer as soon as the cache is updated.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use bytes::Bytes;

use super::attr;
use super::prelude::*;
use crate::lock::PathGuard;

pub(super) fn write(fs: &mut SftpFs, ino: u64, offset: i64, data: &[u8], reply: ReplyWrite) {
    let Some(rel) = fs.rel_of(ino) else {
        reply.error(ENOENT);
        return;
    };
    if offset < 0 {
        reply.error(EINVAL);
        return;
    }
    let remote = fs.shared.remote_path(&rel);
    match write_path(fs, &remote, data, offset as u64) {
        Ok(n) => reply.written(n),
        Err(e) => reply.error(e),
    }
}

/// Make sure the cache file exists before a local mutation, holding the
/// path lock across the check.
///
/// An empty remote file is materialized locally without a transfer. A
/// non-empty one is fetched by submitting a `getfile` task and waiting for
/// its worker to drain — the lock must be released around the wait because
/// the task takes it itself. Returns the re-acquired guard.
fn ensure_cached<'fs>(
    fs: &'fs SftpFs,
    remote: &str,
    cache: &Path,
    guard: PathGuard<'fs>,
) -> Result<PathGuard<'fs>, c_int> {
    if cache.exists() {
        return Ok(guard);
    }
    let current = attr::lookup_attr(&fs.sftp, &fs.shared, remote)?;
    if current.size == 0 {
        File::create(cache).map_err(|e| {
            warn!("create {}: {e}", cache.display());
            EIO
        })?;
        return Ok(guard);
    }
    drop(guard);
    // Two attempts: the first can lose the path lock to a concurrent
    // updater sweep, making the fetch skip itself.
    for attempt in 0..2 {
        transfer::submit_getfile(&fs.shared, remote);
        fs.shared.tasks.wait(Shared::task_key(remote));
        let guard = fs.shared.locks.lock(remote);
        if cache.exists() {
            return Ok(guard);
        }
        drop(guard);
        debug!("write {remote}: cache still cold after fetch attempt {attempt}");
    }
    // Fetch failed or the file exceeds the cache cap.
    warn!("write {remote}: could not populate the cache");
    Err(EIO)
}

fn write_path(fs: &mut SftpFs, remote: &str, data: &[u8], offset: u64) -> Result<u32, c_int> {
    let cache = fs.shared.disk.cache_file(remote);
    let guard = fs.shared.locks.lock(remote);
    let guard = ensure_cached(fs, remote, &cache, guard)?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cache)
        .map_err(|e| {
            warn!("open {}: {e}", cache.display());
            EIO
        })?;
    file.seek(SeekFrom::Start(offset)).map_err(|_| EIO)?;
    file.write_all(data).map_err(|e| {
        warn!("write {}: {e}", cache.display());
        EIO
    })?;
    drop(file);

    if let Ok(meta) = cache.metadata() {
        fs.shared
            .attributes
            .put(remote, AttrEntry::Present(RemoteAttr::from_local(&meta)));
    }
    drop(guard);

    transfer::submit_write_back(&fs.shared, remote, Bytes::copy_from_slice(data), offset);
    if let Err(e) = fs.shared.disk.put(&cache) {
        warn!("disk cache accounting for {remote}: {e}");
    }
    Ok(data.len() as u32)
}

/// Shared by `setattr(size)` — same protocol as `write`, with a local
/// `set_len` in the middle.
pub(super) fn truncate_path(fs: &mut SftpFs, remote: &str, size: u64) -> Result<(), c_int> {
    debug!("truncate {remote} to {size}");
    let cache = fs.shared.disk.cache_file(remote);
    let guard = fs.shared.locks.lock(remote);
    let guard = ensure_cached(fs, remote, &cache, guard)?;

    let file = OpenOptions::new().write(true).open(&cache).map_err(|_| EIO)?;
    file.set_len(size).map_err(|e| {
        warn!("truncate {}: {e}", cache.display());
        EIO
    })?;
    drop(file);

    if let Ok(meta) = cache.metadata() {
        fs.shared
            .attributes
            .put(remote, AttrEntry::Present(RemoteAttr::from_local(&meta)));
    }
    drop(guard);

    transfer::submit_truncate(&fs.shared, remote, size);
    if let Err(e) = fs.shared.disk.put(&cache) {
        warn!("disk cache accounting for {remote}: {e}");
    }
    Ok(())
}

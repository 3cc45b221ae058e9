//! Creation operations: `create`, `mkdir`, `symlink`.

use std::fs::File;
use std::path::Path;

use super::attr;
use super::prelude::*;

/// Create an empty file: an empty cache copy locally, an empty file
/// remotely, then invalidate the attribute entry (which may hold a
/// negative-lookup sentinel) and the parent listing.
pub(super) fn create(fs: &mut SftpFs, parent: u64, name: &OsStr, mode: u32, reply: ReplyCreate) {
    let Some(parent_rel) = fs.rel_of(parent) else {
        reply.error(ENOENT);
        return;
    };
    let Some(name) = name.to_str() else {
        reply.error(ENOENT);
        return;
    };
    let rel = child_rel(&parent_rel, name);
    let remote = fs.shared.remote_path(&rel);
    info!("create {remote}, mode {mode:o} left to the server default");

    let cache = fs.shared.disk.cache_file(&remote);
    {
        let _guard = fs.shared.locks.lock(&remote);
        if let Err(e) = File::create(&cache) {
            warn!("create {}: {e}", cache.display());
            reply.error(EIO);
            return;
        }
    }
    if let Err(e) = fs.sftp.create_empty(&remote) {
        reply.error(errno(&e));
        return;
    }
    if let Err(e) = fs.shared.disk.put(&cache) {
        warn!("disk cache accounting for {remote}: {e}");
    }
    fs.shared.attributes.remove(&remote);
    fs.shared.directories.remove(&parent_of(&remote));

    match attr::lookup_attr(&fs.sftp, &fs.shared, &remote) {
        Ok(a) => {
            let ino = fs.inodes.ino_for(&rel);
            reply.created(&TTL, &attr::to_file_attr(ino, &a), 0, 0, 0);
        }
        Err(e) => reply.error(e),
    }
}

pub(super) fn mkdir(fs: &mut SftpFs, parent: u64, name: &OsStr, mode: u32, reply: ReplyEntry) {
    let Some(parent_rel) = fs.rel_of(parent) else {
        reply.error(ENOENT);
        return;
    };
    let Some(name) = name.to_str() else {
        reply.error(ENOENT);
        return;
    };
    let rel = child_rel(&parent_rel, name);
    let remote = fs.shared.remote_path(&rel);
    info!("mkdir {remote}");
    if let Err(e) = fs.sftp.mkdir(&remote, mode) {
        reply.error(errno(&e));
        return;
    }
    fs.shared.attributes.remove(&remote);
    fs.shared.directories.remove(&parent_of(&remote));

    match attr::lookup_attr(&fs.sftp, &fs.shared, &remote) {
        Ok(a) => {
            let ino = fs.inodes.ino_for(&rel);
            reply.entry(&TTL, &attr::to_file_attr(ino, &a), 0);
        }
        Err(e) => reply.error(e),
    }
}

/// `ln -s link parent/name`. The link target is stored verbatim; only the
/// new symlink's own path is ours to normalize.
pub(super) fn symlink(fs: &mut SftpFs, parent: u64, name: &OsStr, link: &Path, reply: ReplyEntry) {
    let Some(parent_rel) = fs.rel_of(parent) else {
        reply.error(ENOENT);
        return;
    };
    let Some(name) = name.to_str() else {
        reply.error(ENOENT);
        return;
    };
    let rel = child_rel(&parent_rel, name);
    let remote = fs.shared.remote_path(&rel);
    let source = link.to_string_lossy();
    info!("symlink {remote} -> {source}");
    if let Err(e) = fs.sftp.symlink(&source, &remote) {
        reply.error(errno(&e));
        return;
    }
    fs.shared.attributes.remove(&remote);
    fs.shared.directories.remove(&parent_of(&remote));

    match attr::lookup_attr(&fs.sftp, &fs.shared, &remote) {
        Ok(a) => {
            let ino = fs.inodes.ino_for(&rel);
            reply.entry(&TTL, &attr::to_file_attr(ino, &a), 0);
        }
        Err(e) => reply.error(e),
    }
}

//! Read-side operations: `lookup`, `readdir`, `read`, `readlink`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::attr;
use super::prelude::*;

/// Resolve a child by name. Goes through the attribute cache, so repeated
/// lookups of a missing name are answered by the negative sentinel without
/// touching the server.
pub(super) fn lookup(fs: &mut SftpFs, parent: u64, name: &OsStr, reply: ReplyEntry) {
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
    match attr::lookup_attr(&fs.sftp, &fs.shared, &remote) {
        Ok(a) => {
            let ino = fs.inodes.ino_for(&rel);
            reply.entry(&TTL, &attr::to_file_attr(ino, &a), 0);
        }
        Err(e) => reply.error(e),
    }
}

/// List a directory from the cache, fetching and caching the remote
/// listing on a miss. `.` and `..` are prepended for the kernel.
pub(super) fn readdir(fs: &mut SftpFs, ino: u64, offset: i64, mut reply: ReplyDirectory) {
    let Some(rel) = fs.rel_of(ino) else {
        reply.error(ENOENT);
        return;
    };
    let remote = fs.shared.remote_path(&rel);
    let names = match fs.shared.directories.get(&remote) {
        Some(names) => names,
        None => match fs.sftp.readdir(&remote) {
            Ok(names) => {
                debug!("sftp readdir {remote}: {} entries", names.len());
                fs.shared.directories.put(remote.clone(), names.clone());
                names
            }
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        },
    };

    let parent_ino = if ino == ROOT_INO {
        ROOT_INO
    } else {
        let parent_rel = rel.rsplit_once('/').map_or("", |(p, _)| p);
        fs.inodes.ino_for(parent_rel)
    };
    let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(names.len() + 2);
    entries.push((ino, FileType::Directory, ".".to_string()));
    entries.push((parent_ino, FileType::Directory, "..".to_string()));
    for name in names {
        let crel = child_rel(&rel, &name);
        let cremote = fs.shared.remote_path(&crel);
        let cino = fs.inodes.ino_for(&crel);
        // Best-effort type from already-cached attributes; the kernel
        // stats through lookup before it trusts this anyway.
        let kind = match fs.shared.attributes.get(&cremote) {
            Some(AttrEntry::Present(a)) => attr::to_file_attr(cino, &a).kind,
            _ => FileType::RegularFile,
        };
        entries.push((cino, kind, name));
    }

    for (i, (eino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
        if reply.add(eino, (i + 1) as i64, kind, &name) {
            break;
        }
    }
    reply.ok();
}

/// Read the requested range out of a complete cache file. Offsets at or
/// past the end yield an empty buffer.
fn read_cached_range(cache: &Path, offset: u64, size: u32) -> io::Result<Vec<u8>> {
    let mut file = File::open(cache)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(size as usize);
    file.take(u64::from(size)).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Serve a read.
///
/// Cached and idle: read the range locally. Otherwise fall back to a
/// synchronous passthrough read on the foreground session, and — unless a
/// transfer already holds the path lock — enqueue a background `getfile`
/// so the next read is local. The read itself never waits for a download.
pub(super) fn read(fs: &mut SftpFs, ino: u64, offset: i64, size: u32, reply: ReplyData) {
    let Some(rel) = fs.rel_of(ino) else {
        reply.error(ENOENT);
        return;
    };
    let remote = fs.shared.remote_path(&rel);
    let offset = offset.max(0) as u64;
    let cache = fs.shared.disk.cache_file(&remote);
    fs.shared.disk.renew(&cache);

    match fs.shared.locks.try_lock(&remote) {
        Some(guard) => {
            if cache.exists() {
                match read_cached_range(&cache, offset, size) {
                    Ok(data) => {
                        drop(guard);
                        reply.data(&data);
                        return;
                    }
                    Err(e) => warn!("cached read {remote}: {e}"),
                }
            }
            drop(guard);
            // Not cached yet: warm it in the background.
            transfer::submit_getfile(&fs.shared, &remote);
        }
        // A transfer owns the path; don't pile a second one on.
        None => debug!("read {remote}: transfer in progress, passthrough"),
    }

    match fs.sftp.read_range(&remote, offset, size) {
        Ok(data) => reply.data(&data),
        Err(e) => reply.error(errno(&e)),
    }
}

/// Symlink targets are not cached; always ask the server.
pub(super) fn readlink(fs: &mut SftpFs, ino: u64, reply: ReplyData) {
    let Some(rel) = fs.rel_of(ino) else {
        reply.error(ENOENT);
        return;
    };
    let remote = fs.shared.remote_path(&rel);
    match fs.sftp.readlink(&remote) {
        Ok(target) => reply.data(target.as_os_str().as_bytes()),
        Err(e) => reply.error(errno(&e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_range_reads_follow_the_file_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"0123456789").unwrap();
        assert_eq!(read_cached_range(&path, 0, 4).unwrap(), b"0123");
        assert_eq!(read_cached_range(&path, 8, 100).unwrap(), b"89");
        // At and past the end: empty, matching the underlying file.
        assert_eq!(read_cached_range(&path, 10, 4).unwrap(), b"");
        assert_eq!(read_cached_range(&path, 50, 4).unwrap(), b"");
    }
}

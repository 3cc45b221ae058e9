//! Attribute operations: `getattr` and the `setattr` family.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::prelude::*;
use crate::sftp::SftpSession;

/// Attribute lookup through the cache.
///
/// A cached `Missing` sentinel fails immediately with `ENOENT` without a
/// round trip; a miss does one foreground `lstat` and caches whichever way
/// it went.
pub(super) fn lookup_attr(
    sftp: &SftpSession,
    shared: &Shared,
    remote: &str,
) -> Result<RemoteAttr, c_int> {
    match shared.attributes.get(remote) {
        Some(AttrEntry::Present(attr)) => return Ok(attr),
        Some(AttrEntry::Missing) => return Err(ENOENT),
        None => {}
    }
    debug!("sftp lstat {remote}");
    match sftp.lstat(remote) {
        Ok(st) => {
            let attr = RemoteAttr::from(&st);
            shared.attributes.put(remote, AttrEntry::Present(attr));
            Ok(attr)
        }
        Err(e) => {
            debug!("lstat {remote}: {e}");
            shared.attributes.put(remote, AttrEntry::Missing);
            Err(ENOENT)
        }
    }
}

fn kind_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn epoch(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Build the kernel-facing record. Whole-second times only.
pub(super) fn to_file_attr(ino: u64, a: &RemoteAttr) -> FileAttr {
    let kind = kind_of(a.mode);
    FileAttr {
        ino,
        size: a.size,
        blocks: a.size.div_ceil(512),
        atime: epoch(a.atime),
        mtime: epoch(a.mtime),
        ctime: epoch(a.mtime),
        crtime: epoch(a.mtime),
        kind,
        perm: (a.mode & 0o7777) as u16,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid: a.uid,
        gid: a.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

pub(super) fn getattr(fs: &mut SftpFs, ino: u64, reply: ReplyAttr) {
    let Some(rel) = fs.rel_of(ino) else {
        reply.error(ENOENT);
        return;
    };
    let remote = fs.shared.remote_path(&rel);
    match lookup_attr(&fs.sftp, &fs.shared, &remote) {
        Ok(attr) => reply.attr(&TTL, &to_file_attr(ino, &attr)),
        Err(e) => reply.error(e),
    }
}

fn time_secs(t: TimeOrNow) -> u64 {
    let at = match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    };
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `setattr` multiplexes chmod, chown, truncate and utimens. Apply each
/// requested change against the server, invalidate, and reply with the
/// resulting attributes.
#[allow(clippy::too_many_arguments)]
pub(super) fn setattr(
    fs: &mut SftpFs,
    ino: u64,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
    reply: ReplyAttr,
) {
    let Some(rel) = fs.rel_of(ino) else {
        reply.error(ENOENT);
        return;
    };
    let remote = fs.shared.remote_path(&rel);

    if let Some(mode) = mode {
        debug!("chmod {remote} mode {mode:o}");
        if let Err(e) = fs.sftp.chmod(&remote, mode) {
            reply.error(errno(&e));
            return;
        }
        fs.shared.attributes.remove(&remote);
    }

    if uid.is_some() || gid.is_some() {
        // SFTP sets owner and group together; fill the missing half from
        // the current attributes.
        let current = match lookup_attr(&fs.sftp, &fs.shared, &remote) {
            Ok(a) => a,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let (uid, gid) = (uid.unwrap_or(current.uid), gid.unwrap_or(current.gid));
        debug!("chown {remote} {uid}:{gid}");
        if let Err(e) = fs.sftp.chown(&remote, uid, gid) {
            reply.error(errno(&e));
            return;
        }
        fs.shared.attributes.remove(&remote);
    }

    if let Some(size) = size {
        if let Err(e) = super::write::truncate_path(fs, &remote, size) {
            reply.error(e);
            return;
        }
    }

    if atime.is_some() || mtime.is_some() {
        let current = match lookup_attr(&fs.sftp, &fs.shared, &remote) {
            Ok(a) => a,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let at = atime.map(time_secs).unwrap_or(current.atime);
        let mt = mtime.map(time_secs).unwrap_or(current.mtime);
        debug!("utimens {remote}");
        if let Err(e) = fs.sftp.utime(&remote, at, mt) {
            reply.error(errno(&e));
            return;
        }
        fs.shared.attributes.remove(&remote);
    }

    match lookup_attr(&fs.sftp, &fs.shared, &remote) {
        Ok(attr) => reply.attr(&TTL, &to_file_attr(ino, &attr)),
        Err(e) => reply.error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_the_format_bits() {
        assert_eq!(kind_of(libc::S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(kind_of(libc::S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(kind_of(libc::S_IFREG | 0o644), FileType::RegularFile);
        assert_eq!(kind_of(0), FileType::RegularFile);
    }

    #[test]
    fn file_attr_carries_perm_size_and_times() {
        let a = RemoteAttr {
            atime: 100,
            mtime: 200,
            mode: libc::S_IFREG | 0o640,
            uid: 1000,
            gid: 100,
            size: 1025,
        };
        let fa = to_file_attr(9, &a);
        assert_eq!(fa.ino, 9);
        assert_eq!(fa.perm, 0o640);
        assert_eq!(fa.size, 1025);
        assert_eq!(fa.blocks, 3);
        assert_eq!(fa.mtime, UNIX_EPOCH + Duration::from_secs(200));
        assert_eq!(fa.kind, FileType::RegularFile);
    }

    #[test]
    fn time_secs_resolves_specific_times() {
        let t = UNIX_EPOCH + Duration::from_secs(1234);
        assert_eq!(time_secs(TimeOrNow::SpecificTime(t)), 1234);
    }
}

//! Root of the FUSE filesystem implementation.
//!
//! [`SftpFs`] owns the foreground SFTP session and the inode table, and
//! shares the caches, lock table and task pool with the updater and the
//! admin surface through [`Shared`]. The `impl Filesystem` block is the
//! dispatcher: every kernel callback is forwarded to the matching
//! sub-module (`attr`, `read`, `write`, `create`, `delete`, `rename`).
//!
//! All core state is keyed by the normalized remote path; inodes exist
//! only at this boundary because the kernel speaks inodes while SFTP
//! speaks paths.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use log::info;
use xxhash_rust::xxh64::xxh64;

use crate::cache::disk::DiskCache;
use crate::cache::meta::{AttrEntry, MetaCache};
use crate::config::Config;
use crate::lock::PathLocks;
use crate::sftp::{SftpSession, SshConfig};
use crate::task::TaskExecutorService;

pub mod prelude;

mod attr;
mod create;
mod delete;
mod read;
mod rename;
pub mod transfer;
mod write;

pub use transfer::WritebackTracker;

/// TTL handed to the kernel for attribute/entry caches. Short, because
/// the real caching happens on our side where it can be invalidated.
pub const TTL: Duration = Duration::from_secs(1);

pub const ROOT_INO: u64 = 1;

/// Everything the background threads (task pool, updater, admin surface)
/// share with the filesystem: internally synchronized, path-keyed state.
pub struct Shared {
    pub remote_root: String,
    pub ssh: SshConfig,
    pub locks: PathLocks,
    pub attributes: MetaCache<AttrEntry>,
    pub directories: MetaCache<Vec<String>>,
    pub disk: DiskCache,
    pub tasks: TaskExecutorService,
    pub writeback: WritebackTracker,
}

impl Shared {
    pub fn new(cfg: &Config, ssh: SshConfig) -> io::Result<Self> {
        Ok(Self {
            remote_root: normalize(&cfg.remote_root),
            locks: PathLocks::default(),
            attributes: MetaCache::new(),
            directories: MetaCache::new(),
            disk: DiskCache::new(&cfg.cache_path, cfg.max_disk_size)?,
            tasks: TaskExecutorService::new(cfg.parallel, ssh.clone()),
            writeback: WritebackTracker::default(),
            ssh,
        })
    }

    /// Normalized remote path for a mount-relative one.
    pub fn remote_path(&self, rel: &str) -> String {
        join_remote(&self.remote_root, rel)
    }

    /// Steering key for the task pool: same path, same worker, same order.
    pub fn task_key(path: &str) -> u64 {
        xxh64(path.as_bytes(), 0)
    }
}

/// Collapse duplicate separators and resolve `.`/`..` in an absolute
/// remote path. Never escapes the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            comp => parts.push(comp),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

pub fn join_remote(root: &str, rel: &str) -> String {
    normalize(&format!("{root}/{rel}"))
}

/// Parent directory of a normalized remote path ("/" is its own parent).
pub fn parent_of(remote: &str) -> String {
    match remote.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

/// Mount-relative child path; the root is the empty string.
pub fn child_rel(parent_rel: &str, name: &str) -> String {
    if parent_rel.is_empty() {
        name.to_string()
    } else {
        format!("{parent_rel}/{name}")
    }
}

/// Bidirectional inode ↔ mount-relative path table. The kernel addresses
/// everything by inode; the core is path-keyed, so the adapter assigns an
/// inode the first time a path is observed and keeps it stable until the
/// path is unlinked or renamed away.
pub struct InodeTable {
    inode_to_path: HashMap<u64, String>,
    path_to_inode: HashMap<String, u64>,
    next_inode: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            inode_to_path: HashMap::new(),
            path_to_inode: HashMap::new(),
            next_inode: ROOT_INO + 1,
        };
        table.inode_to_path.insert(ROOT_INO, String::new());
        table.path_to_inode.insert(String::new(), ROOT_INO);
        table
    }

    pub fn path_of(&self, ino: u64) -> Option<&str> {
        self.inode_to_path.get(&ino).map(String::as_str)
    }

    /// Existing inode for the path, or a freshly assigned one.
    pub fn ino_for(&mut self, rel: &str) -> u64 {
        if let Some(&ino) = self.path_to_inode.get(rel) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.inode_to_path.insert(ino, rel.to_string());
        self.path_to_inode.insert(rel.to_string(), ino);
        ino
    }

    pub fn remove(&mut self, rel: &str) {
        if let Some(ino) = self.path_to_inode.remove(rel) {
            self.inode_to_path.remove(&ino);
        }
    }

    /// Keep the inode across a rename so open handles stay valid.
    pub fn rename(&mut self, old_rel: &str, new_rel: &str) {
        self.remove(new_rel);
        if let Some(ino) = self.path_to_inode.remove(old_rel) {
            self.inode_to_path.insert(ino, new_rel.to_string());
            self.path_to_inode.insert(new_rel.to_string(), ino);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The mounted filesystem: foreground session plus shared core state.
pub struct SftpFs {
    pub(crate) sftp: SftpSession,
    pub(crate) shared: Arc<Shared>,
    pub(crate) inodes: InodeTable,
}

impl SftpFs {
    pub fn new(sftp: SftpSession, shared: Arc<Shared>) -> Self {
        Self {
            sftp,
            shared,
            inodes: InodeTable::new(),
        }
    }

    /// Mount-relative path for an inode, or `None` when the kernel asks
    /// about something we never handed out.
    pub(crate) fn rel_of(&self, ino: u64) -> Option<String> {
        self.inodes.path_of(ino).map(str::to_string)
    }
}

impl Filesystem for SftpFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        read::lookup(self, parent, name, reply);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        attr::getattr(self, ino, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        attr::setattr(self, ino, mode, uid, gid, size, atime, mtime, reply);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        read::readlink(self, ino, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        create::mkdir(self, parent, name, mode, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        delete::unlink(self, parent, name, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        delete::rmdir(self, parent, name, reply);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        create::symlink(self, parent, name, link, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        rename::rename(self, parent, name, newparent, newname, reply);
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // No file-handle table: every read/write resolves through the path.
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        read::read(self, ino, offset, size, reply);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        write::write(self, ino, offset, data, reply);
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        read::readdir(self, ino, offset, reply);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        create::create(self, parent, name, mode, reply);
    }

    fn destroy(&mut self) {
        info!("unmounting: draining task pool");
        self.shared.tasks.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_and_resolves() {
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("/data//a/./b/"), "/data/a/b");
        assert_eq!(normalize("/data/a/../b"), "/data/b");
        assert_eq!(normalize("/../.."), "/");
    }

    #[test]
    fn join_remote_anchors_at_root() {
        assert_eq!(join_remote("/srv", ""), "/srv");
        assert_eq!(join_remote("/srv", "a/b"), "/srv/a/b");
        assert_eq!(join_remote("/", "a"), "/a");
    }

    #[test]
    fn parent_of_remote_paths() {
        assert_eq!(parent_of("/srv/a/b"), "/srv/a");
        assert_eq!(parent_of("/srv"), "/");
        assert_eq!(parent_of("/"), "/");
    }

    #[test]
    fn child_rel_treats_root_as_empty() {
        assert_eq!(child_rel("", "a"), "a");
        assert_eq!(child_rel("a", "b"), "a/b");
    }

    #[test]
    fn inode_table_round_trip() {
        let mut table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO), Some(""));
        let ino = table.ino_for("a/b");
        assert_eq!(table.ino_for("a/b"), ino);
        assert_eq!(table.path_of(ino), Some("a/b"));
        table.rename("a/b", "a/c");
        assert_eq!(table.path_of(ino), Some("a/c"));
        assert_eq!(table.ino_for("a/c"), ino);
        table.remove("a/c");
        assert_eq!(table.path_of(ino), None);
        assert_ne!(table.ino_for("a/c"), ino);
    }
}

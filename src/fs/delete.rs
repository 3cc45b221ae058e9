//! Removal operations: `unlink`, `rmdir`.

use super::prelude::*;

pub(super) fn unlink(fs: &mut SftpFs, parent: u64, name: &OsStr, reply: ReplyEmpty) {
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
    info!("unlink {remote}");

    fs.shared.disk.pop(&fs.shared.disk.cache_file(&remote));
    if let Err(e) = fs.sftp.unlink(&remote) {
        reply.error(errno(&e));
        return;
    }
    fs.shared.attributes.remove(&remote);
    fs.shared.directories.remove(&parent_of(&remote));
    fs.inodes.remove(&rel);
    reply.ok();
}

pub(super) fn rmdir(fs: &mut SftpFs, parent: u64, name: &OsStr, reply: ReplyEmpty) {
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
    info!("rmdir {remote}");

    if let Err(e) = fs.sftp.rmdir(&remote) {
        reply.error(errno(&e));
        return;
    }
    fs.shared.attributes.remove(&remote);
    fs.shared.directories.remove(&remote);
    fs.shared.directories.remove(&parent_of(&remote));
    fs.inodes.remove(&rel);
    reply.ok();
}

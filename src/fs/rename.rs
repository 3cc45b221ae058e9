//! `rename`, ordered after the old path's pending write-backs.

use super::prelude::*;

pub(super) fn rename(
    fs: &mut SftpFs,
    parent: u64,
    name: &OsStr,
    newparent: u64,
    newname: &OsStr,
    reply: ReplyEmpty,
) {
    let (Some(parent_rel), Some(newparent_rel)) = (fs.rel_of(parent), fs.rel_of(newparent))
    else {
        reply.error(ENOENT);
        return;
    };
    let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
        reply.error(ENOENT);
        return;
    };
    let old_rel = child_rel(&parent_rel, name);
    let new_rel = child_rel(&newparent_rel, newname);
    let old_remote = fs.shared.remote_path(&old_rel);
    let new_remote = fs.shared.remote_path(&new_rel);
    info!("rename {old_remote} -> {new_remote}");

    // A pending write-back must reach the server before the path moves
    // out from under it.
    fs.shared.tasks.wait(Shared::task_key(&old_remote));

    // Best-effort cleanup of an existing target; the server-side rename
    // below is what actually has to succeed.
    if fs.sftp.lstat(&new_remote).is_ok() {
        if let Err(e) = fs.sftp.unlink(&new_remote) {
            debug!("rename: unlink target {new_remote}: {e}");
        }
    }

    fs.shared.disk.pop(&fs.shared.disk.cache_file(&old_remote));
    fs.shared.disk.pop(&fs.shared.disk.cache_file(&new_remote));

    if let Err(e) = fs.sftp.rename(&old_remote, &new_remote) {
        reply.error(errno(&e));
        return;
    }

    fs.shared.attributes.remove(&old_remote);
    fs.shared.attributes.remove(&new_remote);
    fs.shared.directories.remove(&old_remote);
    fs.shared.directories.remove(&new_remote);
    fs.shared.directories.remove(&parent_of(&old_remote));
    fs.shared.directories.remove(&parent_of(&new_remote));
    fs.inodes.rename(&old_rel, &new_rel);
    reply.ok();
}

//! Blocking SSH/SFTP session layer.
//!
//! Every thread that talks to the server owns its own [`SftpSession`]: the
//! foreground filesystem thread, each task-pool worker, and the cache
//! updater. An SFTP channel serializes its requests, so sharing one session
//! across threads would serialize all background transfers behind each
//! other. [`SshConfig`] carries everything needed to open another session
//! without a TTY, including the secret resolved at mount time.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use libc::{EACCES, EEXIST, EIO, ENOENT, c_int};
use md5::{Digest, Md5};
use ssh2::{ErrorCode, FileStat, OpenFlags, OpenType, Session, Sftp};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SftpError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("authentication failed for {0}")]
    AuthFailed(String),
    #[error("key file not found: {0}")]
    KeyNotFound(PathBuf),
}

/// Translate a transport error into the errno reported to the kernel.
pub fn errno(err: &SftpError) -> c_int {
    match err {
        SftpError::Io(e) if e.kind() == io::ErrorKind::NotFound => ENOENT,
        SftpError::Io(_) => EIO,
        SftpError::Ssh(e) => match e.code() {
            // libssh2 SFTP status codes: 2 = no such file, 10 = no such path
            ErrorCode::SFTP(2) | ErrorCode::SFTP(10) => ENOENT,
            ErrorCode::SFTP(3) => EACCES,
            ErrorCode::SFTP(11) => EEXIST,
            _ => EIO,
        },
        SftpError::AuthFailed(_) => EACCES,
        SftpError::KeyNotFound(_) => EIO,
    }
}

/// Connection parameters shared by every session this process opens.
#[derive(Clone, Debug)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Password, either given up front or prompted at mount time.
    pub password: Option<String>,
    /// Explicit identity file (`--ssh-key`).
    pub key_file: Option<PathBuf>,
    /// Passphrase for `key_file`, prompted at mount time when needed.
    pub passphrase: Option<String>,
}

impl SshConfig {
    fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// The attribute record kept in the metadata cache and reported to the
/// kernel. Times are whole seconds since the epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteAttr {
    pub atime: u64,
    pub mtime: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

impl RemoteAttr {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Extract attributes from a local cache file, used after `write` and
    /// `truncate` mutate the cached copy.
    pub fn from_local(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            atime: meta.atime().max(0) as u64,
            mtime: meta.mtime().max(0) as u64,
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
        }
    }
}

impl From<&FileStat> for RemoteAttr {
    fn from(st: &FileStat) -> Self {
        Self {
            atime: st.atime.unwrap_or(0),
            mtime: st.mtime.unwrap_or(0),
            mode: st.perm.unwrap_or(0),
            uid: st.uid.unwrap_or(0),
            gid: st.gid.unwrap_or(0),
            size: st.size.unwrap_or(0),
        }
    }
}

/// An authenticated SSH session with its SFTP subsystem open.
///
/// The `Session` must outlive the `Sftp` handle, so both live here and the
/// connection closes when the pair drops.
pub struct SftpSession {
    sess: Session,
    sftp: Sftp,
}

impl SftpSession {
    /// Open and authenticate a session without prompting. Fails with
    /// `AuthFailed` when none of the configured mechanisms succeed.
    pub fn connect(cfg: &SshConfig) -> Result<Self, SftpError> {
        let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port))?;
        let mut sess = Session::new()?;
        sess.set_tcp_stream(tcp);
        sess.handshake()?;
        authenticate(&sess, cfg)?;
        if !sess.authenticated() {
            return Err(SftpError::AuthFailed(cfg.endpoint()));
        }
        let sftp = sess.sftp()?;
        Ok(Self { sess, sftp })
    }

    pub fn lstat(&self, path: &str) -> Result<FileStat, SftpError> {
        Ok(self.sftp.lstat(Path::new(path))?)
    }

    /// Child names of a remote directory, without `.`/`..`.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, SftpError> {
        let entries = self.sftp.readdir(Path::new(path))?;
        Ok(entries
            .iter()
            .filter_map(|(p, _)| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect())
    }

    /// Stream a remote file into `local`, returning the byte count.
    pub fn download(&self, remote: &str, local: &Path) -> Result<u64, SftpError> {
        let mut src = self.sftp.open(Path::new(remote))?;
        let mut dst = fs::File::create(local)?;
        let n = io::copy(&mut src, &mut dst)?;
        Ok(n)
    }

    /// Read `size` bytes at `offset` directly from the remote file. Reads
    /// past the end of the file return the available bytes, possibly none.
    pub fn read_range(&self, remote: &str, offset: u64, size: u32) -> Result<Vec<u8>, SftpError> {
        let mut file = self.sftp.open(Path::new(remote))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(size as usize);
        file.take(u64::from(size)).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Replay one written range against the remote copy.
    pub fn write_at(&self, remote: &str, offset: u64, data: &[u8]) -> Result<(), SftpError> {
        let mut file = self.sftp.open_mode(
            Path::new(remote),
            OpenFlags::READ | OpenFlags::WRITE,
            0o644,
            OpenType::File,
        )?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Create (or truncate) an empty remote file.
    pub fn create_empty(&self, remote: &str) -> Result<(), SftpError> {
        self.sftp.create(Path::new(remote))?;
        Ok(())
    }

    pub fn truncate(&self, remote: &str, size: u64) -> Result<(), SftpError> {
        self.setstat(remote, FileStat { size: Some(size), ..EMPTY_STAT })
    }

    pub fn chmod(&self, remote: &str, mode: u32) -> Result<(), SftpError> {
        self.setstat(remote, FileStat { perm: Some(mode), ..EMPTY_STAT })
    }

    pub fn chown(&self, remote: &str, uid: u32, gid: u32) -> Result<(), SftpError> {
        self.setstat(
            remote,
            FileStat { uid: Some(uid), gid: Some(gid), ..EMPTY_STAT },
        )
    }

    pub fn utime(&self, remote: &str, atime: u64, mtime: u64) -> Result<(), SftpError> {
        self.setstat(
            remote,
            FileStat { atime: Some(atime), mtime: Some(mtime), ..EMPTY_STAT },
        )
    }

    fn setstat(&self, remote: &str, stat: FileStat) -> Result<(), SftpError> {
        Ok(self.sftp.setstat(Path::new(remote), stat)?)
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<(), SftpError> {
        Ok(self.sftp.rename(Path::new(old), Path::new(new), None)?)
    }

    pub fn unlink(&self, remote: &str) -> Result<(), SftpError> {
        Ok(self.sftp.unlink(Path::new(remote))?)
    }

    pub fn mkdir(&self, remote: &str, mode: u32) -> Result<(), SftpError> {
        Ok(self.sftp.mkdir(Path::new(remote), mode as i32)?)
    }

    pub fn rmdir(&self, remote: &str) -> Result<(), SftpError> {
        Ok(self.sftp.rmdir(Path::new(remote))?)
    }

    /// `ln -s source dest`: create a symlink at `dest` pointing at `source`.
    pub fn symlink(&self, source: &str, dest: &str) -> Result<(), SftpError> {
        Ok(self.sftp.symlink(Path::new(source), Path::new(dest))?)
    }

    pub fn readlink(&self, remote: &str) -> Result<PathBuf, SftpError> {
        Ok(self.sftp.readlink(Path::new(remote))?)
    }

    /// MD5 of the remote file, computed server-side over the exec channel.
    /// Returns `None` when `md5sum` is unavailable or exits non-zero.
    pub fn remote_md5(&self, remote: &str) -> Result<Option<String>, SftpError> {
        let mut channel = self.sess.channel_session()?;
        channel.exec(&format!("md5sum {}", shell_quote(remote)))?;
        let mut out = String::new();
        channel.read_to_string(&mut out)?;
        let _ = channel.wait_close();
        if channel.exit_status()? != 0 {
            return Ok(None);
        }
        Ok(out.split_whitespace().next().map(str::to_owned))
    }
}

const EMPTY_STAT: FileStat = FileStat {
    size: None,
    uid: None,
    gid: None,
    perm: None,
    atime: None,
    mtime: None,
};

fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

fn authenticate(sess: &Session, cfg: &SshConfig) -> Result<(), SftpError> {
    if let Some(key) = &cfg.key_file {
        if !key.exists() {
            return Err(SftpError::KeyNotFound(key.clone()));
        }
        sess.userauth_pubkey_file(&cfg.user, None, key, cfg.passphrase.as_deref())
            .map_err(|_| SftpError::AuthFailed(cfg.endpoint()))?;
        return Ok(());
    }
    if let Some(pw) = &cfg.password {
        return sess
            .userauth_password(&cfg.user, pw)
            .map_err(|_| SftpError::AuthFailed(cfg.endpoint()));
    }
    // No secret configured: agent first, then the usual identity files.
    if sess.userauth_agent(&cfg.user).is_ok() {
        return Ok(());
    }
    if let Some(home) = dirs::home_dir() {
        for name in ["id_ed25519", "id_rsa"] {
            let key = home.join(".ssh").join(name);
            if key.exists() && sess.userauth_pubkey_file(&cfg.user, None, &key, None).is_ok() {
                return Ok(());
            }
        }
    }
    Err(SftpError::AuthFailed(cfg.endpoint()))
}

/// Mount-time connect. On an authentication failure, prompt once for the
/// missing secret, remember it in `cfg` for the background sessions, and
/// retry. Any further failure is fatal to the mount.
pub fn connect_interactive(cfg: &mut SshConfig) -> Result<SftpSession, SftpError> {
    match SftpSession::connect(cfg) {
        Ok(session) => Ok(session),
        Err(SftpError::AuthFailed(_)) => {
            if let Some(key) = &cfg.key_file {
                let prompt = format!("Enter passphrase for key '{}': ", key.display());
                cfg.passphrase = Some(rpassword::prompt_password(prompt)?);
            } else {
                let prompt = format!("{}@{}'s password: ", cfg.user, cfg.host);
                cfg.password = Some(rpassword::prompt_password(prompt)?);
            }
            SftpSession::connect(cfg)
        }
        Err(e) => Err(e),
    }
}

/// MD5 of a local cache file, the local half of the skip-resync check.
pub fn local_md5(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote("/tmp/plain"), "'/tmp/plain'");
        assert_eq!(shell_quote("/tmp/o'brien"), r"'/tmp/o'\''brien'");
    }

    #[test]
    fn local_md5_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        fs::write(&path, b"hello world").unwrap();
        // md5("hello world")
        assert_eq!(local_md5(&path).unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn remote_attr_from_local_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"12345").unwrap();
        let attr = RemoteAttr::from_local(&fs::metadata(&path).unwrap());
        assert_eq!(attr.size, 5);
        assert!(!attr.is_dir());
        let dattr = RemoteAttr::from_local(&fs::metadata(dir.path()).unwrap());
        assert!(dattr.is_dir());
    }
}

//! Command-line surface and the typed runtime configuration built from it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, ensure};
use clap::Parser;

use crate::sftp::SshConfig;

#[derive(Parser, Debug)]
#[command(name = "sftpfs", version, about = "Mount a remote directory over SFTP with a local write-behind cache")]
pub struct Args {
    /// ssh destination, e.g. deploy@build-host
    #[arg(short = 's', long)]
    pub host: String,

    /// local mount point
    #[arg(short, long)]
    pub mount_point: PathBuf,

    /// directory holding the cached file payloads
    #[arg(short, long)]
    pub cache_path: PathBuf,

    /// remote directory to project
    #[arg(short, long, default_value = "/")]
    pub remote_path: String,

    /// ssh port
    #[arg(long, default_value_t = 22)]
    pub ssh_port: u16,

    /// identity file for public-key authentication
    #[arg(long)]
    pub ssh_key: Option<PathBuf>,

    /// seconds between cache freshness sweeps
    #[arg(long, default_value_t = 30)]
    pub cache_timeout: u64,

    /// background transfer workers [default: 4 x CPUs]
    #[arg(long)]
    pub parallel: Option<usize>,

    /// keep cached entries fresh with the background updater
    #[arg(long)]
    pub auto_cache: bool,

    /// disk cache size cap, in MiB
    #[arg(long, default_value_t = 1024)]
    pub cache_size: u64,

    /// admin api port on 127.0.0.1
    #[arg(short = 'p', long, default_value_t = 10010)]
    pub api_port: u16,

    /// run in the background
    #[arg(short, long)]
    pub daemon: bool,

    /// log file [default with --daemon: /tmp/sftpfs.log]
    #[arg(short, long)]
    pub logging: Option<PathBuf>,

    /// verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

pub struct Config {
    pub ssh: SshConfig,
    pub mount_point: PathBuf,
    pub cache_path: PathBuf,
    pub remote_root: String,
    pub cache_timeout: Duration,
    pub parallel: usize,
    pub auto_cache: bool,
    pub max_disk_size: u64,
    pub api_port: u16,
    pub daemon: bool,
    pub logging: Option<PathBuf>,
    pub verbose: bool,
}

impl Config {
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let (user, host) = args
            .host
            .split_once('@')
            .context("--host must look like user@host")?;
        ensure!(!user.is_empty() && !host.is_empty(), "--host must look like user@host");
        let mut logging = args.logging;
        if args.daemon && logging.is_none() {
            logging = Some(PathBuf::from("/tmp/sftpfs.log"));
        }
        Ok(Self {
            ssh: SshConfig {
                host: host.to_string(),
                port: args.ssh_port,
                user: user.to_string(),
                password: None,
                key_file: args.ssh_key,
                passphrase: None,
            },
            mount_point: args.mount_point,
            cache_path: args.cache_path,
            remote_root: args.remote_path,
            cache_timeout: Duration::from_secs(args.cache_timeout.max(1)),
            parallel: args.parallel.unwrap_or_else(|| 4 * num_cpus::get()),
            auto_cache: args.auto_cache,
            max_disk_size: args.cache_size << 20,
            api_port: args.api_port,
            daemon: args.daemon,
            logging,
            verbose: args.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(host: &str, extra: &[&str]) -> Args {
        let mut argv = vec!["sftpfs", "-s", host, "-m", "/mnt/r", "-c", "/tmp/cache"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn required_flags_build_a_config() {
        let cfg = Config::from_args(parse("deploy@example", &[])).unwrap();
        assert_eq!(cfg.ssh.user, "deploy");
        assert_eq!(cfg.ssh.host, "example");
        assert_eq!(cfg.ssh.port, 22);
        assert_eq!(cfg.remote_root, "/");
        assert_eq!(cfg.cache_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_disk_size, 1024 << 20);
        assert!(!cfg.auto_cache);
        assert!(cfg.logging.is_none());
    }

    #[test]
    fn host_without_user_is_rejected() {
        assert!(Config::from_args(parse("example", &[])).is_err());
        assert!(Config::from_args(parse("@example", &[])).is_err());
    }

    #[test]
    fn daemon_mode_defaults_the_log_file() {
        let cfg = Config::from_args(parse("deploy@example", &["-d"])).unwrap();
        assert_eq!(cfg.logging, Some(PathBuf::from("/tmp/sftpfs.log")));
    }

    #[test]
    fn missing_required_flags_fail_to_parse() {
        assert!(Args::try_parse_from(["sftpfs", "-s", "a@b"]).is_err());
    }
}

//! Mount entry point: CLI parsing, logging, authentication, optional
//! daemonization, then hand the filesystem to the FUSE session loop.

mod admin;
mod cache;
mod config;
mod fs;
mod lock;
mod sftp;
mod task;
mod updater;

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use daemonize::Daemonize;
use fuser::MountOption;
use log::info;

use crate::config::{Args, Config};
use crate::fs::{SftpFs, Shared};
use crate::sftp::SftpSession;
use crate::updater::CacheUpdater;

fn main() -> anyhow::Result<()> {
    let cfg = Config::from_args(Args::parse())?;
    init_logging(&cfg)?;

    // Authenticate before anything forks, so prompts and failures reach
    // the terminal. The resolved secret stays in `ssh` for the background
    // sessions.
    let mut ssh = cfg.ssh.clone();
    let session = if cfg.daemon {
        drop(sftp::connect_interactive(&mut ssh).context("authentication failed")?);
        let cwd = std::env::current_dir().context("cannot resolve the working directory")?;
        Daemonize::new()
            .working_directory(cwd)
            .start()
            .context("failed to daemonize")?;
        SftpSession::connect(&ssh).context("reconnect after daemonizing failed")?
    } else {
        sftp::connect_interactive(&mut ssh).context("authentication failed")?
    };
    info!("connected to {}@{}:{}", ssh.user, ssh.host, ssh.port);

    let shared = Arc::new(Shared::new(&cfg, ssh).context("cannot open the cache directory")?);
    info!("disk cache holds {} bytes from earlier runs", shared.disk.size());
    admin::spawn(shared.clone(), cfg.api_port);
    let updater = cfg
        .auto_cache
        .then(|| CacheUpdater::spawn(shared.clone(), cfg.cache_timeout));

    let filesystem = SftpFs::new(session, shared.clone());
    let options = [
        MountOption::FSName(format!("sftpfs-{}", cfg.ssh.host)),
        MountOption::AutoUnmount,
        MountOption::AllowOther,
    ];
    info!(
        "mounting {}:{} at {}",
        cfg.ssh.host,
        cfg.remote_root,
        cfg.mount_point.display()
    );
    let mounted = fuser::mount2(filesystem, &cfg.mount_point, &options);

    if let Some(updater) = updater {
        updater.shutdown();
    }
    // Already drained on a clean unmount; harmless then.
    shared.tasks.shutdown();
    mounted.context("mount failed")
}

fn init_logging(cfg: &Config) -> anyhow::Result<()> {
    let level = if cfg.verbose { "debug" } else { "warn" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if let Some(path) = &cfg.logging {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

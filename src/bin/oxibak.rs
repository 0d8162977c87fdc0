// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use oxibak::{
    backup::{Archiver, BackupError, BackupJob, Identity},
    compose::{ComposeDumpJob, ComposeDumper, ComposeError},
    config::Settings,
    exec::{mount_check, ExecError, SystemRunner},
    inbox::{reconcile, InboxLayout},
    path::default_config_path,
    retention::{RetentionManager, RetentionPolicy},
    volume::{DiskUsage, LocalVolume, Volume, GIB},
    wrapper::{run_with_hooks, HookedJob},
};

use anyhow::{anyhow, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "oxibak [options] <oxibak-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file to use instead of the default one.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let settings = match self.config {
            Some(path) => Settings::load(path, true)?,
            None => Settings::load(default_config_path()?, false)?,
        };

        match self.command {
            Command::Backup(opts) => run_backup(opts, settings),
            Command::Clean(opts) => run_clean(opts, settings),
            Command::Inbox(opts) => run_inbox(opts, settings),
            Command::ComposeDump(opts) => run_compose_dump(opts, settings),
            Command::Wrap(opts) => run_wrap(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Mirror source tree and pack it into timestamped archive.
    #[command(override_usage = "oxibak backup [options] <src> <dst>")]
    Backup(BackupOptions),

    /// Delete old archives by keep count or free space reservation.
    #[command(override_usage = "oxibak clean [options] <dir>")]
    Clean(CleanOptions),

    /// Move completed uploads from inbox into repository.
    #[command(override_usage = "oxibak inbox [options] [<dir>]")]
    Inbox(InboxOptions),

    /// Dump databases of Docker Compose projects.
    #[command(override_usage = "oxibak compose-dump [options]")]
    ComposeDump(ComposeDumpOptions),

    /// Run command with success and failure hooks.
    #[command(override_usage = "oxibak wrap [options] --cmd <command>")]
    Wrap(WrapOptions),
}

#[derive(Args, Clone, Debug)]
struct RetentionOptions {
    /// Keep this many newest archives and delete the others.
    #[arg(long, value_name = "count")]
    pub keep_count: Option<usize>,

    /// Delete old archives until this much space is free, in GiB.
    #[arg(long, value_name = "gib")]
    pub reserved_size: Option<u64>,
}

impl RetentionOptions {
    fn resolve(&self, settings: &Settings) -> (Option<usize>, Option<u64>) {
        let keep_count = self.keep_count.or(settings.retention.keep_count);
        let reserved = self
            .reserved_size
            .or(settings.retention.reserved_gib)
            .map(|gib| gib.saturating_mul(GIB));

        (keep_count, reserved)
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct BackupOptions {
    /// Backup source root.
    #[arg(value_name = "src")]
    pub src: PathBuf,

    /// Backup destination root.
    #[arg(value_name = "dst")]
    pub dst: PathBuf,

    /// Extra text put into archive name.
    #[arg(long, value_name = "tag")]
    pub tag: Option<String>,

    /// Check that this path is a mountpoint before doing anything.
    #[arg(long, value_name = "path")]
    pub mount_check: Option<PathBuf>,

    #[command(flatten)]
    pub retention: RetentionOptions,

    /// File listing rsync exclusion patterns, may be repeated.
    #[arg(long, value_name = "path")]
    pub exclude_from: Vec<PathBuf>,

    /// Database dump command.
    #[arg(long, value_name = "program")]
    pub dump_command: Option<String>,

    /// Name of database to dump alongside files.
    #[arg(long, value_name = "name")]
    pub db: Option<String>,

    /// Only simulate, nothing is deleted or archived.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CleanOptions {
    /// Directory holding archives.
    #[arg(value_name = "dir")]
    pub dir: PathBuf,

    /// Glob pattern selecting archives, defaults to configured extension.
    #[arg(long, value_name = "glob")]
    pub pattern: Option<String>,

    #[command(flatten)]
    pub retention: RetentionOptions,

    /// Only show what would be deleted.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InboxOptions {
    /// Backup root holding inbox and repository.
    #[arg(value_name = "dir")]
    pub dir: Option<PathBuf>,

    /// Check that this path is a mountpoint before doing anything.
    #[arg(long, value_name = "path")]
    pub mount_check: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ComposeDumpOptions {
    /// Mountpoint of backup volume.
    #[arg(long, env = "BKUP_MP", value_name = "path")]
    pub mount_point: Option<PathBuf>,

    /// Number of newest archives to keep.
    #[arg(long, env = "KEEP_COUNT", value_name = "count")]
    pub keep_count: Option<usize>,

    /// Compose projects to dump, separated by spaces.
    #[arg(long, env = "PROJS", value_name = "names", value_delimiter = ' ')]
    pub projects: Vec<String>,

    /// Compose service running the database.
    #[arg(long, value_name = "name")]
    pub service: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct WrapOptions {
    /// Command line to execute.
    #[arg(long, value_name = "command")]
    pub cmd: String,

    /// Command line to execute when command succeeds.
    #[arg(long, value_name = "command")]
    pub ok: Option<String>,

    /// Command line to execute when command fails.
    #[arg(long, value_name = "command")]
    pub fail: Option<String>,

    /// Exit with failure of command instead of absorbing it.
    #[arg(long)]
    pub propagate: bool,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(inherited_exit_code(&error).unwrap_or(1));
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn inherited_exit_code(error: &anyhow::Error) -> Option<i32> {
    let exec = if let Some(err) = error.downcast_ref::<ExecError>() {
        err
    } else if let Some(BackupError::Exec(err)) = error.downcast_ref::<BackupError>() {
        err
    } else if let Some(ComposeError::Exec(err)) = error.downcast_ref::<ComposeError>() {
        err
    } else {
        return None;
    };

    // INVARIANT: Never report success for a failure.
    exec.exit_code().filter(|code| *code != 0)
}

fn run_backup(opts: BackupOptions, settings: Settings) -> Result<()> {
    let (keep_count, reserved_bytes) = opts.retention.resolve(&settings);
    let backup = settings.backup;
    let job = BackupJob {
        src: opts.src,
        dst: opts.dst,
        tag: opts.tag.or(backup.tag),
        mount_check: opts.mount_check.or(backup.mount_check),
        keep_count,
        reserved_bytes,
        exclude_from: if opts.exclude_from.is_empty() {
            backup.exclude_from
        } else {
            opts.exclude_from
        },
        dump_command: opts.dump_command.unwrap_or(backup.dump_command),
        database: opts.db,
        archive_ext: backup.archive_ext,
        dry_run: opts.dry_run,
    }
    .resolve_paths()?;

    let identity = Identity::detect()?;
    let now = Local::now().naive_local();
    Archiver::new(SystemRunner::new(), LocalVolume::new()).run(&job, &identity, now)?;
    info!("OK!");

    Ok(())
}

fn run_clean(opts: CleanOptions, settings: Settings) -> Result<()> {
    let (keep_count, reserved_bytes) = opts.retention.resolve(&settings);
    let pattern = opts
        .pattern
        .unwrap_or_else(|| format!("*.{}", settings.backup.archive_ext));

    let mut policies = Vec::new();
    if let Some(keep) = keep_count {
        policies.push(RetentionPolicy::KeepCount(keep));
    }
    if let Some(bytes) = reserved_bytes {
        policies.push(RetentionPolicy::ReserveFreeSpace(bytes));
    }
    if policies.is_empty() {
        warn!("no retention policy given, nothing to do");
    }

    let report = RetentionManager::new(LocalVolume::new())
        .with_dry_run(opts.dry_run)
        .apply(&opts.dir, &pattern, policies)?;
    info!("deleted {} file(s)", report.deleted.len());
    info!("OK!");

    Ok(())
}

fn run_inbox(opts: InboxOptions, settings: Settings) -> Result<()> {
    let root = opts
        .dir
        .or(settings.inbox.root)
        .ok_or_else(|| anyhow!("no backup root given on command line or in configuration"))?;
    if let Some(path) = opts.mount_check.or(settings.inbox.mount_check) {
        mount_check(&SystemRunner::new(), path)?;
    }

    // INVARIANT: Directories must exist before volume statistics are queried.
    let layout = InboxLayout::new(&root);
    layout.prepare()?;

    let usage = LocalVolume::new().disk_usage(&root)?;
    info!("DIR: {}", root.display());
    info!(
        "{:.0} used, {:.0} free / {:.0} total GiB",
        DiskUsage::as_gib(usage.used),
        DiskUsage::as_gib(usage.free),
        DiskUsage::as_gib(usage.total)
    );
    info!("INBOX: {}", layout.inbox.display());
    info!("REPO : {}", layout.repo.display());

    let report = reconcile(&layout.inbox, &layout.repo, Local::now().naive_local())?;
    for path in &report.stuck {
        warn!("stuck in inbox: {}", path.display());
    }
    info!("processed: {}", report.processed);
    info!("OK!");

    Ok(())
}

fn run_compose_dump(opts: ComposeDumpOptions, settings: Settings) -> Result<()> {
    let compose = settings.compose;
    let job = ComposeDumpJob {
        mount_point: opts.mount_point.unwrap_or(compose.mount_point),
        subdir: compose.subdir,
        keep_count: opts.keep_count.unwrap_or(compose.keep_count),
        projects: if opts.projects.is_empty() {
            compose.projects
        } else {
            opts.projects
        },
        service: opts.service.unwrap_or(compose.service),
        archive_ext: settings.backup.archive_ext,
    };

    ComposeDumper::new(SystemRunner::new(), LocalVolume::new())
        .run(&job, Local::now().naive_local())?;
    info!("OK!");

    Ok(())
}

fn run_wrap(opts: WrapOptions) -> Result<()> {
    let job = HookedJob {
        primary: opts.cmd,
        on_ok: opts.ok,
        on_fail: opts.fail,
    };

    run_with_hooks(&SystemRunner::new(), &job).into_result(opts.propagate)?;

    Ok(())
}

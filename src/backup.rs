// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Archival backup job.
//!
//! A backup run mirrors a source tree into a __staging__ directory with
//! `rsync`, optionally dumps a database next to the mirrored files, and then
//! packs the staging directory into a timestamped archive with `tar`. The
//! staging directory survives between runs, so `rsync` only has to transfer
//! what changed since the last backup.
//!
//! # Destination Layout
//!
//! ```text
//! <dst>/
//! ├── backup/                                  staging directory
//! ├── latest -> user_host_20240102_030405.tar.bz2
//! ├── user_host_20240101_030405.tar.bz2
//! └── user_host_20240102_030405.tar.bz2
//! ```
//!
//! Old archives are pruned before the new one is created, so the space they
//! occupied is available to the run that needs it.

use crate::{
    exec::{mount_check, CommandLine, ProcessRunner, SystemRunner},
    retention::{RetentionManager, RetentionPolicy, RetentionReport},
    volume::{create_private_file, replace_symlink, LocalVolume, Volume},
};

use chrono::NaiveDateTime;
use std::{
    env,
    fs::create_dir_all,
    path::{Path, PathBuf},
};
use tracing::{info, instrument};

/// Name of staging directory under backup destination.
pub const STAGING_DIR_NAME: &str = "backup";

/// Name of symlink pointing at newest archive.
pub const LATEST_LINK_NAME: &str = "latest";

/// Name of database dump inside staging directory.
pub const DUMP_FILE_NAME: &str = "db.sql";

/// Format of timestamps embedded in archive names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Who is taking the backup, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub host: String,
}

impl Identity {
    /// Construct new identity.
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }

    /// Detect identity of current process.
    ///
    /// User name is taken from the first of `LOGNAME`, `USER`, `LNAME`, and
    /// `USERNAME` that is set. Schedulers often start jobs with none of them,
    /// so the account database entry of the real user ID is used after that.
    /// Host name comes from the system.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::NoUser`] if no user name variable is set, and
    ///   the real user ID has no account entry.
    pub fn detect() -> Result<Self> {
        let user = ["LOGNAME", "USER", "LNAME", "USERNAME"]
            .into_iter()
            .find_map(|key| env::var(key).ok().filter(|value| !value.is_empty()))
            .or_else(account_name)
            .ok_or(BackupError::NoUser)?;
        let host = gethostname::gethostname().to_string_lossy().into_owned();

        Ok(Self { user, host })
    }
}

#[cfg(unix)]
fn account_name() -> Option<String> {
    use nix::unistd::{getuid, User};

    User::from_uid(getuid()).ok().flatten().map(|user| user.name)
}

#[cfg(not(unix))]
fn account_name() -> Option<String> {
    None
}

/// Compose archive file name.
///
/// Produces `<user>_<host>[_<tag>]_<YYYYMMDD_HHMMSS>.<ext>`.
pub fn archive_name(
    identity: &Identity,
    tag: Option<&str>,
    now: NaiveDateTime,
    archive_ext: &str,
) -> String {
    let tag = tag.map(|tag| format!("_{tag}")).unwrap_or_default();
    format!(
        "{}_{}{tag}_{}.{archive_ext}",
        identity.user,
        identity.host,
        now.format(TIMESTAMP_FORMAT)
    )
}

/// Fully resolved archival backup job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    /// Root of tree to back up.
    pub src: PathBuf,

    /// Backup destination root.
    pub dst: PathBuf,

    /// Extra free text put into archive name.
    pub tag: Option<String>,

    /// Path that must be a mountpoint before anything runs.
    pub mount_check: Option<PathBuf>,

    /// Number of newest archives to keep.
    pub keep_count: Option<usize>,

    /// Free space to reserve on destination volume in bytes.
    pub reserved_bytes: Option<u64>,

    /// Files listing rsync exclusion patterns.
    pub exclude_from: Vec<PathBuf>,

    /// Program dumping a database to standard output.
    pub dump_command: String,

    /// Database to dump, if any.
    pub database: Option<String>,

    /// Extension chain of archives.
    pub archive_ext: String,

    /// Only simulate destructive steps.
    pub dry_run: bool,
}

impl BackupJob {
    /// Staging directory that `rsync` mirrors into.
    pub fn staging_dir(&self) -> PathBuf {
        self.dst.join(STAGING_DIR_NAME)
    }

    /// Glob pattern matching this job's archives.
    pub fn archive_pattern(&self) -> String {
        format!("*.{}", self.archive_ext)
    }

    /// Make every path of job absolute against the current directory.
    ///
    /// Paths are not canonicalized, so symlinks stay as given and missing
    /// paths are fine.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::Resolve`] if the current directory cannot be
    ///   determined.
    pub fn resolve_paths(mut self) -> Result<Self> {
        self.src = resolve(&self.src)?;
        self.dst = resolve(&self.dst)?;
        self.mount_check = self.mount_check.as_deref().map(resolve).transpose()?;
        self.exclude_from = self
            .exclude_from
            .iter()
            .map(|path| resolve(path))
            .collect::<Result<Vec<_>>>()?;

        Ok(self)
    }

    fn policies(&self) -> Vec<RetentionPolicy> {
        let mut policies = Vec::new();
        if let Some(keep) = self.keep_count {
            policies.push(RetentionPolicy::KeepCount(keep));
        }
        if let Some(bytes) = self.reserved_bytes {
            policies.push(RetentionPolicy::ReserveFreeSpace(bytes));
        }

        policies
    }
}

/// Result of an archival backup run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackupReport {
    /// Archive created by run, absent on dry runs.
    pub archive: Option<PathBuf>,

    /// Archives removed by retention before archiving.
    pub retention: RetentionReport,
}

/// Run archival backup jobs.
#[derive(Debug, Default)]
pub struct Archiver<R = SystemRunner, V = LocalVolume>
where
    R: ProcessRunner,
    V: Volume,
{
    runner: R,
    volume: V,
}

impl<R, V> Archiver<R, V>
where
    R: ProcessRunner,
    V: Volume,
{
    /// Construct new archiver.
    pub fn new(runner: R, volume: V) -> Self {
        Self { runner, volume }
    }

    /// Run backup job to completion.
    ///
    /// Aborts on first failing step. Nothing done by earlier steps is undone.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::Exec`] if an external tool fails.
    /// - Return [`BackupError::Retention`] if pruning old archives fails.
    /// - Return [`BackupError::Volume`] if output files cannot be created.
    /// - Return [`BackupError::CreateDir`] if staging directory cannot be
    ///   created.
    #[instrument(skip(self, job, identity), level = "debug")]
    pub fn run(
        &self,
        job: &BackupJob,
        identity: &Identity,
        now: NaiveDateTime,
    ) -> Result<BackupReport> {
        let staging = job.staging_dir();
        let name = archive_name(identity, job.tag.as_deref(), now, &job.archive_ext);
        let archive = job.dst.join(&name);
        info!("date: {}", now.format(TIMESTAMP_FORMAT));
        info!("src: {}", job.src.display());
        info!("dst: {}", job.dst.display());
        info!("rsync dst: {}", staging.display());
        info!("ar dst: {}", archive.display());
        info!("mount check: {:?}", job.mount_check);
        info!("keep count: {:?}", job.keep_count);
        info!("reserved size: {:?}", job.reserved_bytes);
        info!("exclude from: {:?}", job.exclude_from);
        info!("dump command: {}", job.dump_command);
        info!("db: {:?}", job.database);
        info!("dry run: {}", job.dry_run);

        if let Some(path) = &job.mount_check {
            mount_check(&self.runner, path)?;
        }

        create_dir_all(&staging).map_err(|err| BackupError::CreateDir {
            source: err,
            path: staging.clone(),
        })?;

        let retention = RetentionManager::new(&self.volume)
            .with_dry_run(job.dry_run)
            .apply(&job.dst, &job.archive_pattern(), job.policies())?;

        self.rsync(job, &staging)?;

        // INVARIANT: Dump after rsync, its --delete would remove the dump.
        if let Some(database) = &job.database {
            self.dump_database(job, &staging, database)?;
        }

        let mut report = BackupReport {
            archive: None,
            retention,
        };
        if job.dry_run {
            info!("tar...");
            info!("skip by dry-run");
            info!("symlink...");
            info!("skip by dry-run");
            return Ok(report);
        }

        self.archive(&staging, &archive)?;
        let link = job.dst.join(LATEST_LINK_NAME);
        info!("symlink {} to {name}", link.display());
        replace_symlink(&link, &name)?;
        report.archive = Some(archive);

        Ok(report)
    }

    fn rsync(&self, job: &BackupJob, staging: &Path) -> Result<()> {
        info!("rsync...");
        let mut cmd = CommandLine::new("rsync").args(["-aur", "--stats", "--delete"]);
        for exclude in &job.exclude_from {
            cmd = cmd.arg(format!("--exclude-from={}", exclude.display()));
        }
        if job.dry_run {
            cmd = cmd.arg("-n");
        }
        cmd = cmd.arg(job.src.as_os_str()).arg(staging.as_os_str());
        self.runner.run(&cmd, None)?;

        Ok(())
    }

    fn dump_database(&self, job: &BackupJob, staging: &Path, database: &str) -> Result<()> {
        info!("db dump...");
        if job.dry_run {
            info!("skip by dry-run");
            return Ok(());
        }

        let output = create_private_file(staging.join(DUMP_FILE_NAME))?;
        let cmd = CommandLine::new(&job.dump_command).args(["--databases", database]);
        self.runner.run(&cmd, Some(output))?;

        Ok(())
    }

    fn archive(&self, staging: &Path, archive: &Path) -> Result<()> {
        info!("tar...");

        // INVARIANT: Create archive as private before tar writes into it.
        //   - tar picks compressor from suffix via -a.
        //   - permissions and ownership are preserved by default for root.
        let _ = create_private_file(archive)?;
        let cmd = CommandLine::new("tar")
            .arg("-C")
            .arg(staging.as_os_str())
            .arg("-acf")
            .arg(archive.as_os_str())
            .arg(".");
        self.runner.run(&cmd, None)?;

        Ok(())
    }
}

/// Archival backup error types.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// User name cannot be determined.
    #[error("cannot determine user name from environment")]
    NoUser,

    /// Directory cannot be created.
    #[error("failed to create directory {:?}", .path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Path cannot be made absolute.
    #[error("failed to resolve path {:?}", .path.display())]
    Resolve {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// External tool fails.
    #[error(transparent)]
    Exec(#[from] crate::exec::ExecError),

    /// Pruning old archives fails.
    #[error(transparent)]
    Retention(#[from] crate::retention::RetentionError),

    /// Output file handling fails.
    #[error(transparent)]
    Volume(#[from] crate::volume::VolumeError),
}

fn resolve(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|err| BackupError::Resolve {
        source: err,
        path: path.to_path_buf(),
    })
}

/// Friendly result alias :3
pub type Result<T, E = BackupError> = std::result::Result<T, E>;

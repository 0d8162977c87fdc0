// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Database dumps of Docker Compose projects.
//!
//! Some services keep their state in a MongoDB container managed through
//! Docker Compose. For each configured project, `mongodump` runs inside the
//! database container, and the resulting archive is copied out to a dump
//! directory on the backup volume. The dump directory is then packed into one
//! timestamped archive, and old archives are pruned by keep count.
//!
//! # Layout
//!
//! ```text
//! <mount point>/<subdir>/
//! ├── dump/       recreated empty on every run
//! └── archive/    <subdir>_<YYYYMMDD_HHMMSS>.tar.bz2
//! ```

use crate::{
    backup::TIMESTAMP_FORMAT,
    exec::{mount_check, CommandLine, ProcessRunner, SystemRunner},
    retention::{RetentionManager, RetentionReport},
    volume::{create_private_file, LocalVolume, Volume},
};

use chrono::{Local, NaiveDateTime};
use std::{
    fs::{create_dir_all, remove_dir_all},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

const BANNER: &str =
    "--------------------------------------------------------------------------------";

/// Fully resolved compose dump job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeDumpJob {
    /// Mountpoint of backup volume.
    pub mount_point: PathBuf,

    /// Directory under mountpoint reserved for this job.
    pub subdir: String,

    /// Number of newest archives to keep.
    pub keep_count: usize,

    /// Compose project names to dump.
    pub projects: Vec<String>,

    /// Compose service running the database.
    pub service: String,

    /// Extension chain of archives.
    pub archive_ext: String,
}

impl ComposeDumpJob {
    /// Root directory of this job on backup volume.
    pub fn root(&self) -> PathBuf {
        self.mount_point.join(&self.subdir)
    }

    /// Directory receiving fresh dumps.
    pub fn dump_dir(&self) -> PathBuf {
        self.root().join("dump")
    }

    /// Directory holding packed dumps.
    pub fn archive_dir(&self) -> PathBuf {
        self.root().join("archive")
    }
}

/// Result of a compose dump run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeDumpReport {
    /// Archive packing all dumps of this run.
    pub archive: PathBuf,

    /// Archives removed by retention.
    pub retention: RetentionReport,

    /// Local time the run finished at.
    pub finished: NaiveDateTime,
}

/// Run compose dump jobs.
#[derive(Debug, Default)]
pub struct ComposeDumper<R = SystemRunner, V = LocalVolume>
where
    R: ProcessRunner,
    V: Volume,
{
    runner: R,
    volume: V,
}

impl<R, V> ComposeDumper<R, V>
where
    R: ProcessRunner,
    V: Volume,
{
    /// Construct new compose dumper.
    pub fn new(runner: R, volume: V) -> Self {
        Self { runner, volume }
    }

    /// Run compose dump job to completion.
    ///
    /// # Errors
    ///
    /// - Return [`ComposeError::Exec`] if mount check, `docker`, or `tar`
    ///   fails.
    /// - Return [`ComposeError::CreateDir`] if job directories cannot be
    ///   created.
    /// - Return [`ComposeError::Volume`] if archive cannot be created.
    /// - Return [`ComposeError::Retention`] if pruning old archives fails.
    #[instrument(skip(self, job), level = "debug")]
    pub fn run(&self, job: &ComposeDumpJob, now: NaiveDateTime) -> Result<ComposeDumpReport> {
        mount_check(&self.runner, &job.mount_point)?;

        let dump_dir = job.dump_dir();
        let archive_dir = job.archive_dir();
        if let Err(err) = remove_dir_all(&dump_dir) {
            debug!("cannot clear {}: {err}", dump_dir.display());
        }
        for dir in [&dump_dir, &archive_dir] {
            create_dir_all(dir).map_err(|err| ComposeError::CreateDir {
                source: err,
                path: dir.clone(),
            })?;
        }

        info!("{BANNER}");
        info!("START");
        info!("{now}");
        info!("{BANNER}");

        for project in &job.projects {
            self.dump_project(job, project, &dump_dir)?;
        }

        let archive = archive_dir.join(format!(
            "{}_{}.{}",
            job.subdir,
            now.format(TIMESTAMP_FORMAT),
            job.archive_ext
        ));
        self.archive(&dump_dir, &archive)?;

        let retention = RetentionManager::new(&self.volume).apply_keep_count(
            &archive_dir,
            &format!("*.{}", job.archive_ext),
            job.keep_count,
        )?;

        let finished = Local::now().naive_local();
        info!("{BANNER}");
        info!("END");
        info!("{finished}");
        info!("{BANNER}");

        Ok(ComposeDumpReport {
            archive,
            retention,
            finished,
        })
    }

    fn dump_project(&self, job: &ComposeDumpJob, project: &str, dump_dir: &Path) -> Result<()> {
        let in_container = format!("/tmp/{project}.archive");
        let on_host = dump_dir.join(format!("{project}.archive"));

        // INVARIANT: Never allocate a TTY, scheduled jobs have none.
        let dump = CommandLine::new("docker")
            .args(["compose", "-p", project, "exec", "-T"])
            .arg(&job.service)
            .arg("mongodump")
            .arg(format!("--archive={in_container}"));
        self.runner.run(&dump, None)?;

        let copy = CommandLine::new("docker")
            .args(["compose", "-p", project, "cp"])
            .arg(format!("{}:{in_container}", job.service))
            .arg(on_host.as_os_str());
        self.runner.run(&copy, None)?;

        Ok(())
    }

    fn archive(&self, dump_dir: &Path, archive: &Path) -> Result<()> {
        info!("tar...");
        let _ = create_private_file(archive)?;
        let cmd = CommandLine::new("tar")
            .arg("-C")
            .arg(dump_dir.as_os_str())
            .arg("-acf")
            .arg(archive.as_os_str())
            .arg(".");
        self.runner.run(&cmd, None)?;

        Ok(())
    }
}

/// Compose dump error types.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    /// Directory cannot be created.
    #[error("failed to create directory {:?}", .path.display())]
    CreateDir {
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

    /// Archive file cannot be created.
    #[error(transparent)]
    Volume(#[from] crate::volume::VolumeError),
}

/// Friendly result alias :3
pub type Result<T, E = ComposeError> = std::result::Result<T, E>;

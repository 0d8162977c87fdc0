// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file that Oxibak reads defaults
//! from. Every table and field is optional, so an empty file, or no file at
//! all, yields the built-in defaults. Command line flags given to a job always
//! win over values from this file.
//!
//! Configuration is resolved exactly once by the binary. Library code never
//! looks anything up on its own, it only receives fully resolved values.
//!
//! # General Layout
//!
//! ```toml
//! [backup]
//! archive_ext = "tar.bz2"
//! dump_command = "mariadb-dump"
//! exclude_from = ["$HOME/.config/oxibak/exclude.txt"]
//!
//! [retention]
//! keep_count = 14
//! reserved_gib = 100
//!
//! [inbox]
//! root = "/mnt/bkup/server"
//!
//! [compose]
//! mount_point = "/mnt/bkup"
//! keep_count = 30
//! projects = ["growi-public", "growi-private"]
//! ```

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Top-level configuration file layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Defaults for archival backup job.
    pub backup: BackupSettings,

    /// Defaults for retention of archives.
    pub retention: RetentionSettings,

    /// Defaults for inbox processing job.
    pub inbox: InboxSettings,

    /// Defaults for containerised database dump job.
    pub compose: ComposeSettings,
}

impl Settings {
    /// Load configuration file.
    ///
    /// An explicitly requested file must exist. The default file is allowed
    /// to be missing, in which case built-in defaults are used.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if configuration file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if configuration is malformed.
    /// - Return [`ConfigError::ShellExpansion`] if a path cannot be expanded.
    pub fn load(path: impl AsRef<Path>, required: bool) -> Result<Self> {
        let path = path.as_ref();
        match read_to_string(path) {
            Ok(data) => {
                debug!("load configuration from {:?}", path.display());
                data.parse()
            }
            Err(err) if err.kind() == ErrorKind::NotFound && !required => {
                debug!("no configuration at {:?}, use defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(ConfigError::Read {
                source: err,
                path: path.to_path_buf(),
            }),
        }
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        let backup = &mut settings.backup;
        backup.mount_check = backup.mount_check.as_deref().map(expand).transpose()?;
        backup.exclude_from = backup
            .exclude_from
            .iter()
            .map(|path| expand(path))
            .collect::<Result<Vec<_>>>()?;
        let inbox = &mut settings.inbox;
        inbox.root = inbox.root.as_deref().map(expand).transpose()?;
        inbox.mount_check = inbox.mount_check.as_deref().map(expand).transpose()?;
        settings.compose.mount_point = expand(&settings.compose.mount_point)?;

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Archival backup job settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Extension chain of archives, also selects the compressor `tar` uses.
    pub archive_ext: String,

    /// Program dumping a database to standard output.
    pub dump_command: String,

    /// Extra free text put into archive names.
    pub tag: Option<String>,

    /// Path that must be a mountpoint before anything runs.
    pub mount_check: Option<PathBuf>,

    /// Files listing rsync exclusion patterns.
    pub exclude_from: Vec<PathBuf>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            archive_ext: "tar.bz2".into(),
            dump_command: "mariadb-dump".into(),
            tag: None,
            mount_check: None,
            exclude_from: Vec::new(),
        }
    }
}

/// Archive retention settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Number of newest archives to keep.
    pub keep_count: Option<usize>,

    /// Free space to reserve on archive volume in GiB.
    pub reserved_gib: Option<u64>,
}

/// Inbox processing job settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InboxSettings {
    /// Backup root holding inbox and repository directories.
    pub root: Option<PathBuf>,

    /// Path that must be a mountpoint before anything runs.
    pub mount_check: Option<PathBuf>,
}

/// Containerised database dump job settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ComposeSettings {
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
}

impl Default for ComposeSettings {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/mnt/bkup"),
            subdir: "growi".into(),
            keep_count: 30,
            projects: vec!["growi-public".into(), "growi-private".into()],
            service: "mongo".into(),
        }
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration file {:?}", .path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Filesystem access for archive directories.
//!
//! Retention logic only needs three things from the filesystem: a listing of
//! archive files, a way to delete them, and a way to ask how much space is
//! left on the volume holding them. The [`Volume`] trait captures exactly that,
//! so retention can be driven against canned listings and disk usage figures
//! in tests.
//!
//! The remaining helpers in this module cover file creation and symlink
//! replacement needed by the archival workflows.

use glob::{glob_with, MatchOptions, Pattern};
use std::{
    fs::{remove_file, symlink_metadata, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Number of bytes in one gibibyte.
pub const GIB: u64 = 1 << 30;

/// Space accounting of a volume in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    /// Capacity of volume.
    pub total: u64,

    /// Space in use.
    pub used: u64,

    /// Space available to unprivileged callers.
    pub free: u64,
}

impl DiskUsage {
    /// Convert byte count to gibibytes for display.
    pub fn as_gib(bytes: u64) -> f64 {
        bytes as f64 / GIB as f64
    }
}

/// Directory of archive files living on some volume.
pub trait Volume {
    /// List files directly under `dir` whose names match glob `pattern`.
    ///
    /// Listing is sorted in ascending order by path, and never contains
    /// directories or duplicate entries.
    ///
    /// # Errors
    ///
    /// - Return [`VolumeError::Pattern`] if `pattern` is not a valid glob.
    /// - Return [`VolumeError::List`] if directory cannot be read.
    fn list_archives(&self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>>;

    /// Permanently delete file.
    ///
    /// # Errors
    ///
    /// - Return [`VolumeError::Remove`] if file cannot be deleted.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Size of file in bytes.
    ///
    /// # Errors
    ///
    /// - Return [`VolumeError::Metadata`] if file cannot be inspected.
    fn file_size(&self, path: &Path) -> Result<u64>;

    /// Query disk usage of volume containing `dir`.
    ///
    /// # Errors
    ///
    /// - Return [`VolumeError::DiskUsage`] if volume statistics are not
    ///   available.
    fn disk_usage(&self, dir: &Path) -> Result<DiskUsage>;
}

impl<V> Volume for &V
where
    V: Volume + ?Sized,
{
    fn list_archives(&self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        (**self).list_archives(dir, pattern)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        (**self).remove_file(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        (**self).file_size(path)
    }

    fn disk_usage(&self, dir: &Path) -> Result<DiskUsage> {
        (**self).disk_usage(dir)
    }
}

/// Volume backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalVolume;

impl LocalVolume {
    /// Construct new local volume.
    pub fn new() -> Self {
        Self
    }
}

impl Volume for LocalVolume {
    fn list_archives(&self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        // INVARIANT: Only the pattern is interpreted, the directory is literal.
        let full = format!("{}/{}", Pattern::escape(&dir.to_string_lossy()), pattern);
        // INVARIANT: Hidden files are never archives, wildcards skip them.
        let options = MatchOptions {
            require_literal_leading_dot: true,
            ..MatchOptions::new()
        };
        let paths = glob_with(&full, options).map_err(|err| VolumeError::Pattern {
            source: err,
            pattern: pattern.to_string(),
        })?;

        let mut files = Vec::new();
        for entry in paths {
            let path = entry.map_err(|err| VolumeError::List {
                dir: dir.to_path_buf(),
                source: err.into(),
            })?;

            if path.is_dir() {
                continue;
            }
            files.push(path);
        }

        files.sort();
        files.dedup();

        Ok(files)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        remove_file(path).map_err(|err| VolumeError::Remove {
            source: err,
            path: path.to_path_buf(),
        })
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        symlink_metadata(path)
            .map(|meta| meta.len())
            .map_err(|err| VolumeError::Metadata {
                source: err,
                path: path.to_path_buf(),
            })
    }

    fn disk_usage(&self, dir: &Path) -> Result<DiskUsage> {
        let probe = |result: std::io::Result<u64>| {
            result.map_err(|err| VolumeError::DiskUsage {
                source: err,
                dir: dir.to_path_buf(),
            })
        };

        let total = probe(fs2::total_space(dir))?;
        let unreserved = probe(fs2::free_space(dir))?;
        let free = probe(fs2::available_space(dir))?;

        Ok(DiskUsage {
            total,
            used: total.saturating_sub(unreserved),
            free,
        })
    }
}

/// Create or truncate file readable and writable by its owner only.
///
/// Permissions are fixed at creation, before any content lands in the file.
///
/// # Errors
///
/// - Return [`VolumeError::Create`] if file cannot be opened for writing.
pub fn create_private_file(path: impl AsRef<Path>) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let file = options.open(path.as_ref()).map_err(|err| VolumeError::Create {
        source: err,
        path: path.as_ref().to_path_buf(),
    })?;

    // INVARIANT: Mode passed to open is ignored for pre-existing files.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|err| VolumeError::Create {
                source: err,
                path: path.as_ref().to_path_buf(),
            })?;
    }

    Ok(file)
}

/// Point symbolic link at `link` to `target`, replacing any existing link.
///
/// # Errors
///
/// - Return [`VolumeError::Symlink`] if old link cannot be removed, or new
///   link cannot be created.
pub fn replace_symlink(link: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<()> {
    let link = link.as_ref();
    let symlink_error = |err: std::io::Error| VolumeError::Symlink {
        source: err,
        link: link.to_path_buf(),
    };

    match remove_file(link) {
        Err(err) if err.kind() != ErrorKind::NotFound => return Err(symlink_error(err)),
        _ => {}
    }
    symlink(target.as_ref(), link).map_err(symlink_error)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

/// Filesystem error types.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    /// Glob pattern is malformed.
    #[error("invalid file pattern {pattern:?}")]
    Pattern {
        #[source]
        source: glob::PatternError,
        pattern: String,
    },

    /// Directory listing failed.
    #[error("failed to list {:?}", .dir.display())]
    List {
        #[source]
        source: std::io::Error,
        dir: PathBuf,
    },

    /// File could not be deleted.
    #[error("failed to delete {:?}", .path.display())]
    Remove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// File could not be inspected.
    #[error("failed to read metadata of {:?}", .path.display())]
    Metadata {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// File could not be created.
    #[error("failed to create {:?}", .path.display())]
    Create {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Symbolic link could not be replaced.
    #[error("failed to replace symlink {:?}", .link.display())]
    Symlink {
        #[source]
        source: std::io::Error,
        link: PathBuf,
    },

    /// Volume statistics could not be queried.
    #[error("failed to query disk usage of {:?}", .dir.display())]
    DiskUsage {
        #[source]
        source: std::io::Error,
        dir: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = VolumeError> = std::result::Result<T, E>;

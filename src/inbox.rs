// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backup inbox reconciliation.
//!
//! Remote machines push their own archives into an __inbox__ directory. A
//! transfer can take a long time, so a file in the inbox is only considered
//! ready once the sender drops an empty __completion marker__ next to it named
//! `<file name>.complete`. Ready files get their name validated against the
//! timestamped naming convention and are then moved into the __repository__
//! directory, where retention can treat them like any locally made archive.
//!
//! # Naming Convention
//!
//! Files must be named `<base>[-_]<YYYYMMDD>[-_]<HHMMSS>.<ext>`. A name that
//! lacks the timestamp, but still has the shape `<base>.<ext>` with no dot in
//! `<base>`, is accepted and stamped with the current time, e.g., `db.sql`
//! becomes `db_20240102_030405.sql`. Anything else is rejected and left in the
//! inbox alongside its marker.

use chrono::NaiveDateTime;
use regex_lite::Regex;
use std::{
    fs::{create_dir_all, read_dir, remove_file, rename, symlink_metadata, write},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::LazyLock,
};
use tracing::{debug, info, instrument, warn};

/// Suffix of completion marker files.
pub const MARKER_SUFFIX: &str = ".complete";

/// Name of inbox directory under a backup root.
pub const INBOX_DIR_NAME: &str = "inbox";

/// Name of repository directory under a backup root.
pub const REPO_DIR_NAME: &str = "repo";

const README_NAME: &str = "README.txt";

const README: &str = "\
This is backup inbox.

file name format is:
  name_????????_??????.ext.ext2...
  yyyymmdd: date
  hhmmss  : time

AFTER your transfer is completed, create an empty marker file:
  <your file name>.complete

A <your file name>.md5sum file may accompany the transfer, it is kept as is.
";

static TIMESTAMPED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*)[\-_](\d{8})[\-_](\d{6})\.(.*)$").expect("timestamped name pattern")
});

static UNSTAMPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^.]*)\.(.*)$").expect("unstamped name pattern"));

/// Verdict of the naming convention on one file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameCheck {
    /// Name already carries a timestamp.
    Valid,

    /// Name lacked a timestamp, and this is the stamped replacement.
    Stamped(String),

    /// Name cannot be made to fit the convention.
    Invalid,
}

/// Timestamped file naming convention.
#[derive(Debug, Default, Clone, Copy)]
pub struct NameConvention;

impl NameConvention {
    /// Check file name against naming convention.
    ///
    /// Uses `now` as the timestamp to inject into names that lack one.
    pub fn check(name: &str, now: NaiveDateTime) -> NameCheck {
        if TIMESTAMPED.is_match(name) {
            return NameCheck::Valid;
        }

        match UNSTAMPED.captures(name) {
            Some(caps) => NameCheck::Stamped(format!(
                "{}_{}.{}",
                &caps[1],
                now.format("%Y%m%d_%H%M%S"),
                &caps[2]
            )),
            None => NameCheck::Invalid,
        }
    }

    /// Normalize file name to the convention.
    ///
    /// Returns [`None`] if the name is invalid.
    pub fn normalize(name: &str, now: NaiveDateTime) -> Option<String> {
        match Self::check(name, now) {
            NameCheck::Valid => Some(name.to_string()),
            NameCheck::Stamped(stamped) => Some(stamped),
            NameCheck::Invalid => None,
        }
    }
}

/// Inbox and repository directories under one backup root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxLayout {
    pub inbox: PathBuf,
    pub repo: PathBuf,
}

impl InboxLayout {
    /// Derive layout from backup root.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            inbox: root.as_ref().join(INBOX_DIR_NAME),
            repo: root.as_ref().join(REPO_DIR_NAME),
        }
    }

    /// Create inbox and repository directories if missing.
    ///
    /// Also drops a README describing the naming convention into the inbox
    /// for whoever sends files there.
    ///
    /// # Errors
    ///
    /// - Return [`InboxError::CreateDir`] if either directory cannot be
    ///   created.
    /// - Return [`InboxError::WriteReadme`] if README cannot be written.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.inbox, &self.repo] {
            create_dir_all(dir).map_err(|err| InboxError::CreateDir {
                source: err,
                path: dir.clone(),
            })?;
        }

        let readme = self.inbox.join(README_NAME);
        if symlink_metadata(&readme).is_err() {
            write(&readme, README).map_err(|err| InboxError::WriteReadme {
                source: err,
                path: readme.clone(),
            })?;
        }

        Ok(())
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Number of files moved into repository.
    pub processed: usize,

    /// Ready files whose name never validates.
    ///
    /// These stay in the inbox with their marker, and will show up here again
    /// on every future pass until someone renames or removes them.
    pub stuck: Vec<PathBuf>,
}

/// Move ready inbox files into repository.
///
/// Processes every ready entry of `inbox` once. Order of processing is
/// whatever order the directory listing yields.
///
/// # Errors
///
/// - Return [`InboxError::ReadDir`] if inbox cannot be listed.
/// - Return [`InboxError::Inspect`] if an entry cannot be inspected for a
///   reason other than having vanished.
/// - Return [`InboxError::Move`] if a ready file cannot be moved.
#[instrument(skip(inbox, repo), level = "debug")]
pub fn reconcile(
    inbox: impl AsRef<Path>,
    repo: impl AsRef<Path>,
    now: NaiveDateTime,
) -> Result<ReconcileReport> {
    let inbox = inbox.as_ref();
    let repo = repo.as_ref();
    info!("process inbox");
    info!("inbox_dir: {}", inbox.display());
    info!("repo_dir : {}", repo.display());

    let read_dir_error = |err: std::io::Error| InboxError::ReadDir {
        source: err,
        dir: inbox.to_path_buf(),
    };

    let mut report = ReconcileReport::default();
    for entry in read_dir(inbox).map_err(read_dir_error)? {
        let path = entry.map_err(read_dir_error)?.path();

        // INVARIANT: Never follow symlinks, they are not regular files.
        let meta = match symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("{} vanished", path.display());
                continue;
            }
            Err(err) => {
                return Err(InboxError::Inspect {
                    source: err,
                    path: path.clone(),
                })
            }
        };

        if !meta.file_type().is_file() {
            warn!("{} is not a regular file", path.display());
            continue;
        }

        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            warn!("invalid file name: {}", path.display());
            continue;
        };

        let marker_name = format!("{name}{MARKER_SUFFIX}");
        let marker = inbox.join(&marker_name);
        info!("process: {name}");
        if symlink_metadata(&marker).is_err() {
            info!("  {marker_name} not found");
            continue;
        }
        info!("  {marker_name} found");

        let target_name = match NameConvention::check(name, now) {
            NameCheck::Valid => name.to_string(),
            NameCheck::Stamped(stamped) => {
                info!("  no timestamp, rename to {stamped}");
                stamped
            }
            NameCheck::Invalid => {
                warn!("  invalid file name: {name}");
                report.stuck.push(path.clone());
                continue;
            }
        };

        let target = repo.join(target_name);
        info!("  move to {}", target.display());
        rename(&path, &target).map_err(|err| InboxError::Move {
            source: err,
            from: path.clone(),
            to: target.clone(),
        })?;

        match remove_file(&marker) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("  failed to remove {}: {err}", marker.display()),
        }

        report.processed += 1;
    }

    if !report.stuck.is_empty() {
        warn!(
            "{} stuck inbox entries have a marker but an invalid name: {:?}",
            report.stuck.len(),
            report.stuck
        );
    }
    info!("process inbox OK");
    info!("  processed: {}", report.processed);

    Ok(report)
}

/// Inbox reconciliation error types.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    /// Inbox or repository directory cannot be created.
    #[error("failed to create directory {:?}", .path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Inbox README cannot be written.
    #[error("failed to write inbox README {:?}", .path.display())]
    WriteReadme {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Inbox cannot be listed.
    #[error("failed to read inbox {:?}", .dir.display())]
    ReadDir {
        #[source]
        source: std::io::Error,
        dir: PathBuf,
    },

    /// Inbox entry cannot be inspected.
    #[error("failed to inspect inbox entry {:?}", .path.display())]
    Inspect {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Ready file cannot be moved into repository.
    #[error("failed to move {:?} to {:?}", .from.display(), .to.display())]
    Move {
        #[source]
        source: std::io::Error,
        from: PathBuf,
        to: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = InboxError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::fs::{create_dir, read_to_string};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .and_then(|date| date.and_hms_opt(3, 4, 5))
            .expect("valid timestamp")
    }

    struct Fixture {
        _root: tempfile::TempDir,
        layout: InboxLayout,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let root = tempfile::tempdir()?;
            let layout = InboxLayout::new(root.path());
            create_dir(&layout.inbox)?;
            create_dir(&layout.repo)?;
            Ok(Self {
                _root: root,
                layout,
            })
        }

        fn drop_file(&self, name: &str, ready: bool) -> anyhow::Result<()> {
            write(self.layout.inbox.join(name), name)?;
            if ready {
                write(self.layout.inbox.join(format!("{name}{MARKER_SUFFIX}")), "")?;
            }
            Ok(())
        }

        fn reconcile(&self) -> Result<ReconcileReport> {
            reconcile(&self.layout.inbox, &self.layout.repo, now())
        }

        fn inbox_has(&self, name: &str) -> bool {
            self.layout.inbox.join(name).exists()
        }

        fn repo_has(&self, name: &str) -> bool {
            self.layout.repo.join(name).exists()
        }
    }

    #[test_case("db_20240101_101010.sql", NameCheck::Valid; "underscore separated")]
    #[test_case("db-20240101-101010.sql", NameCheck::Valid; "dash separated")]
    #[test_case("user_host_home_20240101_101010.tar.bz2", NameCheck::Valid; "extension chain")]
    #[test_case("db.sql", NameCheck::Stamped("db_20240102_030405.sql".into()); "fallback")]
    #[test_case("home.tar.bz2", NameCheck::Stamped("home_20240102_030405.tar.bz2".into()); "fallback chain")]
    #[test_case("no_extension_weirdname", NameCheck::Invalid; "no extension")]
    #[test_case("db_2024_0101.sql", NameCheck::Stamped("db_2024_0101_20240102_030405.sql".into()); "short timestamp")]
    #[test]
    fn name_convention_check(name: &str, expect: NameCheck) {
        pretty_assertions::assert_eq!(NameConvention::check(name, now()), expect);
    }

    #[test]
    fn name_convention_normalize_rejects_invalid() {
        assert_eq!(NameConvention::normalize("weird", now()), None);
        assert_eq!(
            NameConvention::normalize("db.sql", now()),
            Some("db_20240102_030405.sql".into())
        );
    }

    #[test]
    fn ready_valid_entry_moves_unchanged() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.drop_file("db_20240101_101010.sql", true)?;

        let report = fixture.reconcile()?;
        assert_eq!(report.processed, 1);
        assert!(fixture.repo_has("db_20240101_101010.sql"));
        assert!(!fixture.inbox_has("db_20240101_101010.sql"));
        assert!(!fixture.inbox_has("db_20240101_101010.sql.complete"));

        Ok(())
    }

    #[test]
    fn ready_unstamped_entry_is_stamped() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.drop_file("db.sql", true)?;

        let report = fixture.reconcile()?;
        assert_eq!(report.processed, 1);
        assert!(fixture.repo_has("db_20240102_030405.sql"));
        assert_eq!(
            read_to_string(fixture.layout.repo.join("db_20240102_030405.sql"))?,
            "db.sql"
        );
        assert!(!fixture.inbox_has("db.sql.complete"));

        Ok(())
    }

    #[test]
    fn pending_entry_is_untouched() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.drop_file("db_20240101_101010.sql", false)?;
        fixture.drop_file("home_20240101_101010.tar.bz2", true)?;

        let report = fixture.reconcile()?;
        assert_eq!(report.processed, 1);
        assert!(fixture.inbox_has("db_20240101_101010.sql"));
        assert!(!fixture.repo_has("db_20240101_101010.sql"));

        Ok(())
    }

    #[test]
    fn invalid_entry_is_stuck() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.drop_file("no_extension_weirdname", true)?;

        let report = fixture.reconcile()?;
        assert_eq!(report.processed, 0);
        assert_eq!(
            report.stuck,
            vec![fixture.layout.inbox.join("no_extension_weirdname")]
        );
        assert!(fixture.inbox_has("no_extension_weirdname"));
        assert!(fixture.inbox_has("no_extension_weirdname.complete"));

        // Stays stuck on every later pass.
        let report = fixture.reconcile()?;
        assert_eq!(report.stuck.len(), 1);

        Ok(())
    }

    #[test]
    fn directory_entry_is_skipped() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        create_dir(fixture.layout.inbox.join("nested.d"))?;
        write(fixture.layout.inbox.join("nested.d.complete"), "")?;

        let report = fixture.reconcile()?;
        assert_eq!(report.processed, 0);
        assert!(fixture.inbox_has("nested.d"));
        assert!(fixture.inbox_has("nested.d.complete"));

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlink_entry_is_skipped() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.drop_file("real_20240101_101010.sql", false)?;
        std::os::unix::fs::symlink(
            fixture.layout.inbox.join("real_20240101_101010.sql"),
            fixture.layout.inbox.join("link_20240101_101010.sql"),
        )?;
        write(fixture.layout.inbox.join("link_20240101_101010.sql.complete"), "")?;

        let report = fixture.reconcile()?;
        assert_eq!(report.processed, 0);
        assert!(fixture.inbox_has("link_20240101_101010.sql"));

        Ok(())
    }

    #[test]
    fn missing_inbox_is_fatal() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let result = reconcile(root.path().join("nope"), root.path(), now());
        assert!(matches!(result, Err(InboxError::ReadDir { .. })));

        Ok(())
    }

    #[test]
    fn unwritable_repo_is_fatal() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fixture.drop_file("db_20240101_101010.sql", true)?;
        let result = reconcile(
            &fixture.layout.inbox,
            fixture.layout.repo.join("missing"),
            now(),
        );
        assert!(matches!(result, Err(InboxError::Move { .. })));

        Ok(())
    }

    #[test]
    fn prepare_creates_layout_once() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let layout = InboxLayout::new(root.path());
        layout.prepare()?;
        write(layout.inbox.join(README_NAME), "custom")?;
        layout.prepare()?;

        assert!(layout.repo.is_dir());
        assert_eq!(read_to_string(layout.inbox.join(README_NAME))?, "custom");

        Ok(())
    }
}

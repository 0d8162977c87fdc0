// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Archive retention.
//!
//! Archive files carry a sortable `YYYYMMDD_HHMMSS` timestamp in their name, so
//! sorting a directory listing by name also sorts it from oldest to newest.
//! Retention exploits this by always deleting from the front of the sorted
//! listing. The directory listing is the only source of truth, nothing about
//! previous runs is remembered.
//!
//! # Policies
//!
//! There are two independent policies:
//!
//! 1. __Keep count__: retain the `n` newest archives and delete the rest.
//! 2. __Reserve free space__: delete oldest archives until the volume holding
//!    them has at least the requested number of free bytes, or until no
//!    archives are left to delete.
//!
//! When both are requested, keep count always runs first.

use crate::volume::{DiskUsage, LocalVolume, Volume};

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// Rule deciding which archive files get deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Retain this many of the newest archives.
    KeepCount(usize),

    /// Delete oldest archives until this many bytes are free.
    ReserveFreeSpace(u64),
}

impl RetentionPolicy {
    fn rank(&self) -> u8 {
        match self {
            Self::KeepCount(_) => 0,
            Self::ReserveFreeSpace(_) => 1,
        }
    }
}

/// Archives deleted by a retention pass.
///
/// On a dry run this lists archives that _would_ have been deleted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted: Vec<PathBuf>,
}

/// Apply retention policies to a directory of archives.
#[derive(Debug, Default)]
pub struct RetentionManager<V = LocalVolume>
where
    V: Volume,
{
    volume: V,
    dry_run: bool,
}

impl<V> RetentionManager<V>
where
    V: Volume,
{
    /// Construct new retention manager on top of target volume.
    pub fn new(volume: V) -> Self {
        Self {
            volume,
            dry_run: false,
        }
    }

    /// Only narrate deletions instead of performing them.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Access underlying volume.
    pub fn volume(&self) -> &V {
        &self.volume
    }

    /// Apply many policies in one pass.
    ///
    /// Keep count policies are applied before free space reservations no
    /// matter the order they were given in.
    ///
    /// # Errors
    ///
    /// - Return [`RetentionError::Volume`] if listing, deleting, or disk usage
    ///   queries fail.
    pub fn apply(
        &self,
        dir: impl AsRef<Path>,
        pattern: &str,
        policies: impl IntoIterator<Item = RetentionPolicy>,
    ) -> Result<RetentionReport> {
        let mut policies = policies.into_iter().collect::<Vec<_>>();
        policies.sort_by_key(RetentionPolicy::rank);

        let mut report = RetentionReport::default();
        for policy in policies {
            match policy {
                RetentionPolicy::KeepCount(keep) => {
                    self.keep_count_pass(dir.as_ref(), pattern, keep, &mut report)?
                }
                RetentionPolicy::ReserveFreeSpace(bytes) => {
                    self.reserve_pass(dir.as_ref(), pattern, bytes, &mut report)?
                }
            }
        }

        Ok(report)
    }

    /// Delete oldest archives until at most `keep` remain.
    ///
    /// # Errors
    ///
    /// - Return [`RetentionError::Volume`] if listing or deleting fails.
    pub fn apply_keep_count(
        &self,
        dir: impl AsRef<Path>,
        pattern: &str,
        keep: usize,
    ) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();
        self.keep_count_pass(dir.as_ref(), pattern, keep, &mut report)?;

        Ok(report)
    }

    /// Delete oldest archives until volume has at least `reserved` bytes free.
    ///
    /// Stops without error when every matching archive is gone even if the
    /// reservation still is not met. Callers that need a hard guarantee must
    /// query free space afterwards.
    ///
    /// # Errors
    ///
    /// - Return [`RetentionError::Volume`] if listing, deleting, or disk usage
    ///   queries fail.
    pub fn reserve_free_space(
        &self,
        dir: impl AsRef<Path>,
        pattern: &str,
        reserved: u64,
    ) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();
        self.reserve_pass(dir.as_ref(), pattern, reserved, &mut report)?;

        Ok(report)
    }

    #[instrument(skip(self, report), level = "debug")]
    fn keep_count_pass(
        &self,
        dir: &Path,
        pattern: &str,
        keep: usize,
        report: &mut RetentionReport,
    ) -> Result<()> {
        let mut files = self.candidates(dir, pattern, report)?;
        info!("delete old files: keep={keep}, files={files:?}");

        while files.len() > keep {
            let Some(file) = files.pop_front() else {
                break;
            };
            self.delete(&file)?;
            report.deleted.push(file);
        }
        info!("deleting old files completed");

        Ok(())
    }

    #[instrument(skip(self, report), level = "debug")]
    fn reserve_pass(
        &self,
        dir: &Path,
        pattern: &str,
        reserved: u64,
        report: &mut RetentionReport,
    ) -> Result<()> {
        let mut files = self.candidates(dir, pattern, report)?;
        info!("old files: {files:?}");
        info!("allocate free area: {} GiB", DiskUsage::as_gib(reserved));

        // INVARIANT: Dry runs pretend planned deletions already freed their size.
        let mut reclaimed = 0u64;
        if self.dry_run {
            for file in &report.deleted {
                reclaimed = reclaimed.saturating_add(self.volume.file_size(file)?);
            }
        }

        let mut deleted_here = false;
        while !files.is_empty() {
            let usage = self.volume.disk_usage(dir)?;
            let free = usage.free.saturating_add(reclaimed);
            info!(
                "total: {} GiB, used: {} GiB, free: {} GiB",
                DiskUsage::as_gib(usage.total),
                DiskUsage::as_gib(usage.used.saturating_sub(reclaimed)),
                DiskUsage::as_gib(free),
            );
            if free >= reserved {
                break;
            }

            let Some(file) = files.pop_front() else {
                break;
            };
            if self.dry_run {
                reclaimed = reclaimed.saturating_add(self.volume.file_size(&file)?);
            }
            self.delete(&file)?;
            report.deleted.push(file);
            deleted_here = true;
        }

        if files.is_empty() && deleted_here {
            let usage = self.volume.disk_usage(dir)?;
            if usage.free.saturating_add(reclaimed) < reserved {
                warn!(
                    "no archives left to delete, free area is still below {} GiB",
                    DiskUsage::as_gib(reserved)
                );
            }
        }
        info!("allocating free area completed");

        Ok(())
    }

    // Archives already planned for deletion are hidden, which only matters on
    // dry runs where they still exist.
    fn candidates(
        &self,
        dir: &Path,
        pattern: &str,
        report: &RetentionReport,
    ) -> Result<VecDeque<PathBuf>> {
        Ok(self
            .volume
            .list_archives(dir, pattern)?
            .into_iter()
            .filter(|file| !report.deleted.contains(file))
            .collect())
    }

    fn delete(&self, file: &Path) -> Result<()> {
        if self.dry_run {
            info!("delete {} (dry run)", file.display());
            return Ok(());
        }

        info!("delete {}", file.display());
        self.volume.remove_file(file)?;

        Ok(())
    }
}

/// Retention error types.
#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    /// Filesystem interaction fails.
    #[error(transparent)]
    Volume(#[from] crate::volume::VolumeError),
}

/// Friendly result alias :3
pub type Result<T, E = RetentionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeError;

    use glob::Pattern;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::{
        cell::{Cell, RefCell},
        collections::BTreeMap,
    };

    const ARCHIVE: &str = "*.tar.bz2";

    /// In-memory volume whose free space is capacity minus stored file sizes.
    #[derive(Debug, Default)]
    struct FakeVolume {
        capacity: u64,
        files: RefCell<BTreeMap<PathBuf, u64>>,
        probes: Cell<usize>,
        read_only: Cell<bool>,
    }

    impl FakeVolume {
        fn new(capacity: u64, files: impl IntoIterator<Item = (&'static str, u64)>) -> Self {
            Self {
                capacity,
                files: RefCell::new(
                    files
                        .into_iter()
                        .map(|(name, size)| (Path::new("/bkup").join(name), size))
                        .collect(),
                ),
                probes: Cell::new(0),
                read_only: Cell::new(false),
            }
        }

        fn names(&self) -> Vec<String> {
            self.files
                .borrow()
                .keys()
                .filter_map(|path| path.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .collect()
        }
    }

    impl Volume for FakeVolume {
        fn list_archives(&self, dir: &Path, pattern: &str) -> crate::volume::Result<Vec<PathBuf>> {
            let matcher = Pattern::new(pattern).map_err(|err| VolumeError::Pattern {
                source: err,
                pattern: pattern.into(),
            })?;

            Ok(self
                .files
                .borrow()
                .keys()
                .filter(|path| path.parent() == Some(dir))
                .filter(|path| {
                    path.file_name()
                        .map(|name| matcher.matches(&name.to_string_lossy()))
                        .unwrap_or(false)
                })
                .cloned()
                .collect())
        }

        fn remove_file(&self, path: &Path) -> crate::volume::Result<()> {
            if self.read_only.get() {
                return Err(VolumeError::Remove {
                    source: std::io::ErrorKind::PermissionDenied.into(),
                    path: path.to_path_buf(),
                });
            }

            self.files
                .borrow_mut()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| VolumeError::Remove {
                    source: std::io::ErrorKind::NotFound.into(),
                    path: path.to_path_buf(),
                })
        }

        fn file_size(&self, path: &Path) -> crate::volume::Result<u64> {
            self.files
                .borrow()
                .get(path)
                .copied()
                .ok_or_else(|| VolumeError::Metadata {
                    source: std::io::ErrorKind::NotFound.into(),
                    path: path.to_path_buf(),
                })
        }

        fn disk_usage(&self, _dir: &Path) -> crate::volume::Result<DiskUsage> {
            self.probes.set(self.probes.get() + 1);
            let used = self.files.borrow().values().sum::<u64>();
            Ok(DiskUsage {
                total: self.capacity,
                used,
                free: self.capacity - used,
            })
        }
    }

    fn three_days() -> FakeVolume {
        FakeVolume::new(
            100,
            [
                ("a_20240101_000000.tar.bz2", 10),
                ("a_20240102_000000.tar.bz2", 20),
                ("a_20240103_000000.tar.bz2", 30),
            ],
        )
    }

    #[test]
    fn keep_count_deletes_oldest_first() -> anyhow::Result<()> {
        let manager = RetentionManager::new(three_days());
        let report = manager.apply_keep_count("/bkup", ARCHIVE, 1)?;

        assert_eq!(
            report.deleted,
            vec![
                PathBuf::from("/bkup/a_20240101_000000.tar.bz2"),
                PathBuf::from("/bkup/a_20240102_000000.tar.bz2"),
            ]
        );
        assert_eq!(manager.volume().names(), vec!["a_20240103_000000.tar.bz2"]);

        Ok(())
    }

    #[test_case(0, 0; "keep none")]
    #[test_case(1, 1; "keep one")]
    #[test_case(2, 2; "keep some")]
    #[test_case(3, 3; "keep exactly all")]
    #[test_case(10, 3; "keep more than present")]
    #[test]
    fn keep_count_leaves_newest(keep: usize, remaining: usize) -> anyhow::Result<()> {
        let manager = RetentionManager::new(three_days());
        manager.apply_keep_count("/bkup", ARCHIVE, keep)?;

        let all = [
            "a_20240101_000000.tar.bz2",
            "a_20240102_000000.tar.bz2",
            "a_20240103_000000.tar.bz2",
        ];
        let expect = all[all.len() - remaining..].to_vec();
        pretty_assertions::assert_eq!(manager.volume().names(), expect);

        Ok(())
    }

    #[test]
    fn keep_count_is_idempotent() -> anyhow::Result<()> {
        let manager = RetentionManager::new(three_days());
        manager.apply_keep_count("/bkup", ARCHIVE, 2)?;
        let once = manager.volume().names();
        let report = manager.apply_keep_count("/bkup", ARCHIVE, 2)?;

        assert!(report.deleted.is_empty());
        assert_eq!(manager.volume().names(), once);

        Ok(())
    }

    #[test]
    fn keep_count_ignores_other_patterns() -> anyhow::Result<()> {
        let volume = FakeVolume::new(
            100,
            [
                ("a_20240101_000000.tar.bz2", 10),
                ("a_20240101_000000.tar.bz2.md5sum", 1),
                ("latest", 0),
            ],
        );
        let manager = RetentionManager::new(volume);
        manager.apply_keep_count("/bkup", ARCHIVE, 0)?;

        assert_eq!(
            manager.volume().names(),
            vec!["a_20240101_000000.tar.bz2.md5sum", "latest"]
        );

        Ok(())
    }

    #[test]
    fn reserve_stops_once_threshold_met() -> anyhow::Result<()> {
        // 40 free; deleting the 10 byte archive frees exactly enough.
        let manager = RetentionManager::new(three_days());
        let report = manager.reserve_free_space("/bkup", ARCHIVE, 50)?;

        assert_eq!(report.deleted, vec![PathBuf::from("/bkup/a_20240101_000000.tar.bz2")]);
        assert_eq!(manager.volume().names().len(), 2);

        Ok(())
    }

    #[test]
    fn reserve_deletes_nothing_when_already_free() -> anyhow::Result<()> {
        let manager = RetentionManager::new(three_days());
        let report = manager.reserve_free_space("/bkup", ARCHIVE, 40)?;

        assert!(report.deleted.is_empty());
        assert_eq!(manager.volume().probes.get(), 1);

        Ok(())
    }

    #[test]
    fn reserve_compares_full_precision_bytes() -> anyhow::Result<()> {
        // One byte short must still trigger a deletion.
        let manager = RetentionManager::new(three_days());
        let report = manager.reserve_free_space("/bkup", ARCHIVE, 41)?;

        assert_eq!(report.deleted.len(), 1);

        Ok(())
    }

    #[test]
    fn reserve_unreachable_threshold_is_not_an_error() -> anyhow::Result<()> {
        let manager = RetentionManager::new(three_days());
        let report = manager.reserve_free_space("/bkup", ARCHIVE, 1_000)?;

        assert_eq!(report.deleted.len(), 3);
        assert!(manager.volume().names().is_empty());

        Ok(())
    }

    #[test]
    fn reserve_with_no_archives_never_probes() -> anyhow::Result<()> {
        let manager = RetentionManager::new(FakeVolume::new(100, Vec::<(&'static str, u64)>::new()));
        let report = manager.reserve_free_space("/bkup", ARCHIVE, 1_000)?;

        assert!(report.deleted.is_empty());
        assert_eq!(manager.volume().probes.get(), 0);

        Ok(())
    }

    #[test]
    fn dry_run_plans_without_deleting() -> anyhow::Result<()> {
        let manager = RetentionManager::new(three_days()).with_dry_run(true);
        let kept = manager.apply_keep_count("/bkup", ARCHIVE, 2)?;
        let reserved = manager.reserve_free_space("/bkup", ARCHIVE, 65)?;

        assert_eq!(kept.deleted, vec![PathBuf::from("/bkup/a_20240101_000000.tar.bz2")]);
        assert_eq!(
            reserved.deleted,
            vec![
                PathBuf::from("/bkup/a_20240101_000000.tar.bz2"),
                PathBuf::from("/bkup/a_20240102_000000.tar.bz2"),
            ]
        );
        assert_eq!(manager.volume().names().len(), 3);

        Ok(())
    }

    #[test]
    fn apply_runs_keep_count_before_reserve() -> anyhow::Result<()> {
        let manager = RetentionManager::new(three_days());
        let report = manager.apply(
            "/bkup",
            ARCHIVE,
            [
                RetentionPolicy::ReserveFreeSpace(70),
                RetentionPolicy::KeepCount(2),
            ],
        )?;

        // Keep count removes the 10 byte archive, reserve then needs the 20 byte one.
        assert_eq!(
            report.deleted,
            vec![
                PathBuf::from("/bkup/a_20240101_000000.tar.bz2"),
                PathBuf::from("/bkup/a_20240102_000000.tar.bz2"),
            ]
        );
        assert_eq!(manager.volume().names(), vec!["a_20240103_000000.tar.bz2"]);

        Ok(())
    }

    #[test]
    fn dry_run_apply_matches_real_run() -> anyhow::Result<()> {
        let policies = [
            RetentionPolicy::KeepCount(2),
            RetentionPolicy::ReserveFreeSpace(70),
        ];
        let dry = RetentionManager::new(three_days()).with_dry_run(true);
        let real = RetentionManager::new(three_days());

        let planned = dry.apply("/bkup", ARCHIVE, policies)?;
        let performed = real.apply("/bkup", ARCHIVE, policies)?;

        assert_eq!(planned, performed);
        assert_eq!(dry.volume().names().len(), 3);

        Ok(())
    }

    #[test]
    fn delete_failure_aborts_pass() {
        let manager = RetentionManager::new(three_days());
        manager.volume().read_only.set(true);
        let result = manager.apply_keep_count("/bkup", ARCHIVE, 0);

        assert!(matches!(
            result,
            Err(RetentionError::Volume(VolumeError::Remove { .. }))
        ));
        assert_eq!(manager.volume().names().len(), 3);
    }
}

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backup jobs for small servers.
//!
//! Oxibak is a set of short lived jobs meant to be started by a scheduler.
//! Every job orchestrates ordinary external tools like `rsync`, `tar`, and
//! `mountpoint`, and keeps its own bookkeeping to plain filesystem work:
//!
//! - __Archival backup__ syncs a source tree into a staging directory, dumps a
//!   database beside it, then packs everything into a timestamped archive.
//! - __Retention__ prunes old archives by keep count, or until enough free
//!   space is reserved on the archive volume.
//! - __Inbox reconciliation__ moves uploaded archives that carry a `.complete`
//!   marker into a repository directory, normalizing their names on the way.
//! - __Compose dumps__ run `mongodump` inside Docker Compose projects.
//! - __Hooks__ wrap any scheduled command with success and failure follow ups.
//!
//! There is no persistent state across runs. Archive names sort
//! lexicographically in creation order, which is all retention relies on.

pub mod backup;
pub mod compose;
pub mod config;
pub mod exec;
pub mod inbox;
pub mod path;
pub mod retention;
pub mod volume;
pub mod wrapper;

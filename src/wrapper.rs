// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Scheduled job hooks.
//!
//! Wrap a primary shell command with optional follow up commands that run
//! depending on how the primary command went. Hooks are best effort, their
//! failures are reported but never change the outcome of the primary command.

use crate::exec::{CommandLine, ExecError, ProcessRunner};

use tracing::{instrument, warn};

/// Shell command lines making up a wrapped job.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HookedJob {
    /// Command line to execute.
    pub primary: String,

    /// Command line to execute after primary succeeds.
    pub on_ok: Option<String>,

    /// Command line to execute after primary fails.
    pub on_fail: Option<String>,
}

/// Outcome of a wrapped job.
#[derive(Debug, Default)]
pub struct HookOutcome {
    /// Failure of primary command, if any.
    pub primary_error: Option<ExecError>,

    /// Failure of whichever hook ran, if any.
    pub hook_error: Option<ExecError>,
}

impl HookOutcome {
    /// Primary command succeeded.
    pub fn succeeded(&self) -> bool {
        self.primary_error.is_none()
    }

    /// Convert outcome into result of the wrapped job.
    ///
    /// Failing primary commands are normally absorbed, because the failure
    /// hook is the notification channel. A primary command that could not
    /// even be started is always reported.
    ///
    /// # Errors
    ///
    /// - Return [`ExecError`] if primary command failed to start, or failed
    ///   at all when `propagate` is set.
    pub fn into_result(self, propagate: bool) -> Result<(), ExecError> {
        match self.primary_error {
            Some(err @ ExecError::Spawn { .. }) => Err(err),
            Some(err) if propagate => Err(err),
            _ => Ok(()),
        }
    }
}

/// Run primary command, then best effort success or failure hook.
#[instrument(skip(runner, job), level = "debug")]
pub fn run_with_hooks(runner: &impl ProcessRunner, job: &HookedJob) -> HookOutcome {
    let mut outcome = HookOutcome::default();

    let hook = match runner.run(&CommandLine::shell(job.primary.as_str()), None) {
        Ok(()) => job.on_ok.as_deref(),
        Err(err) => {
            warn!("{err}");
            outcome.primary_error = Some(err);
            job.on_fail.as_deref()
        }
    };

    if let Some(line) = hook {
        if let Err(err) = runner.run(&CommandLine::shell(line), None) {
            warn!("hook failed: {err}");
            outcome.hook_error = Some(err);
        }
    }

    outcome
}

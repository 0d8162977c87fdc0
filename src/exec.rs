// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External process invocation.
//!
//! Every heavy lifting step of a backup run is delegated to an external tool,
//! e.g., `mountpoint`, `rsync`, `tar`, a database dump command, `docker`, etc.
//! Oxibak never inspects the output of these tools. It only cares whether the
//! tool exited successfully, and aborts the run on the first failure.
//!
//! The [`ProcessRunner`] trait is the seam between workflow logic and the
//! system. Workflows only ever talk to a runner, so tests can substitute a fake
//! that records command lines instead of spawning anything.

use std::{
    ffi::{OsStr, OsString},
    fmt::{Display, Formatter, Result as FmtResult},
    fs::File,
    path::Path,
    process::{Command, Stdio},
};
use tracing::info;

/// Argument vector of an external command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandLine {
    /// Construct new command line for target program.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Construct command line that hands a free-form line to `sh -c`.
    pub fn shell(line: impl Into<OsString>) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append many arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program to execute.
    pub fn program(&self) -> &OsStr {
        self.program.as_os_str()
    }

    /// Arguments handed to program.
    pub fn arguments(&self) -> &[OsString] {
        self.args.as_slice()
    }
}

impl Display for CommandLine {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.program.to_string_lossy().as_ref())?;
        for arg in &self.args {
            write!(fmt, " {}", arg.to_string_lossy())?;
        }

        Ok(())
    }
}

/// Execute external commands.
pub trait ProcessRunner {
    /// Run command to completion.
    ///
    /// Standard output of the child is connected to `stdout` when given,
    /// otherwise it is inherited from the current process.
    ///
    /// # Errors
    ///
    /// - Return [`ExecError::Spawn`] if command cannot be started.
    /// - Return [`ExecError::Status`] if command exits unsuccessfully.
    fn run(&self, cmd: &CommandLine, stdout: Option<File>) -> Result<()>;
}

impl<R> ProcessRunner for &R
where
    R: ProcessRunner + ?Sized,
{
    fn run(&self, cmd: &CommandLine, stdout: Option<File>) -> Result<()> {
        (**self).run(cmd, stdout)
    }
}

/// Run commands as child processes of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    /// Construct new system runner.
    pub fn new() -> Self {
        Self
    }
}

impl ProcessRunner for SystemRunner {
    fn run(&self, cmd: &CommandLine, stdout: Option<File>) -> Result<()> {
        info!("EXEC: {cmd}");
        let mut command = Command::new(cmd.program());
        command.args(cmd.arguments());
        if let Some(file) = stdout {
            info!("(stdout is redirected)");
            command.stdout(Stdio::from(file));
        }

        let status = command
            .spawn()
            .and_then(|mut child| child.wait())
            .map_err(|err| ExecError::Spawn {
                source: err,
                command: cmd.to_string(),
            })?;

        if !status.success() {
            return Err(ExecError::Status {
                command: cmd.to_string(),
                code: status.code(),
            });
        }

        Ok(())
    }
}

/// Require target path to be a mountpoint.
///
/// Backups written to an unmounted backup volume silently land on the root
/// filesystem instead, so every job checks its volume first when asked to.
///
/// # Errors
///
/// - Return [`ExecError`] if `mountpoint` cannot run, or path is not a
///   mountpoint.
pub fn mount_check(runner: &impl ProcessRunner, path: impl AsRef<Path>) -> Result<()> {
    info!("destination mount check...");
    runner.run(
        &CommandLine::new("mountpoint").arg(path.as_ref().as_os_str()),
        None,
    )
}

/// Process execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Command could not be started at all.
    #[error("failed to execute {command:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        command: String,
    },

    /// Command ran, but reported failure.
    #[error("command {command:?} failed with {}", describe_code(.code))]
    Status { command: String, code: Option<i32> },
}

impl ExecError {
    /// Exit code reported by failing command.
    ///
    /// Commands killed by a signal, or commands that never started, have no
    /// exit code.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Spawn { .. } => None,
            Self::Status { code, .. } => *code,
        }
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "termination by signal".into(),
    }
}

/// Friendly result alias :3
pub type Result<T, E = ExecError> = std::result::Result<T, E>;


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_line_display_joins_arguments() {
        let cmd = CommandLine::new("rsync")
            .args(["-aur", "--stats", "--delete"])
            .arg("/src")
            .arg("/dst/backup");
        assert_eq!(cmd.to_string(), "rsync -aur --stats --delete /src /dst/backup");
    }

    #[test]
    fn command_line_shell_wraps_line() {
        let cmd = CommandLine::shell("echo hi && false");
        assert_eq!(cmd.program(), "sh");
        assert_eq!(cmd.arguments(), &["-c".into(), OsString::from("echo hi && false")]);
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_reports_exit_code() {
        let result = SystemRunner::new().run(&CommandLine::shell("exit 3"), None);
        match result {
            Err(err @ ExecError::Status { .. }) => assert_eq!(err.exit_code(), Some(3)),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_redirects_stdout() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.txt");
        let file = File::create(&path)?;
        SystemRunner::new().run(&CommandLine::shell("printf hello"), Some(file))?;
        assert_eq!(std::fs::read_to_string(&path)?, "hello");

        Ok(())
    }

    #[test]
    fn mount_check_runs_mountpoint() {
        let runner = fake::FakeRunner::new();
        mount_check(&runner, "/mnt/bkup").unwrap();
        assert_eq!(runner.history(), vec!["mountpoint /mnt/bkup"]);
    }

    #[test]
    fn system_runner_reports_spawn_failure() {
        let result = SystemRunner::new().run(&CommandLine::new("/nonexistent/oxibak-tool"), None);
        assert!(matches!(result, Err(ExecError::Spawn { .. })));
    }
}

//! A wrapper for external commands which logs a human readable
//! description of what is happening before running it.

use std::ffi::OsStr;
use std::process::{Command, Stdio};

use anyhow::Result;
use camino::Utf8Path;
use zfs_install_utils::CommandRunExt;

#[derive(Debug)]
pub(crate) struct Task {
    description: String,
    quiet: bool,
    quiet_output: bool,
    pub(crate) cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<OsStr>) -> Self {
        Self::new_cmd(description, Command::new(exe))
    }

    pub(crate) fn new_cmd(description: impl AsRef<str>, mut cmd: Command) -> Self {
        let description = description.as_ref().to_string();
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            quiet_output: false,
            cmd,
        }
    }

    /// Log the description at debug level instead of info.
    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Discard the child's stdout.
    pub(crate) fn quiet_output(mut self) -> Self {
        self.quiet_output = true;
        self
    }

    /// Run the child with `root` as its root directory, via chroot(8).
    pub(crate) fn new_chroot(
        description: impl AsRef<str>,
        root: &Utf8Path,
        exe: impl AsRef<OsStr>,
    ) -> Self {
        let mut cmd = Command::new("chroot");
        cmd.arg(root).arg(exe);
        Self::new_cmd(description, cmd)
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    pub(crate) fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.cmd.args([arg]);
        self
    }

    fn announce(&mut self) {
        let description = &self.description;
        if self.quiet {
            tracing::debug!("{description}");
        } else {
            tracing::info!("{description}");
        }
        if self.quiet_output {
            self.cmd.stdout(Stdio::null());
        }
    }

    /// Run the command, returning an error if it exits unsuccessfully.
    pub(crate) fn run(mut self) -> Result<()> {
        self.announce();
        self.cmd.run_capture_stderr()
    }

    /// Like [`Self::run`], but feed `input` to the child's stdin.
    pub(crate) fn run_with_stdin(mut self, input: &[u8]) -> Result<()> {
        self.announce();
        self.cmd.run_with_stdin(input)
    }

    pub(crate) fn new_and_run<'a>(
        description: impl AsRef<str>,
        exe: impl AsRef<OsStr>,
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let mut t = Self::new(description.as_ref(), exe);
        t.cmd.args(args);
        t.run()
    }
}

/// The arguments of `cmd` joined with spaces, unquoted.
#[cfg(test)]
pub(crate) fn command_args(cmd: &Command) -> String {
    cmd.get_args()
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

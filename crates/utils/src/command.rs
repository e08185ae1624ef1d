//! Helpers intended for [`std::process::Command`] and related structures.

use std::io::Write;
use std::process::{Command, ExitStatus, Output, Stdio};

use anyhow::{Context, Result};

/// An external tool returned a non-zero exit status.
///
/// None of the tools we drive are safe to blindly retry after a partial
/// failure, so this is always fatal to the caller.
#[derive(Debug, thiserror::Error)]
#[error("{command} failed with {status}: {stderr}")]
pub struct ToolInvocationFailed {
    /// The shell-quoted command line.
    pub command: String,
    /// How the child exited.
    pub status: ExitStatus,
    /// Trimmed stderr of the child, if it was captured.
    pub stderr: String,
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process; on failure the captured stderr
    /// is included in the error.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process, feeding `input` on stdin. Use this for
    /// secrets and scripted tool input; never put those in argv.
    fn run_with_stdin(&mut self, input: &[u8]) -> Result<()>;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute a query whose "nothing found" answer is reported through one
    /// of the `absent_codes` exit statuses. Returns `None` in that case,
    /// stdout on success, and an error for any other status.
    fn run_optional(&mut self, absent_codes: &[i32]) -> Result<Option<String>>;

    /// Render the command line in a form that can be pasted into a shell.
    fn to_string_pretty(&self) -> String;
}

fn check_output(cmd: &Command, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(ToolInvocationFailed {
        command: cmd.to_string_pretty(),
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
    .into())
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let desc = self.to_string_pretty();
        let child = self
            .log_debug()
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Spawning {desc}"))?;
        let output = child
            .wait_with_output()
            .with_context(|| format!("Waiting for {desc}"))?;
        check_output(self, &output)
    }

    fn run_with_stdin(&mut self, input: &[u8]) -> Result<()> {
        let desc = self.to_string_pretty();
        let mut child = self
            .log_debug()
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Spawning {desc}"))?;
        // Dropping the handle closes the pipe so the child sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .with_context(|| format!("Writing stdin of {desc}"))?;
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("Waiting for {desc}"))?;
        check_output(self, &output)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let desc = self.to_string_pretty();
        let output = self
            .log_debug()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {desc}"))?;
        check_output(self, &output)?;
        String::from_utf8(output.stdout).with_context(|| format!("Parsing output of {desc}"))
    }

    fn run_optional(&mut self, absent_codes: &[i32]) -> Result<Option<String>> {
        let desc = self.to_string_pretty();
        let output = self
            .log_debug()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {desc}"))?;
        if let Some(code) = output.status.code() {
            if absent_codes.contains(&code) {
                tracing::trace!("{desc}: nothing found (exit {code})");
                return Ok(None);
            }
        }
        check_output(self, &output)?;
        let s = String::from_utf8(output.stdout)
            .with_context(|| format!("Parsing output of {desc}"))?;
        Ok(Some(s))
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|a| {
                let a = a.to_string_lossy();
                match shlex::try_quote(&a) {
                    Ok(q) => q.to_string(),
                    // Only happens with embedded NUL bytes
                    Err(_) => a.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_string_pretty() {
        let mut cmd = Command::new("zfs");
        cmd.args(["list", "-H", "-o", "name", "tank/ROOT/os"]);
        similar_asserts::assert_eq!(
            cmd.to_string_pretty(),
            "zfs list -H -o name tank/ROOT/os"
        );

        let mut cmd = Command::new("mount");
        cmd.args(["/dev/loop0p1", "/work dir/tank/boot"]);
        similar_asserts::assert_eq!(
            cmd.to_string_pretty(),
            "mount /dev/loop0p1 '/work dir/tank/boot'"
        );
    }

    #[test]
    fn test_run_optional() {
        let found = Command::new("sh")
            .args(["-c", "echo ext4"])
            .run_optional(&[2])
            .unwrap();
        assert_eq!(found.as_deref().map(str::trim), Some("ext4"));

        let absent = Command::new("sh")
            .args(["-c", "exit 2"])
            .run_optional(&[2])
            .unwrap();
        assert_eq!(absent, None);

        let err = Command::new("sh")
            .args(["-c", "echo broken >&2; exit 4"])
            .run_optional(&[2])
            .unwrap_err();
        let failed = err.downcast_ref::<ToolInvocationFailed>().unwrap();
        assert_eq!(failed.status.code(), Some(4));
        assert_eq!(failed.stderr, "broken");
    }

    #[test]
    fn test_run_with_stdin() {
        Command::new("sh")
            .args(["-c", "read line; test \"$line\" = secret"])
            .run_with_stdin(b"secret\n")
            .unwrap();

        let err = Command::new("sh")
            .args(["-c", "read line; test \"$line\" = secret"])
            .run_with_stdin(b"wrong\n")
            .unwrap_err();
        assert!(err.downcast_ref::<ToolInvocationFailed>().is_some());
    }

    #[test]
    fn test_run_capture_stderr() {
        Command::new("true").run_capture_stderr().unwrap();
        let err = Command::new("sh")
            .args(["-c", "echo oops >&2; false"])
            .run_capture_stderr()
            .unwrap_err();
        assert!(format!("{err}").contains("oops"));
    }
}

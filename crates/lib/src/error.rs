//! Errors raised by the install flow itself, as opposed to the block
//! device and subprocess errors of the lower level crates.

use std::fmt::Write as _;
use std::process::ExitStatus;

use camino::Utf8PathBuf;

use crate::ledger::Acquisition;

/// A release that failed while unwinding the ledger.
#[derive(Debug)]
pub struct UnwindFailure {
    /// What was being released.
    pub acquisition: Acquisition,
    /// The full error chain, rendered.
    pub error: String,
}

fn render_failures(failures: &[UnwindFailure]) -> String {
    let mut s = String::new();
    for f in failures {
        let _ = write!(s, "\n  {}: {}", f.acquisition, f.error);
    }
    s
}

/// Install failures not covered by the block device or command errors.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The operator pressed Ctrl-C.
    #[error("interrupted")]
    Interrupted,
    /// The emulated boot running the finalize script exited unsuccessfully.
    #[error("finalize boot of {kernel} exited with {status}; the image is not bootable")]
    FinalizeBootFailed {
        /// The kernel that was booted.
        kernel: Utf8PathBuf,
        /// Exit status of the emulator.
        status: ExitStatus,
    },
    /// One or more releases failed during cleanup. Every release was still
    /// attempted.
    #[error("{} of {} releases failed during cleanup:{}", .failures.len(), .attempted, render_failures(.failures))]
    UnwindFailed {
        /// How many releases were attempted.
        attempted: usize,
        /// The failures, in the order they were attempted.
        failures: Vec<UnwindFailure>,
    },
}

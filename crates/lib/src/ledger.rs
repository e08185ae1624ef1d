//! Tracking of the resources acquired by an install run.
//!
//! Every step which changes host state (attaching a loop device, opening
//! an encrypted volume, importing a pool, mounting) records how to undo
//! itself here, immediately after it succeeds. Unwinding releases the
//! records newest first.

use std::fmt::Display;

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::error::{InstallError, UnwindFailure};
use crate::task::Task;

/// A resource held by this run, identified by how to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// An attached loop device.
    LoopDetach(Utf8PathBuf),
    /// An open dm-crypt mapping, by name.
    EncryptedClose(String),
    /// An imported pool.
    PoolExport(String),
    /// A mount point.
    Unmount(Utf8PathBuf),
}

impl Display for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acquisition::LoopDetach(dev) => write!(f, "detach loop device {dev}"),
            Acquisition::EncryptedClose(name) => write!(f, "close encrypted volume {name}"),
            Acquisition::PoolExport(pool) => write!(f, "export pool {pool}"),
            Acquisition::Unmount(path) => write!(f, "unmount {path}"),
        }
    }
}

impl Acquisition {
    /// Release the resource on the host.
    pub(crate) fn release(&self) -> Result<()> {
        match self {
            Acquisition::LoopDetach(dev) => {
                tracing::info!("Detaching {dev}");
                crate::blockdev::detach_loop(dev)
            }
            Acquisition::EncryptedClose(name) => Task::new_and_run(
                format!("Closing encrypted volume {name}"),
                "cryptsetup",
                ["luksClose", name.as_str()],
            ),
            Acquisition::PoolExport(pool) => Task::new_and_run(
                format!("Exporting pool {pool}"),
                "zpool",
                ["export", pool.as_str()],
            ),
            Acquisition::Unmount(path) => {
                tracing::info!("Unmounting {path}");
                zfs_install_mount::unmount(path)
            }
        }
    }
}

/// The ordered record of acquisitions.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    records: Vec<Acquisition>,
}

impl Ledger {
    pub(crate) fn record(&mut self, acquisition: Acquisition) {
        tracing::debug!("Acquired: will {acquisition} on cleanup");
        self.records.push(acquisition);
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Acquisition> {
        self.records.iter()
    }

    /// Release everything, newest first.
    pub(crate) fn unwind_all(&mut self) -> Result<()> {
        self.unwind_with(Acquisition::release)
    }

    /// Walk the records newest first, calling `release` on each.
    ///
    /// A failed release does not stop the walk. The ledger is empty
    /// afterwards either way.
    pub(crate) fn unwind_with<F>(&mut self, mut release: F) -> Result<()>
    where
        F: FnMut(&Acquisition) -> Result<()>,
    {
        let attempted = self.records.len();
        let mut failures = Vec::new();
        while let Some(acquisition) = self.records.pop() {
            if let Err(e) = release(&acquisition) {
                tracing::error!("Failed to {acquisition}: {e:#}");
                failures.push(UnwindFailure {
                    acquisition,
                    error: format!("{e:#}"),
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(InstallError::UnwindFailed {
                attempted,
                failures,
            }
            .into())
        }
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        for acquisition in self.records.iter().rev() {
            tracing::warn!("Leaving in place; to clean up manually: {acquisition}");
        }
    }
}

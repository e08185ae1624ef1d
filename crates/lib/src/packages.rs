//! Installing packages into the target root.

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use zfs_install_utils::CommandRunExt;

use crate::task::Task;

/// The base system, installed from the host into an empty root.
pub(crate) const BASE_PACKAGES: &[&str] = &[
    "basesystem",
    "bash",
    "coreutils",
    "dnf",
    "passwd",
    "rootfiles",
    "shadow-utils",
    "systemd",
    "util-linux",
    "vim-minimal",
    "NetworkManager",
    "cryptsetup",
    "rsync",
];

/// Provides the repository the ZFS packages come from.
pub(crate) const ZFS_RELEASE_PACKAGE: &str = "zfs-release";

/// The kernel, the pool support and the bootloader, installed from
/// inside the target.
pub(crate) const BOOT_PACKAGES: &[&str] = &[
    "kernel",
    "kernel-devel",
    "zfs",
    "zfs-dracut",
    "dracut",
    "grub2-pc",
    "grub2-tools",
];

/// Where to run the package manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PackageScope {
    /// The host's dnf, pointed at the target with `--installroot`.
    InstallRoot {
        /// The Fedora release to install.
        releasever: u32,
    },
    /// The target's own dnf, via chroot.
    Chroot,
}

/// The URL of the zfs-release package for Fedora `releasever`.
pub(crate) fn zfs_release_url(releasever: u32) -> String {
    format!("https://zfsonlinux.org/fedora/zfs-release-2-5.fc{releasever}.noarch.rpm")
}

/// Parse the packages `rpm -q` reported as missing.
fn parse_missing(rpm_output: &str) -> Vec<String> {
    rpm_output
        .lines()
        .filter_map(|l| {
            l.trim()
                .strip_prefix("package ")?
                .strip_suffix(" is not installed")
        })
        .map(String::from)
        .collect()
}

/// The packages of `packages` which are not installed in `root`.
#[context("Querying installed packages")]
pub(crate) fn missing_packages(root: &Utf8Path, packages: &[&str]) -> Result<Vec<String>> {
    // rpm -q exits with the number of missing packages, so the status
    // alone cannot tell a query error apart.
    let mut cmd = Command::new("rpm");
    cmd.arg("--root").arg(root).arg("-q").args(packages);
    let out = cmd.log_debug().output().context("Spawning rpm")?;
    let missing = parse_missing(&String::from_utf8_lossy(&out.stdout));
    if !out.status.success() && missing.is_empty() {
        anyhow::bail!(
            "rpm -q failed with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(missing)
}

fn install_task(root: &Utf8Path, specs: &[&str], scope: PackageScope) -> Task {
    let description = format!("Installing {}", specs.join(" "));
    let t = match scope {
        PackageScope::InstallRoot { releasever } => Task::new(description, "dnf").args([
            "-y".to_string(),
            format!("--installroot={root}"),
            format!("--releasever={releasever}"),
            "install".to_string(),
        ]),
        PackageScope::Chroot => Task::new_chroot(description, root, "dnf").args(["-y", "install"]),
    };
    t.args(specs)
}

/// The package manager run needed when `missing` are not installed, if any.
fn plan_install(
    root: &Utf8Path,
    missing: &[String],
    install: &[&str],
    scope: PackageScope,
) -> Option<Task> {
    if missing.is_empty() {
        return None;
    }
    tracing::debug!("Missing packages: {}", missing.join(" "));
    Some(install_task(root, install, scope))
}

fn ensure_installed(
    root: &Utf8Path,
    query: &[&str],
    install: &[&str],
    scope: PackageScope,
) -> Result<bool> {
    let missing = missing_packages(root, query)?;
    match plan_install(root, &missing, install, scope) {
        Some(task) => {
            task.run()?;
            Ok(true)
        }
        None => {
            tracing::debug!("Already installed: {}", query.join(" "));
            Ok(false)
        }
    }
}

/// Install `packages` into `root` if any of them is missing.
/// Returns `true` if the package manager ran.
#[context("Installing packages into {root}")]
pub(crate) fn ensure_packages_installed(
    root: &Utf8Path,
    packages: &[&str],
    scope: PackageScope,
) -> Result<bool> {
    ensure_installed(root, packages, packages, scope)
}

/// Install the package providing the ZFS repository from its URL.
#[context("Installing ZFS repository")]
pub(crate) fn ensure_zfs_repository(root: &Utf8Path, releasever: u32) -> Result<bool> {
    let url = zfs_release_url(releasever);
    ensure_installed(
        root,
        &[ZFS_RELEASE_PACKAGE],
        &[url.as_str()],
        PackageScope::Chroot,
    )
}

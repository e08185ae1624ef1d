//! Helpers for interacting with mountpoints

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

use zfs_install_utils::CommandRunExt;

/// findmnt exits with this status when no filesystem matched.
const FINDMNT_NOT_FOUND: i32 = 1;

/// A mounted filesystem, as reported by `findmnt`.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Filesystem {
    /// The mounted device or pseudo-filesystem name.
    pub source: String,
    /// The mount point.
    pub target: String,
    /// Filesystem type.
    pub fstype: String,
    /// Mount options.
    pub options: String,
}

#[derive(Deserialize, Debug)]
struct Findmnt {
    filesystems: Vec<Filesystem>,
}

fn parse_findmnt(s: &str) -> Result<Option<Filesystem>> {
    let o: Findmnt = serde_json::from_str(s).context("Parsing findmnt output")?;
    Ok(o.filesystems.into_iter().next())
}

/// Return the filesystem mounted exactly at `path`, if any.
#[context("Inspecting mount at {path}")]
pub fn inspect_mountpoint(path: &Utf8Path) -> Result<Option<Filesystem>> {
    let out = Command::new("findmnt")
        .args(["-J", "-v", "--output=SOURCE,TARGET,FSTYPE,OPTIONS", "--mountpoint"])
        .arg(path)
        .run_optional(&[FINDMNT_NOT_FOUND])?;
    out.as_deref().map(parse_findmnt).transpose().map(Option::flatten)
}

/// Whether something is mounted at `path`.
pub fn is_mountpoint(path: &Utf8Path) -> Result<bool> {
    let r = inspect_mountpoint(path)?;
    tracing::trace!("{path} mounted: {r:?}");
    Ok(r.is_some())
}

/// Mount `source` at `target`, optionally with an explicit filesystem type.
#[context("Mounting {source} at {target}")]
pub fn mount(source: &str, target: &Utf8Path, fstype: Option<&str>) -> Result<()> {
    let mut cmd = Command::new("mount");
    if let Some(fstype) = fstype {
        cmd.args(["-t", fstype]);
    }
    cmd.arg(source).arg(target).run_capture_stderr()
}

/// Unmount `target`.
#[context("Unmounting {target}")]
pub fn unmount(target: &Utf8Path) -> Result<()> {
    Command::new("umount").arg(target).run_capture_stderr()
}

//! ZFS pool and dataset management.

use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;
use zfs_install_utils::CommandRunExt;

use crate::blockdev;
use crate::ledger::{Acquisition, Ledger};
use crate::task::Task;

/// `zpool import` exits with this status when there is nothing to import.
const ZPOOL_IMPORT_NONE: i32 = 1;

/// The dataset holding the operating system.
pub(crate) const ROOT_DATASET: &str = "ROOT/os";
/// The swap volume, relative to the pool.
pub(crate) const SWAP_VOLUME: &str = "swap";

/// How `zpool` sees a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolState {
    /// Imported on this host.
    Imported,
    /// Found on a device and can be imported.
    Importable,
    /// Nowhere to be found.
    Absent,
}

/// Parse the names of pools offered by a bare `zpool import`.
fn parse_importable_pools(s: &str) -> Result<Vec<String>> {
    let re = Regex::new(r"(?m)^\s*pool:\s*(\S+)\s*$")?;
    Ok(re.captures_iter(s).map(|c| c[1].to_string()).collect())
}

fn list_names(output: &str) -> impl Iterator<Item = &str> {
    output.lines().map(str::trim).filter(|l| !l.is_empty())
}

#[context("Querying state of pool {name}")]
pub(crate) fn pool_state(name: &str) -> Result<PoolState> {
    let imported = Command::new("zpool")
        .args(["list", "-H", "-o", "name"])
        .run_get_string()?;
    if list_names(&imported).any(|n| n == name) {
        return Ok(PoolState::Imported);
    }
    let importable = Command::new("zpool")
        .arg("import")
        .run_optional(&[ZPOOL_IMPORT_NONE])?
        .unwrap_or_default();
    let state = if parse_importable_pools(&importable)?.iter().any(|n| n == name) {
        PoolState::Importable
    } else {
        PoolState::Absent
    };
    tracing::trace!("pool {name}: {state:?}");
    Ok(state)
}

/// The arguments to `zpool create` for a new pool.
fn create_args(name: &str, altroot: &Utf8Path, devices: &[Utf8PathBuf]) -> Vec<String> {
    let mut args: Vec<String> = [
        "create",
        "-m",
        "none",
        "-o",
        "ashift=12",
        "-O",
        "compression=on",
        "-O",
        "atime=off",
        "-O",
        "com.sun:auto-snapshot=false",
        "-R",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    args.push(altroot.to_string());
    args.push(name.to_string());
    args.extend(devices.iter().map(|d| d.to_string()));
    args
}

/// What [`ensure_pool`] does for a pool in a given [`PoolState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolAction {
    /// Already imported, by us on an earlier run or by the operator.
    Keep,
    Import,
    Create,
}

impl PoolAction {
    fn plan(state: PoolState) -> Self {
        match state {
            PoolState::Imported => PoolAction::Keep,
            PoolState::Importable => PoolAction::Import,
            PoolState::Absent => PoolAction::Create,
        }
    }

    /// The `zpool` invocation carrying out this action, if any.
    fn task(self, name: &str, altroot: &Utf8Path, devices: &[Utf8PathBuf]) -> Option<Task> {
        match self {
            PoolAction::Keep => None,
            PoolAction::Import => Some(
                Task::new(format!("Importing pool {name}"), "zpool")
                    .args(["import", "-f", "-R", altroot.as_str(), name]),
            ),
            PoolAction::Create => Some(
                Task::new(format!("Creating pool {name}"), "zpool")
                    .args(create_args(name, altroot, devices)),
            ),
        }
    }

    /// What the run must release after carrying out this action.
    fn acquisition(self, name: &str) -> Option<Acquisition> {
        match self {
            PoolAction::Keep => None,
            PoolAction::Import | PoolAction::Create => {
                Some(Acquisition::PoolExport(name.to_string()))
            }
        }
    }
}

/// Make sure pool `name` is imported with `altroot`, importing it if
/// possible and creating it on `devices` otherwise.
#[context("Setting up pool {name}")]
pub(crate) fn ensure_pool(
    name: &str,
    altroot: &Utf8Path,
    devices: &[Utf8PathBuf],
    ledger: &mut Ledger,
) -> Result<()> {
    let action = PoolAction::plan(pool_state(name)?);
    match action.task(name, altroot, devices) {
        Some(task) => task.run()?,
        None => tracing::debug!("Pool {name} is already imported"),
    }
    if let Some(acquisition) = action.acquisition(name) {
        ledger.record(acquisition);
    }
    Ok(())
}

/// A block volume backing a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Volume {
    pub(crate) size_mib: u64,
    pub(crate) block_size: &'static str,
}

/// A dataset of the pool tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Dataset {
    /// Full name, including the pool.
    pub(crate) name: String,
    pub(crate) properties: Vec<(&'static str, &'static str)>,
    pub(crate) volume: Option<Volume>,
}

impl Dataset {
    fn create_args(&self) -> Vec<String> {
        let mut args = vec!["create".to_string()];
        if let Some(v) = &self.volume {
            args.extend([
                "-V".into(),
                format!("{}M", v.size_mib),
                "-b".into(),
                v.block_size.to_string(),
            ]);
        }
        for (k, v) in &self.properties {
            args.extend(["-o".into(), format!("{k}={v}")]);
        }
        args.push(self.name.clone());
        args
    }
}

/// The datasets making up an installation in `pool`, parents first.
pub(crate) fn pool_tree(pool: &str, swap_mib: u64) -> Vec<Dataset> {
    vec![
        Dataset {
            name: format!("{pool}/ROOT"),
            properties: Vec::new(),
            volume: None,
        },
        Dataset {
            name: format!("{pool}/{ROOT_DATASET}"),
            properties: vec![("mountpoint", "/")],
            volume: None,
        },
        Dataset {
            name: format!("{pool}/{SWAP_VOLUME}"),
            properties: vec![
                ("compression", "gzip-9"),
                ("com.sun:auto-snapshot", "false"),
            ],
            volume: Some(Volume {
                size_mib: swap_mib,
                block_size: "4K",
            }),
        },
    ]
}

/// The device node of the swap volume of `pool`.
pub(crate) fn swap_device(pool: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("/dev/zvol/{pool}/{SWAP_VOLUME}"))
}

#[context("Listing datasets")]
fn dataset_exists(name: &str) -> Result<bool> {
    let out = Command::new("zfs")
        .args(["list", "-H", "-o", "name", "-t", "all"])
        .run_get_string()?;
    let exists = list_names(&out).any(|n| n == name);
    Ok(exists)
}

/// Create `dataset` unless it exists. Returns `true` if it was created.
#[context("Ensuring dataset {}", dataset.name)]
pub(crate) fn ensure_dataset(dataset: &Dataset) -> Result<bool> {
    if dataset_exists(&dataset.name)? {
        tracing::debug!("Dataset {} already exists", dataset.name);
        return Ok(false);
    }
    Task::new(format!("Creating dataset {}", dataset.name), "zfs")
        .args(dataset.create_args())
        .run()?;
    Ok(true)
}

#[context("Setting {key}={value} on {dataset}")]
pub(crate) fn set_property(dataset: &str, key: &str, value: &str) -> Result<()> {
    Task::new(format!("Setting {key} on {dataset}"), "zfs")
        .quiet()
        .arg("set")
        .arg(format!("{key}={value}"))
        .arg(dataset)
        .run()
}

/// Mount the root dataset at the altroot if the import did not.
#[context("Mounting root dataset of {pool}")]
pub(crate) fn ensure_root_mounted(pool: &str, altroot: &Utf8Path) -> Result<()> {
    if zfs_install_mount::is_mountpoint(altroot)? {
        return Ok(());
    }
    let dataset = format!("{pool}/{ROOT_DATASET}");
    Task::new_and_run(format!("Mounting {dataset}"), "zfs", ["mount", dataset.as_str()])
}

/// Make sure the swap volume carries a swap signature.
#[context("Formatting swap on {dev}")]
pub(crate) fn ensure_swap_formatted(dev: &Utf8Path) -> Result<bool> {
    // zvol nodes are created by udev some time after the volume
    blockdev::wait_for_device(dev, 5, Duration::from_secs(5))?;
    if blockdev::filesystem_type(dev)?.as_deref() == Some("swap") {
        tracing::debug!("{dev} is already swap");
        return Ok(false);
    }
    Task::new(format!("Formatting {dev} as swap"), "mkswap")
        .quiet_output()
        .args(["-f", dev.as_str()])
        .run()?;
    Ok(true)
}

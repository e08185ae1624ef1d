//! Probing and idempotent setup of block-level resources: backing files,
//! loop devices, partition tables and filesystems.
//!
//! Every `ensure_*` function here inspects the current state first and only
//! acts when that state differs from the requested one, so rerunning an
//! install against a half-built target picks up where the last run stopped.

use std::fs::File;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rustix::fs::FileType;
use rustix::io::Errno;
use serde::Deserialize;

use zfs_install_utils::CommandRunExt;

/// blkid exits with this status when the requested tag is not present.
const BLKID_NOT_FOUND: i32 = 2;

/// Errors describing block device state we refuse to act on.
#[derive(Debug, thiserror::Error)]
pub enum BlockdevError {
    /// The path exists but is neither a regular file nor a block device.
    #[error("{path} is neither a regular file nor a block device")]
    InvalidResourceKind {
        /// The offending path.
        path: Utf8PathBuf,
    },
    /// The partitions found do not match the requested layout.
    #[error(
        "inconsistent partition table on {device}: partition 1 {first}, partition 2 {second}; \
         refusing to repartition, fix the device by hand"
    )]
    InconsistentPartitionTable {
        /// The partitioned device.
        device: Utf8PathBuf,
        /// Whether the first partition was found, for display.
        first: &'static str,
        /// Whether the second partition was found, for display.
        second: &'static str,
    },
    /// A device node did not show up in time.
    #[error("device {path} did not appear after {waited:?}")]
    DeviceTimeout {
        /// The expected device node.
        path: Utf8PathBuf,
        /// Total time spent polling.
        waited: Duration,
    },
}

fn presence(p: &Option<Utf8PathBuf>) -> &'static str {
    if p.is_some() {
        "present"
    } else {
        "missing"
    }
}

/// The kind of resource found at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Nothing exists at the path.
    Absent,
    /// A regular file, to be used through a loop device.
    File,
    /// A block device, used directly.
    BlockDevice,
}

/// Inspect `path` without changing anything.
#[context("Probing {path}")]
pub fn resource_kind(path: &Utf8Path) -> Result<ResourceKind> {
    let st = match rustix::fs::stat(path.as_std_path()) {
        Ok(st) => st,
        Err(Errno::NOENT) => return Ok(ResourceKind::Absent),
        Err(e) => return Err(e.into()),
    };
    let kind = match FileType::from_raw_mode(st.st_mode) {
        FileType::RegularFile => ResourceKind::File,
        FileType::BlockDevice => ResourceKind::BlockDevice,
        _ => {
            return Err(BlockdevError::InvalidResourceKind {
                path: path.to_owned(),
            }
            .into())
        }
    };
    tracing::trace!("{path}: {kind:?}");
    Ok(kind)
}

/// Create a sparse backing file of `size_mib` if nothing exists at `path`.
///
/// Returns `true` if the file was created by this call.
#[context("Ensuring backing file {path}")]
pub fn ensure_backing_file(path: &Utf8Path, size_mib: u64) -> Result<bool> {
    if resource_kind(path)? != ResourceKind::Absent {
        tracing::debug!("{path} already exists");
        return Ok(false);
    }
    let f = File::create(path)?;
    f.set_len(size_mib * 1024 * 1024)?;
    tracing::info!("Created sparse backing file {path} ({size_mib} MiB)");
    Ok(true)
}

/// Conventions used by the kernel and udev for naming the partitions of a
/// device. Different hosts (and device types) expose different ones, so we
/// try all of them in order rather than guessing from the device name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionNaming {
    /// `/dev/disk/by-id/foo-part1`
    DashPart,
    /// `/dev/loop0p1`, `/dev/nvme0n1p1`
    P,
    /// `/dev/sda1`
    Plain,
}

/// The order in which partition naming conventions are tried.
pub const PARTITION_NAMING: [PartitionNaming; 3] = [
    PartitionNaming::DashPart,
    PartitionNaming::P,
    PartitionNaming::Plain,
];

impl PartitionNaming {
    /// The path partition `index` (starting at 1) would have under this convention.
    pub fn partition_path(self, device: &Utf8Path, index: u32) -> Utf8PathBuf {
        let suffix = match self {
            PartitionNaming::DashPart => format!("-part{index}"),
            PartitionNaming::P => format!("p{index}"),
            PartitionNaming::Plain => format!("{index}"),
        };
        format!("{device}{suffix}").into()
    }
}

fn find_partition_with(
    device: &Utf8Path,
    index: u32,
    exists: impl Fn(&Utf8Path) -> bool,
) -> Option<Utf8PathBuf> {
    PARTITION_NAMING
        .iter()
        .map(|n| n.partition_path(device, index))
        .find(|p| exists(p))
}

/// Find partition `index` (starting at 1) of `device`, if it exists.
pub fn find_partition(device: &Utf8Path, index: u32) -> Option<Utf8PathBuf> {
    let r = find_partition_with(device, index, |p| p.exists());
    tracing::trace!("partition {index} of {device}: {r:?}");
    r
}

#[derive(Debug, Deserialize)]
struct LosetupOutput {
    loopdevices: Vec<LoopDevice>,
}

/// An attached loop device, as reported by `losetup --json --list`.
#[derive(Debug, Deserialize)]
pub struct LoopDevice {
    /// The loop device node, e.g. `/dev/loop0`.
    pub name: Utf8PathBuf,
    /// The file backing the device.
    #[serde(rename = "back-file")]
    pub back_file: Option<String>,
}

fn parse_loop_devices(s: &str) -> Result<Vec<LoopDevice>> {
    // With no loop devices at all, losetup prints nothing.
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    let o: LosetupOutput = serde_json::from_str(s).context("Parsing losetup output")?;
    Ok(o.loopdevices)
}

fn find_attachment_in(devices: Vec<LoopDevice>, file: &Utf8Path) -> Option<Utf8PathBuf> {
    devices
        .into_iter()
        .find(|d| d.back_file.as_deref().map(Utf8Path::new) == Some(file))
        .map(|d| d.name)
}

/// Find an existing loop device backed by exactly `file`.
#[context("Looking up loop attachment for {file}")]
pub fn find_loop_attachment(file: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
    let file = file
        .canonicalize_utf8()
        .with_context(|| format!("Canonicalizing {file}"))?;
    let out = Command::new("losetup")
        .args(["--json", "--list"])
        .run_get_string()?;
    let r = find_attachment_in(parse_loop_devices(&out)?, &file);
    tracing::trace!("loop attachment for {file}: {r:?}");
    Ok(r)
}

/// Attach `file` to a new loop device with partition scanning enabled.
#[context("Attaching {file} to a loop device")]
pub fn attach_loop(file: &Utf8Path) -> Result<Utf8PathBuf> {
    let dev = Command::new("losetup")
        .args(["--show", "-P", "--find"])
        .arg(file)
        .run_get_string()?;
    let dev = Utf8PathBuf::from(dev.trim());
    tracing::debug!("Allocated loopback {dev}");
    Ok(dev)
}

/// Detach a loop device.
pub fn detach_loop(dev: &Utf8Path) -> Result<()> {
    Command::new("losetup")
        .args(["-d", dev.as_str()])
        .run_capture_stderr()
}

/// The partitions to create on an empty device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionLayout {
    /// One partition spanning the device, holding the pool.
    Single,
    /// A boot partition of `boot_mib` followed by a root partition
    /// spanning the rest of the device.
    BootAndRoot {
        /// Size of the boot partition.
        boot_mib: u64,
    },
}

/// Partitions of a device after [`ensure_partitioned`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitions {
    /// The boot partition, for [`PartitionLayout::BootAndRoot`].
    pub boot: Option<Utf8PathBuf>,
    /// The partition holding the pool.
    pub root: Utf8PathBuf,
}

/// What [`ensure_partitioned`] needs to do, given what it found.
#[derive(Debug, PartialEq, Eq)]
enum PartitionAction {
    UseExisting(Partitions),
    Create,
}

fn plan_partitioning(
    device: &Utf8Path,
    layout: PartitionLayout,
    first: Option<Utf8PathBuf>,
    second: Option<Utf8PathBuf>,
) -> Result<PartitionAction> {
    let action = match (layout, first, second) {
        (_, None, None) => PartitionAction::Create,
        (PartitionLayout::Single, Some(root), None) => {
            PartitionAction::UseExisting(Partitions { boot: None, root })
        }
        (PartitionLayout::BootAndRoot { .. }, Some(boot), Some(root)) => {
            PartitionAction::UseExisting(Partitions {
                boot: Some(boot),
                root,
            })
        }
        (_, first, second) => {
            return Err(BlockdevError::InconsistentPartitionTable {
                device: device.to_owned(),
                first: presence(&first),
                second: presence(&second),
            }
            .into())
        }
    };
    Ok(action)
}

/// Generate the `sfdisk` input creating `layout` on an empty device.
///
/// A DOS label is used so the bootloader can embed itself after the MBR.
pub fn sfdisk_script(layout: PartitionLayout) -> String {
    let mut s = String::from("label: dos\n");
    match layout {
        PartitionLayout::Single => {
            s.push_str("type=83, bootable\n");
        }
        PartitionLayout::BootAndRoot { boot_mib } => {
            s.push_str(&format!("size={boot_mib}MiB, type=83, bootable\n"));
            s.push_str("type=83\n");
        }
    }
    s
}

/// Wait for udev to finish processing events.
pub fn udev_settle() -> Result<()> {
    Command::new("udevadm")
        .arg("settle")
        .run_capture_stderr()
}

/// Poll until `path` exists.
pub fn wait_for_device(path: &Utf8Path, attempts: u32, interval: Duration) -> Result<()> {
    for attempt in 0..attempts {
        if path.exists() {
            return Ok(());
        }
        tracing::debug!("Waiting for {path} (attempt {})", attempt + 1);
        sleep(interval);
    }
    if path.exists() {
        return Ok(());
    }
    Err(BlockdevError::DeviceTimeout {
        path: path.to_owned(),
        waited: interval * attempts,
    }
    .into())
}

/// Make sure `device` carries the partitions of `layout`.
///
/// An empty device is partitioned. A device already carrying the expected
/// partitions is left alone. Anything in between is an error: we never
/// repair a partition table automatically.
#[context("Partitioning {device}")]
pub fn ensure_partitioned(device: &Utf8Path, layout: PartitionLayout) -> Result<Partitions> {
    let first = find_partition(device, 1);
    let second = find_partition(device, 2);
    match plan_partitioning(device, layout, first, second)? {
        PartitionAction::UseExisting(parts) => {
            tracing::debug!("{device} is already partitioned: {parts:?}");
            Ok(parts)
        }
        PartitionAction::Create => {
            tracing::info!("Creating partitions on {device}");
            Command::new("sfdisk")
                .arg("--quiet")
                .arg(device)
                .stdout(Stdio::null())
                .run_with_stdin(sfdisk_script(layout).as_bytes())?;
            udev_settle()?;
            let found = |index| -> Result<Utf8PathBuf> {
                // The first naming convention is only a guess until the node exists.
                for _ in 0..5 {
                    if let Some(p) = find_partition(device, index) {
                        return Ok(p);
                    }
                    sleep(Duration::from_secs(1));
                }
                find_partition(device, index).ok_or_else(|| {
                    anyhow::anyhow!("Partition {index} of {device} missing after partitioning")
                })
            };
            match layout {
                PartitionLayout::Single => Ok(Partitions {
                    boot: None,
                    root: found(1)?,
                }),
                PartitionLayout::BootAndRoot { .. } => Ok(Partitions {
                    boot: Some(found(1)?),
                    root: found(2)?,
                }),
            }
        }
    }
}

fn blkid_value(dev: &Utf8Path, tag: &str) -> Result<Option<String>> {
    let r = Command::new("blkid")
        .args(["-c", "/dev/null", "-o", "value", "-s", tag])
        .arg(dev)
        .run_optional(&[BLKID_NOT_FOUND])?;
    Ok(r.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
}

/// The filesystem (or other signature, e.g. `swap`, `crypto_LUKS`) on `dev`.
#[context("Querying filesystem type of {dev}")]
pub fn filesystem_type(dev: &Utf8Path) -> Result<Option<String>> {
    blkid_value(dev, "TYPE")
}

/// The filesystem UUID of `dev`.
#[context("Querying filesystem UUID of {dev}")]
pub fn filesystem_uuid(dev: &Utf8Path) -> Result<Option<String>> {
    blkid_value(dev, "UUID")
}

/// Create a `fstype` filesystem labeled `label` on `dev`, unless one is
/// already there. Returns `true` if a filesystem was created.
#[context("Ensuring {fstype} filesystem on {dev}")]
pub fn ensure_filesystem(dev: &Utf8Path, fstype: &str, label: &str) -> Result<bool> {
    if filesystem_type(dev)?.as_deref() == Some(fstype) {
        tracing::debug!("{dev} already has a {fstype} filesystem");
        return Ok(false);
    }
    tracing::info!("Creating {fstype} filesystem on {dev}");
    Command::new(format!("mkfs.{fstype}"))
        .args(["-q", "-L", label])
        .arg(dev)
        // Refuse rather than hang if mkfs wants confirmation
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .run_capture_stderr()?;
    Ok(true)
}

/// Parse a string into mebibytes
pub fn parse_size_mib(s: &str) -> Result<u64> {
    let suffixes = [
        ("MiB", 1u64),
        ("M", 1u64),
        ("GiB", 1024),
        ("G", 1024),
        ("TiB", 1024 * 1024),
        ("T", 1024 * 1024),
    ];
    let (digits, mul) = suffixes
        .iter()
        .find_map(|(suffix, mul)| s.strip_suffix(suffix).map(|v| (v, *mul)))
        .unwrap_or((s, 1));
    let v = digits
        .trim()
        .parse::<u64>()
        .with_context(|| format!("Invalid size: {s}"))?;
    v.checked_mul(mul)
        .ok_or_else(|| anyhow::anyhow!("Size too large: {s}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_size_mib() {
        let ident_cases = [0, 10, 9, 1024].into_iter().map(|k| (k.to_string(), k));
        let cases = [
            ("0M", 0),
            ("10M", 10),
            ("10MiB", 10),
            ("1G", 1024),
            ("9G", 9216),
            ("11T", 11 * 1024 * 1024),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v));
        for (s, v) in ident_cases.chain(cases) {
            assert_eq!(parse_size_mib(&s).unwrap(), v as u64, "Parsing {s}");
        }
        for bad in ["", "G", "ten", "10X", "-5M"] {
            assert!(parse_size_mib(bad).is_err(), "Parsing {bad}");
        }
    }

    #[test]
    fn test_resource_kind() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();

        assert_eq!(resource_kind(&dir.join("nope"))?, ResourceKind::Absent);

        let f = dir.join("disk.img");
        std::fs::write(&f, b"")?;
        assert_eq!(resource_kind(&f)?, ResourceKind::File);

        let err = resource_kind(dir).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BlockdevError>(),
            Some(BlockdevError::InvalidResourceKind { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_ensure_backing_file_is_sparse_and_idempotent() -> Result<()> {
        let td = tempfile::tempdir()?;
        let f = Utf8Path::from_path(td.path()).unwrap().join("vol.img");

        assert!(ensure_backing_file(&f, 64)?);
        assert_eq!(std::fs::metadata(&f)?.len(), 64 * 1024 * 1024);

        std::fs::write(&f, b"data")?;
        assert!(!ensure_backing_file(&f, 64)?);
        assert_eq!(std::fs::read(&f)?, b"data");
        Ok(())
    }

    #[test]
    fn test_partition_naming() {
        let dev = Utf8Path::new("/dev/loop0");
        let paths: Vec<_> = PARTITION_NAMING
            .iter()
            .map(|n| n.partition_path(dev, 2).into_string())
            .collect();
        assert_eq!(paths, ["/dev/loop0-part2", "/dev/loop0p2", "/dev/loop02"]);
    }

    #[test]
    fn test_find_partition_prefers_first_convention() {
        let dev = Utf8Path::new("/dev/disk/by-id/ata-foo");
        let r = find_partition_with(dev, 1, |p| {
            p == "/dev/disk/by-id/ata-foo-part1" || p == "/dev/disk/by-id/ata-foo1"
        });
        assert_eq!(r.as_deref(), Some(Utf8Path::new("/dev/disk/by-id/ata-foo-part1")));

        let r = find_partition_with(Utf8Path::new("/dev/sda"), 1, |p| p == "/dev/sda1");
        assert_eq!(r.as_deref(), Some(Utf8Path::new("/dev/sda1")));

        assert_eq!(find_partition_with(dev, 3, |_| false), None);
    }

    #[test]
    fn test_find_partition_on_disk() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let dev = dir.join("nvme0n1");
        std::fs::write(dir.join("nvme0n1p1"), b"")?;
        assert_eq!(find_partition(&dev, 1), Some(dir.join("nvme0n1p1")));
        assert_eq!(find_partition(&dev, 2), None);
        Ok(())
    }

    #[test]
    fn test_plan_partitioning() {
        let dev = Utf8Path::new("/dev/loop0");
        let layout = PartitionLayout::BootAndRoot { boot_mib: 256 };
        let p1 = Some(Utf8PathBuf::from("/dev/loop0p1"));
        let p2 = Some(Utf8PathBuf::from("/dev/loop0p2"));

        assert_eq!(
            plan_partitioning(dev, layout, None, None).unwrap(),
            PartitionAction::Create
        );
        assert_eq!(
            plan_partitioning(dev, layout, p1.clone(), p2.clone()).unwrap(),
            PartitionAction::UseExisting(Partitions {
                boot: p1.clone(),
                root: "/dev/loop0p2".into()
            })
        );
        for (boot, root) in [(p1.clone(), None), (None, p2.clone())] {
            let err = plan_partitioning(dev, layout, boot, root).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<BlockdevError>(),
                Some(BlockdevError::InconsistentPartitionTable { .. })
            ));
        }

        assert_eq!(
            plan_partitioning(dev, PartitionLayout::Single, p1.clone(), None).unwrap(),
            PartitionAction::UseExisting(Partitions {
                boot: None,
                root: "/dev/loop0p1".into()
            })
        );
        assert_eq!(
            plan_partitioning(dev, PartitionLayout::Single, None, None).unwrap(),
            PartitionAction::Create
        );
        // A leftover second partition means the table is not ours to rewrite.
        for (first, second) in [(None, p2.clone()), (p1.clone(), p2.clone())] {
            let err =
                plan_partitioning(dev, PartitionLayout::Single, first, second).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<BlockdevError>(),
                Some(BlockdevError::InconsistentPartitionTable { .. })
            ));
        }
    }

    #[test]
    fn test_inconsistent_table_does_not_partition() -> Result<()> {
        // With only a root-position partition present, ensure_partitioned
        // must fail before it reaches sfdisk.
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let dev = dir.join("vol");
        std::fs::write(&dev, b"")?;
        std::fs::write(dir.join("volp2"), b"")?;
        let err =
            ensure_partitioned(&dev, PartitionLayout::BootAndRoot { boot_mib: 256 }).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BlockdevError>(),
            Some(BlockdevError::InconsistentPartitionTable { .. })
        ));
        assert_eq!(std::fs::metadata(&dev)?.len(), 0);
        Ok(())
    }

    #[test]
    fn test_sfdisk_script() {
        similar_asserts::assert_eq!(
            sfdisk_script(PartitionLayout::Single),
            "label: dos\ntype=83, bootable\n"
        );
        similar_asserts::assert_eq!(
            sfdisk_script(PartitionLayout::BootAndRoot { boot_mib: 256 }),
            indoc::indoc! { "
                label: dos
                size=256MiB, type=83, bootable
                type=83
            " }
        );
    }

    #[test]
    fn test_parse_losetup() -> Result<()> {
        let fixture = indoc::indoc! { r#"
        {
           "loopdevices": [
              {
                 "name": "/dev/loop0",
                 "sizelimit": 0,
                 "offset": 0,
                 "autoclear": false,
                 "ro": false,
                 "back-file": "/var/lib/images/other.img",
                 "dio": false,
                 "log-sec": 512
              },{
                 "name": "/dev/loop3",
                 "sizelimit": 0,
                 "offset": 0,
                 "autoclear": false,
                 "ro": false,
                 "back-file": "/srv/vol.img",
                 "dio": false,
                 "log-sec": 512
              }
           ]
        }
        "# };
        let devs = parse_loop_devices(fixture)?;
        assert_eq!(devs.len(), 2);
        let found = find_attachment_in(devs, Utf8Path::new("/srv/vol.img"));
        assert_eq!(found.as_deref(), Some(Utf8Path::new("/dev/loop3")));

        let devs = parse_loop_devices(fixture)?;
        assert_eq!(find_attachment_in(devs, Utf8Path::new("/srv/vol")), None);

        assert!(parse_loop_devices("")?.is_empty());
        Ok(())
    }
}

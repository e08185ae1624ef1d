//! The install flow: from a [`TargetSpec`] to a finalized image.
//!
//! Everything acquired on the host while provisioning is recorded in a
//! [`Ledger`]. On success the ledger is unwound before the image is booted
//! for finalization; on failure it is unwound unless cleanup was disabled.

use std::fmt::Debug;
use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;

use crate::blockdev::{self, PartitionLayout, ResourceKind};
use crate::bootloader;
use crate::chroot;
use crate::finalize::{self, BootImages};
use crate::interrupt;
use crate::ledger::{Acquisition, Ledger};
use crate::luks::{self, EncryptedVolume};
use crate::packages::{self, PackageScope};
use crate::pool::{self, PoolState};

/// Label of the boot filesystem, referenced by the installed fstab.
const BOOT_LABEL: &str = "boot";
/// Pool name prefixes zpool(8) reserves for vdev keywords.
const RESERVED_POOL_PREFIXES: &[&str] = &["mirror", "raidz", "draid", "spare"];
/// Pool names zpool(8) reserves outright.
const RESERVED_POOL_NAMES: &[&str] = &["log"];

/// Everything describing one install run.
pub(crate) struct TargetSpec {
    /// Block device or image file holding the pool, and the boot
    /// partition unless `boot_device` is set.
    pub(crate) volume: Utf8PathBuf,
    /// Size of `volume` when it has to be created as a file.
    pub(crate) volume_size_mib: u64,
    /// Separate device or image file for `/boot`.
    pub(crate) boot_device: Option<Utf8PathBuf>,
    pub(crate) boot_size_mib: u64,
    pub(crate) pool_name: String,
    pub(crate) host_name: String,
    pub(crate) root_password: String,
    pub(crate) swap_size_mib: u64,
    pub(crate) releasever: u32,
    pub(crate) luks_passphrase: Option<String>,
    /// Release acquired resources when the run fails.
    pub(crate) cleanup: bool,
    /// Holds the pool altroot and the extracted boot images.
    pub(crate) workdir: Utf8PathBuf,
}

impl Debug for TargetSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetSpec")
            .field("volume", &self.volume)
            .field("volume_size_mib", &self.volume_size_mib)
            .field("boot_device", &self.boot_device)
            .field("boot_size_mib", &self.boot_size_mib)
            .field("pool_name", &self.pool_name)
            .field("host_name", &self.host_name)
            .field("swap_size_mib", &self.swap_size_mib)
            .field("releasever", &self.releasever)
            .field("encrypted", &self.luks_passphrase.is_some())
            .field("cleanup", &self.cleanup)
            .field("workdir", &self.workdir)
            .finish_non_exhaustive()
    }
}

impl TargetSpec {
    /// Reject inputs the tools would refuse halfway through the run.
    pub(crate) fn validate(&self) -> Result<()> {
        let pool_re = Regex::new(r"^[A-Za-z][A-Za-z0-9_.:-]*$")?;
        if !pool_re.is_match(&self.pool_name) {
            anyhow::bail!("Invalid pool name: {}", self.pool_name);
        }
        if let Some(p) = RESERVED_POOL_PREFIXES
            .iter()
            .find(|p| self.pool_name.starts_with(*p))
        {
            anyhow::bail!("Pool name {} uses the reserved prefix {p}", self.pool_name);
        }
        if RESERVED_POOL_NAMES.contains(&self.pool_name.as_str()) {
            anyhow::bail!("Pool name {} is reserved", self.pool_name);
        }
        if self.host_name.is_empty() || self.host_name.contains(char::is_whitespace) {
            anyhow::bail!("Invalid host name: {:?}", self.host_name);
        }
        for (what, size) in [
            ("volume", self.volume_size_mib),
            ("boot", self.boot_size_mib),
            ("swap", self.swap_size_mib),
        ] {
            if size == 0 {
                anyhow::bail!("The {what} size must be greater than zero");
            }
        }
        if self.luks_passphrase.as_deref() == Some("") {
            anyhow::bail!("The encryption passphrase must not be empty");
        }
        if self.boot_device.as_ref() == Some(&self.volume) {
            anyhow::bail!("The boot device must differ from the volume");
        }
        Ok(())
    }

    /// Where the pool is mounted while provisioning.
    pub(crate) fn altroot(&self) -> Utf8PathBuf {
        self.workdir.join(&self.pool_name)
    }

    /// The disks of the finished machine, in boot order.
    pub(crate) fn disks(&self) -> Vec<Utf8PathBuf> {
        std::iter::once(self.volume.clone())
            .chain(self.boot_device.clone())
            .collect()
    }
}

/// What the finalize boot needs from provisioning.
#[derive(Debug)]
struct Prepared {
    images: BootImages,
    luks: Option<EncryptedVolume>,
    hostid: Option<u32>,
}

#[context("Attaching {file} to a loop device")]
fn ensure_loop_attached(file: &Utf8Path, ledger: &mut Ledger) -> Result<Utf8PathBuf> {
    if let Some(dev) = blockdev::find_loop_attachment(file)? {
        tracing::debug!("{file} is already attached to {dev}");
        return Ok(dev);
    }
    tracing::info!("Attaching {file} to a loop device");
    let dev = blockdev::attach_loop(file)?;
    ledger.record(Acquisition::LoopDetach(dev.clone()));
    // Partition nodes of a fresh attachment appear asynchronously.
    blockdev::udev_settle()?;
    Ok(dev)
}

/// Resolve `path` to a block device, creating and attaching a backing
/// file as needed.
fn ensure_block_device(path: &Utf8Path, size_mib: u64, ledger: &mut Ledger) -> Result<Utf8PathBuf> {
    match blockdev::resource_kind(path)? {
        ResourceKind::BlockDevice => Ok(path.to_owned()),
        ResourceKind::Absent | ResourceKind::File => {
            blockdev::ensure_backing_file(path, size_mib)?;
            ensure_loop_attached(path, ledger)
        }
    }
}

/// Partition the target, returning the boot partition and the partition
/// holding the pool.
fn ensure_partitions(
    spec: &TargetSpec,
    ledger: &mut Ledger,
) -> Result<(Utf8PathBuf, Utf8PathBuf)> {
    let volume = ensure_block_device(&spec.volume, spec.volume_size_mib, ledger)?;
    match spec.boot_device.as_deref() {
        Some(boot_path) => {
            let boot = ensure_block_device(boot_path, spec.boot_size_mib, ledger)?;
            let boot = blockdev::ensure_partitioned(&boot, PartitionLayout::Single)?;
            let root = blockdev::ensure_partitioned(&volume, PartitionLayout::Single)?;
            Ok((boot.root, root.root))
        }
        None => {
            let layout = PartitionLayout::BootAndRoot {
                boot_mib: spec.boot_size_mib,
            };
            let parts = blockdev::ensure_partitioned(&volume, layout)?;
            let boot = parts
                .boot
                .ok_or_else(|| anyhow::anyhow!("No boot partition on {volume}"))?;
            Ok((boot, parts.root))
        }
    }
}

#[context("Creating pool datasets")]
fn ensure_datasets(spec: &TargetSpec) -> Result<()> {
    for dataset in pool::pool_tree(&spec.pool_name, spec.swap_size_mib) {
        if !pool::ensure_dataset(&dataset)? {
            for (key, value) in &dataset.properties {
                pool::set_property(&dataset.name, key, value)?;
            }
        }
    }
    Ok(())
}

/// Build everything up to, but excluding, the finalize boot.
fn provision(spec: &TargetSpec, ledger: &mut Ledger) -> Result<Prepared> {
    let (boot_part, pool_part) = ensure_partitions(spec, ledger)?;
    interrupt::check()?;
    blockdev::ensure_filesystem(&boot_part, "ext4", BOOT_LABEL)?;
    interrupt::check()?;

    let luks = spec
        .luks_passphrase
        .as_deref()
        .map(|passphrase| luks::ensure_encrypted_volume(&pool_part, passphrase, ledger))
        .transpose()?;
    let pool_dev = luks.as_ref().map(|v| v.device()).unwrap_or(pool_part);
    interrupt::check()?;

    let root = spec.altroot();
    fs::create_dir_all(&root).with_context(|| format!("Creating {root}"))?;
    pool::ensure_pool(&spec.pool_name, &root, &[pool_dev], ledger)?;
    interrupt::check()?;
    ensure_datasets(spec)?;
    pool::ensure_root_mounted(&spec.pool_name, &root)?;
    pool::ensure_swap_formatted(&pool::swap_device(&spec.pool_name))?;
    interrupt::check()?;

    chroot::mount_virtual_filesystems(&root, &boot_part, ledger)?;
    chroot::sync_device_nodes(&root)?;
    chroot::write_identity_files(&root, spec, luks.as_ref())?;
    interrupt::check()?;

    packages::ensure_packages_installed(
        &root,
        packages::BASE_PACKAGES,
        PackageScope::InstallRoot {
            releasever: spec.releasever,
        },
    )?;
    interrupt::check()?;
    chroot::set_root_password_if_unset(&root, &spec.root_password)?;
    packages::ensure_zfs_repository(&root, spec.releasever)?;
    interrupt::check()?;
    packages::ensure_packages_installed(&root, packages::BOOT_PACKAGES, PackageScope::Chroot)?;
    interrupt::check()?;

    bootloader::patch_bootloader_generator(&root)?;
    bootloader::write_finalize_script(&root, &spec.pool_name, luks.as_ref())?;

    let hostid = chroot::read_hostid(&root)?;
    let images = finalize::extract_boot_images(&root, &spec.workdir.join("boot-images"))?;
    interrupt::check()?;
    Ok(Prepared {
        images,
        luks,
        hostid,
    })
}

/// Settle the ledger according to the outcome of provisioning.
///
/// Success always releases everything, since the image cannot be booted
/// while the host holds it. A failure releases everything unless `cleanup`
/// is off; a failed release is then logged and the original error returned.
fn conclude<T, F>(result: Result<T>, ledger: &mut Ledger, cleanup: bool, unwind: F) -> Result<T>
where
    F: FnOnce(&mut Ledger) -> Result<()>,
{
    match result {
        Ok(v) => {
            let held: Vec<_> = ledger.iter().map(ToString::to_string).collect();
            tracing::debug!("Releasing: {}", held.join(", "));
            unwind(ledger).context("Releasing the target before finalizing")?;
            Ok(v)
        }
        Err(e) if cleanup => {
            if !ledger.is_empty() {
                tracing::info!("Cleaning up after failure");
            }
            if let Err(e) = unwind(ledger) {
                tracing::error!("{e:#}");
            }
            Err(e)
        }
        Err(e) => {
            tracing::warn!("Cleanup disabled; {} resources left held", ledger.len());
            Err(e)
        }
    }
}

/// Provision the target described by `spec`, then finalize it.
#[context("Installing to {}", spec.volume)]
pub(crate) fn install(spec: &TargetSpec) -> Result<()> {
    tracing::debug!("Target: {spec:?}");
    interrupt::install_handler();
    let mut ledger = Ledger::default();
    let result = provision(spec, &mut ledger);
    let prepared = conclude(result, &mut ledger, spec.cleanup, Ledger::unwind_all)?;

    if pool::pool_state(&spec.pool_name)? == PoolState::Imported {
        anyhow::bail!(
            "Pool {} is still imported on this host; export it before finalizing",
            spec.pool_name
        );
    }
    finalize::boot_and_finalize(
        &prepared.images,
        &spec.pool_name,
        &spec.disks(),
        prepared.luks.as_ref(),
        prepared.hostid,
    )?;
    tracing::info!("Installation to {} complete", spec.volume);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> TargetSpec {
        TargetSpec {
            volume: "/var/tmp/disk.img".into(),
            volume_size_mib: 11000,
            boot_device: None,
            boot_size_mib: 256,
            pool_name: "tank".into(),
            host_name: "localhost.localdomain".into(),
            root_password: "password".into(),
            swap_size_mib: 1024,
            releasever: 40,
            luks_passphrase: None,
            cleanup: true,
            workdir: "/var/tmp".into(),
        }
    }

    /// The acquisitions of a full run, in the order they are made.
    fn stages() -> Vec<Acquisition> {
        vec![
            Acquisition::LoopDetach("/dev/loop0".into()),
            Acquisition::LoopDetach("/dev/loop1".into()),
            Acquisition::EncryptedClose("luks-abcd1234".into()),
            Acquisition::PoolExport("tank".into()),
            Acquisition::Unmount("/var/tmp/tank/boot".into()),
            Acquisition::Unmount("/var/tmp/tank/sys".into()),
            Acquisition::Unmount("/var/tmp/tank/proc".into()),
        ]
    }

    /// Acquire each stage in turn, failing instead of acquiring stage
    /// `fail_at`.
    fn simulate(ledger: &mut Ledger, fail_at: usize) -> Result<()> {
        for (i, acquisition) in stages().into_iter().enumerate() {
            if i == fail_at {
                anyhow::bail!("stage {i} failed");
            }
            ledger.record(acquisition);
        }
        Ok(())
    }

    #[test]
    fn test_failure_after_each_stage() {
        let all = stages();
        for fail_at in 0..=all.len() {
            let mut ledger = Ledger::default();
            let result = simulate(&mut ledger, fail_at);
            let mut released = Vec::new();
            let r = conclude(result, &mut ledger, true, |l| {
                l.unwind_with(|a| {
                    released.push(a.clone());
                    Ok(())
                })
            });
            assert_eq!(r.is_err(), fail_at < all.len());
            let expected: Vec<_> = all[..fail_at.min(all.len())].iter().rev().cloned().collect();
            assert_eq!(released, expected, "failing at stage {fail_at}");
            assert!(ledger.is_empty());
        }
    }

    #[test]
    fn test_interrupt_unwinds() {
        use std::sync::atomic::{AtomicBool, Ordering};

        // Ctrl-C arrives while stage 5 is being acquired.
        fn run(ledger: &mut Ledger, flag: &AtomicBool) -> Result<()> {
            for (i, acquisition) in stages().into_iter().enumerate() {
                if i == 5 {
                    flag.store(true, Ordering::SeqCst);
                }
                interrupt::check_flag(flag)?;
                ledger.record(acquisition);
            }
            Ok(())
        }

        let flag = AtomicBool::new(false);
        let mut ledger = Ledger::default();
        let result = run(&mut ledger, &flag);
        let mut released = Vec::new();
        let err = conclude(result, &mut ledger, true, |l| {
            l.unwind_with(|a| {
                released.push(a.clone());
                Ok(())
            })
        })
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::InstallError>(),
            Some(crate::error::InstallError::Interrupted)
        ));
        let expected: Vec<_> = stages()[..5].iter().rev().cloned().collect();
        assert_eq!(released, expected);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_failed_release_keeps_original_error() {
        let mut ledger = Ledger::default();
        let result = simulate(&mut ledger, 4);
        let mut attempts = 0;
        let err = conclude(result, &mut ledger, true, |l| {
            l.unwind_with(|a| {
                attempts += 1;
                match a {
                    Acquisition::PoolExport(_) => anyhow::bail!("pool is busy"),
                    _ => Ok(()),
                }
            })
        })
        .unwrap_err();
        assert_eq!(attempts, 4);
        assert_eq!(err.to_string(), "stage 4 failed");
    }

    #[test]
    fn test_success_release_failure_is_fatal() {
        let mut ledger = Ledger::default();
        let result = simulate(&mut ledger, usize::MAX);
        let err = conclude(result, &mut ledger, false, |l| {
            l.unwind_with(|a| match a {
                Acquisition::LoopDetach(_) => anyhow::bail!("device busy"),
                _ => Ok(()),
            })
        })
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::InstallError>(),
            Some(crate::error::InstallError::UnwindFailed { attempted: 7, .. })
        ));
    }

    #[test]
    fn test_no_cleanup_keeps_records() {
        let mut ledger = Ledger::default();
        let result = simulate(&mut ledger, 3);
        let r = conclude(result, &mut ledger, false, |_| panic!("must not release"));
        assert!(r.is_err());
        assert_eq!(ledger.len(), 3);
        // Tests must not leave warnings about real devices behind
        ledger.unwind_with(|_| Ok(())).unwrap();
    }

    #[test]
    fn test_validate() {
        sample_spec().validate().unwrap();

        let cases: [fn(&mut TargetSpec); 8] = [
            |s| s.pool_name = "1tank".into(),
            |s| s.pool_name = "mirror0".into(),
            |s| s.pool_name = "log".into(),
            |s| s.pool_name = "tank/ROOT".into(),
            |s| s.host_name = String::new(),
            |s| s.swap_size_mib = 0,
            |s| s.luks_passphrase = Some(String::new()),
            |s| s.boot_device = Some("/var/tmp/disk.img".into()),
        ];
        for (i, modify) in cases.iter().enumerate() {
            let mut spec = sample_spec();
            modify(&mut spec);
            assert!(spec.validate().is_err(), "case {i} should be rejected");
        }

        for name in ["logs", "logpool", "spool"] {
            let mut spec = sample_spec();
            spec.pool_name = name.into();
            spec.validate().unwrap();
        }
    }

    #[test]
    fn test_paths() {
        let mut spec = sample_spec();
        assert_eq!(spec.altroot(), "/var/tmp/tank");
        assert_eq!(spec.disks(), [Utf8PathBuf::from("/var/tmp/disk.img")]);
        spec.boot_device = Some("/var/tmp/boot.img".into());
        assert_eq!(
            spec.disks(),
            [
                Utf8PathBuf::from("/var/tmp/disk.img"),
                Utf8PathBuf::from("/var/tmp/boot.img")
            ]
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut spec = sample_spec();
        spec.luks_passphrase = Some("hunter2".into());
        let s = format!("{spec:?}");
        assert!(!s.contains("hunter2"));
        assert!(!s.contains("password"));
        assert!(s.contains("encrypted: true"));
    }
}

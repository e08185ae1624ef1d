//! Finishing the install by booting the image under QEMU with the
//! finalize script as init.

use std::fs;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use zfs_install_utils::CommandRunExt;

use crate::bootloader::{self, FAILURE_EXIT_PORT, FINALIZE_SCRIPT};
use crate::error::InstallError;
use crate::luks::EncryptedVolume;
use crate::pool::ROOT_DATASET;

/// The kernel and initramfs to boot, copied out of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BootImages {
    pub(crate) kernel: Utf8PathBuf,
    pub(crate) initrd: Utf8PathBuf,
}

/// Pick the newest kernel version among the names of a `/boot` directory.
fn newest_kernel_version<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    names
        .into_iter()
        .filter_map(|n| n.strip_prefix("vmlinuz-"))
        .filter(|v| !v.contains("rescue"))
        .max_by(|a, b| compare_versions(a, b))
}

/// Compare kernel versions, numeric runs numerically.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let split = |s: &str| -> Vec<Result<u64, String>> {
        s.split(|c: char| !c.is_ascii_alphanumeric())
            .map(|p| p.parse::<u64>().map_err(|_| p.to_string()))
            .collect()
    };
    split(a).cmp(&split(b))
}

/// Copy the newest kernel and its initramfs from `root` into `dest`, so
/// they can be booted after the target is unmounted.
#[context("Extracting kernel and initramfs")]
pub(crate) fn extract_boot_images(root: &Utf8Path, dest: &Utf8Path) -> Result<BootImages> {
    let boot = root.join("boot");
    let names = boot
        .read_dir_utf8()
        .with_context(|| format!("Reading {boot}"))?
        .map(|e| e.map(|e| e.file_name().to_string()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Reading {boot}"))?;
    let version = newest_kernel_version(names.iter().map(String::as_str))
        .ok_or_else(|| anyhow::anyhow!("No kernel found in {boot}"))?;
    let kernel_src = boot.join(format!("vmlinuz-{version}"));
    let initrd_src = boot.join(format!("initramfs-{version}.img"));
    if !initrd_src.exists() {
        anyhow::bail!("No initramfs for kernel {version} in {boot}");
    }
    fs::create_dir_all(dest).with_context(|| format!("Creating {dest}"))?;
    let images = BootImages {
        kernel: dest.join("vmlinuz"),
        initrd: dest.join("initrd.img"),
    };
    fs::copy(&kernel_src, &images.kernel).with_context(|| format!("Copying {kernel_src}"))?;
    fs::copy(&initrd_src, &images.initrd).with_context(|| format!("Copying {initrd_src}"))?;
    tracing::debug!("Using kernel {version}");
    Ok(images)
}

/// Whether `/proc/cpuinfo` content advertises hardware virtualization.
fn cpu_supports_virtualization(cpuinfo: &str) -> bool {
    cpuinfo
        .lines()
        .filter(|l| l.starts_with("flags"))
        .flat_map(|l| l.split_whitespace())
        .any(|f| f == "vmx" || f == "svm")
}

/// How the emulated CPU is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accel {
    Kvm,
    Emulated,
}

impl Accel {
    pub(crate) fn detect() -> Self {
        let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
        if Utf8Path::new("/dev/kvm").exists() && cpu_supports_virtualization(&cpuinfo) {
            Accel::Kvm
        } else {
            tracing::warn!("KVM unavailable; finalizing under pure emulation, this will be slow");
            Accel::Emulated
        }
    }
}

/// The kernel command line of the finalize boot.
pub(crate) fn kernel_cmdline(
    pool: &str,
    luks: Option<&EncryptedVolume>,
    hostid: Option<u32>,
) -> String {
    let mut args = vec![
        format!("root=ZFS={pool}/{ROOT_DATASET}"),
        "rw".to_string(),
        "console=ttyS0".to_string(),
        // Init exiting panics the kernel; don't sit on the panic forever.
        "panic=1".to_string(),
        format!("init={FINALIZE_SCRIPT}"),
    ];
    if let Some(luks) = luks {
        args.push(bootloader::luks_kernel_args(luks));
    }
    if let Some(hostid) = hostid {
        args.push(format!("spl_hostid=0x{hostid:08x}"));
    }
    args.join(" ")
}

/// Builder for the QEMU command line.
#[derive(Debug)]
pub(crate) struct QemuBuilder {
    accel: Accel,
    memory_mib: u32,
    disks: Vec<Utf8PathBuf>,
    kernel: Option<(BootImages, String)>,
}

impl QemuBuilder {
    pub(crate) fn new(accel: Accel, memory_mib: u32) -> Self {
        Self {
            accel,
            memory_mib,
            disks: Vec::new(),
            kernel: None,
        }
    }

    pub(crate) fn disk(mut self, path: &Utf8Path) -> Self {
        self.disks.push(path.to_owned());
        self
    }

    /// Boot `images` directly with `cmdline`.
    pub(crate) fn direct_boot(mut self, images: &BootImages, cmdline: String) -> Self {
        self.kernel = Some((images.clone(), cmdline));
        self
    }

    pub(crate) fn build(self) -> Command {
        let mut cmd = Command::new("qemu-system-x86_64");
        match self.accel {
            Accel::Kvm => cmd.args(["-enable-kvm", "-cpu", "host"]),
            Accel::Emulated => cmd.args(["-cpu", "qemu64"]),
        };
        cmd.args(["-m", &self.memory_mib.to_string()]);
        for disk in &self.disks {
            cmd.args(["-drive", &format!("file={disk},format=raw,if=ide")]);
        }
        if let Some((images, cmdline)) = &self.kernel {
            cmd.args(["-kernel", images.kernel.as_str()]);
            cmd.args(["-initrd", images.initrd.as_str()]);
            cmd.args(["-append", cmdline.as_str()]);
        }
        // A failed finalize script writes to this port, ending the emulator
        // with a failure status.
        cmd.arg("-device")
            .arg(format!("isa-debug-exit,iobase={FAILURE_EXIT_PORT:#x},iosize=0x04"));
        // A guest kernel panic is reported through pvpanic and must not
        // turn into the clean reboot that signals success.
        cmd.args(["-device", "pvpanic", "-action", "panic=exit-failure"]);
        // The finalize script reboots when done; make that end the emulator.
        cmd.args(["-no-reboot", "-nographic"]);
        cmd
    }
}

/// Boot `disks` under QEMU, running the finalize script, and wait for it.
#[context("Finalizing image")]
pub(crate) fn boot_and_finalize(
    images: &BootImages,
    pool: &str,
    disks: &[Utf8PathBuf],
    luks: Option<&EncryptedVolume>,
    hostid: Option<u32>,
) -> Result<()> {
    let mut builder = QemuBuilder::new(Accel::detect(), 2048)
        .direct_boot(images, kernel_cmdline(pool, luks, hostid));
    for disk in disks {
        builder = builder.disk(disk);
    }
    let mut cmd = builder.build();
    tracing::info!("Booting image to install the bootloader");
    let status = cmd
        .log_debug()
        .status()
        .context("Spawning qemu-system-x86_64")?;
    if !status.success() {
        return Err(InstallError::FinalizeBootFailed {
            kernel: images.kernel.clone(),
            status,
        }
        .into());
    }
    Ok(())
}

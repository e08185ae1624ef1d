//! Preparing the target root so that tools can run inside it via chroot(8),
//! and populating its host identity files.

use std::fs::{self, File, Permissions};
use std::io::Read;
use std::os::unix::fs::{symlink, PermissionsExt};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::install::TargetSpec;
use crate::ledger::{Acquisition, Ledger};
use crate::luks::EncryptedVolume;
use crate::pool;
use crate::task::Task;

/// Device classes of the host which must not leak into the target.
const DEV_EXCLUDES: &[&str] = &["mapper", "zvol", "disk", "sd*", "zd*", "dm-*"];

/// A mount still to be made under the target root.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingMount {
    source: String,
    target: Utf8PathBuf,
    fstype: Option<&'static str>,
}

impl PendingMount {
    fn acquisition(&self) -> Acquisition {
        Acquisition::Unmount(self.target.clone())
    }
}

/// The mounts tools in the chroot need, minus those `is_mounted` reports
/// as already in place.
fn plan_mounts<F>(
    root: &Utf8Path,
    boot_dev: &Utf8Path,
    is_mounted: F,
) -> Result<Vec<PendingMount>>
where
    F: Fn(&Utf8Path) -> Result<bool>,
{
    let mounts = [
        ("boot", boot_dev.as_str(), None),
        ("sys", "sysfs", Some("sysfs")),
        ("proc", "proc", Some("proc")),
    ];
    let mut pending = Vec::new();
    for (dir, source, fstype) in mounts {
        let target = root.join(dir);
        if is_mounted(&target)? {
            tracing::debug!("{target} is already mounted");
            continue;
        }
        pending.push(PendingMount {
            source: source.to_string(),
            target,
            fstype,
        });
    }
    Ok(pending)
}

/// Mount the boot partition, sysfs and procfs under `root`, recording each
/// mount made.
///
/// Anything already mounted is left alone and not recorded.
#[context("Mounting filesystems under {root}")]
pub(crate) fn mount_virtual_filesystems(
    root: &Utf8Path,
    boot_dev: &Utf8Path,
    ledger: &mut Ledger,
) -> Result<()> {
    for dir in ["boot", "sys", "proc"] {
        let target = root.join(dir);
        if !target.exists() {
            fs::create_dir_all(&target).with_context(|| format!("Creating {target}"))?;
        }
    }
    for m in plan_mounts(root, boot_dev, zfs_install_mount::is_mountpoint)? {
        zfs_install_mount::mount(&m.source, &m.target, m.fstype)?;
        ledger.record(m.acquisition());
    }
    Ok(())
}

fn rsync_dev_args(root: &Utf8Path) -> Vec<String> {
    let mut args = vec!["-ax".to_string(), "--numeric-ids".to_string()];
    args.extend(DEV_EXCLUDES.iter().map(|e| format!("--exclude=/{e}")));
    args.push("/dev/".into());
    args.push(format!("{}/", root.join("dev")));
    args
}

/// Copy the host's generic device nodes into the target.
#[context("Syncing device nodes into {root}")]
pub(crate) fn sync_device_nodes(root: &Utf8Path) -> Result<()> {
    Task::new("Copying device nodes", "rsync")
        .quiet()
        .args(rsync_dev_args(root))
        .run()
}

/// The fstab of an installation in `pool`.
pub(crate) fn fstab_contents(pool: &str) -> String {
    format!(
        "{pool}/{root} / zfs defaults,x-systemd-device-timeout=0 0 0\n\
         LABEL=boot /boot ext4 noatime 0 1\n\
         {swap} swap swap discard 0 0\n",
        root = pool::ROOT_DATASET,
        swap = pool::swap_device(pool),
    )
}

/// Write `contents` to `path` unless it exists. Returns `true` if written.
fn write_if_absent(path: &Utf8Path, contents: &[u8], mode: Option<u32>) -> Result<bool> {
    if path.symlink_metadata().is_ok() {
        tracing::debug!("{path} exists");
        return Ok(false);
    }
    fs::write(path, contents).with_context(|| format!("Writing {path}"))?;
    if let Some(mode) = mode {
        fs::set_permissions(path, Permissions::from_mode(mode))
            .with_context(|| format!("Setting mode of {path}"))?;
    }
    Ok(true)
}

fn random_hostid() -> Result<[u8; 4]> {
    let mut buf = [0u8; 4];
    File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut buf))
        .context("Reading /dev/urandom")?;
    Ok(buf)
}

/// Read `etc/hostid` of `root`, in the byte order the kernel module
/// expects for `spl_hostid`.
#[context("Reading hostid")]
pub(crate) fn read_hostid(root: &Utf8Path) -> Result<Option<u32>> {
    let path = root.join("etc/hostid");
    if !path.exists() {
        return Ok(None);
    }
    let buf = fs::read(&path).with_context(|| format!("Reading {path}"))?;
    let bytes: [u8; 4] = buf
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| anyhow::anyhow!("{path} is shorter than 4 bytes"))?;
    Ok(Some(u32::from_le_bytes(bytes)))
}

/// Write the files identifying the installed host.
///
/// The fstab is always rewritten; everything else is only created.
#[context("Writing identity files")]
pub(crate) fn write_identity_files(
    root: &Utf8Path,
    spec: &TargetSpec,
    luks: Option<&EncryptedVolume>,
) -> Result<()> {
    let etc = root.join("etc");
    fs::create_dir_all(&etc).with_context(|| format!("Creating {etc}"))?;

    let fstab = etc.join("fstab");
    fs::write(&fstab, fstab_contents(&spec.pool_name))
        .with_context(|| format!("Writing {fstab}"))?;

    let mtab = etc.join("mtab");
    if mtab.symlink_metadata().is_err() {
        symlink("../proc/self/mounts", &mtab).with_context(|| format!("Linking {mtab}"))?;
    }

    let resolv = etc.join("resolv.conf");
    if resolv.symlink_metadata().is_err() {
        fs::copy("/etc/resolv.conf", &resolv).context("Copying host resolv.conf")?;
    }

    write_if_absent(
        &etc.join("hostname"),
        format!("{}\n", spec.host_name).as_bytes(),
        None,
    )?;
    let hostid = etc.join("hostid");
    if hostid.symlink_metadata().is_err() {
        write_if_absent(&hostid, &random_hostid()?, None)?;
    }
    write_if_absent(&etc.join("locale.conf"), b"LANG=\"en_US.UTF-8\"\n", None)?;
    write_if_absent(&etc.join("vconsole.conf"), b"KEYMAP=\"us\"\n", None)?;
    if let Some(luks) = luks {
        write_if_absent(
            &etc.join("crypttab"),
            luks.crypttab_line().as_bytes(),
            Some(0o600),
        )?;
    }
    Ok(())
}

/// Whether the password field of `user` in `shadow` is locked or unset.
fn password_unset(shadow: &str, user: &str) -> Result<bool> {
    let entry = shadow
        .lines()
        .find_map(|l| l.strip_prefix(user)?.strip_prefix(':'))
        .ok_or_else(|| anyhow::anyhow!("No shadow entry for {user}"))?;
    let hash = entry.split(':').next().unwrap_or_default();
    Ok(matches!(hash, "" | "*" | "!" | "!!" | "!*") || hash.starts_with('!'))
}

/// The chpasswd(8) input line setting `password` for `user`.
fn chpasswd_line(user: &str, password: &str) -> String {
    format!("{user}:{password}\n")
}

/// Set the root password of the target, unless one is already set.
#[context("Setting root password")]
pub(crate) fn set_root_password_if_unset(root: &Utf8Path, password: &str) -> Result<bool> {
    let shadow_path = root.join("etc/shadow");
    let shadow =
        fs::read_to_string(&shadow_path).with_context(|| format!("Reading {shadow_path}"))?;
    if !password_unset(&shadow, "root")? {
        tracing::debug!("Root password already set");
        return Ok(false);
    }
    Task::new_chroot("Setting root password", root, "chpasswd")
        .run_with_stdin(chpasswd_line("root", password).as_bytes())?;
    Ok(true)
}

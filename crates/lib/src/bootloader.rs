//! Bootloader configuration of the target: the GRUB config generator
//! patch and the script finishing the install from inside the image.

use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::luks::EncryptedVolume;

/// The GRUB config generator, relative to the target root.
pub(crate) const GRUB_MKCONFIG: &str = "usr/sbin/grub2-mkconfig";
/// Path of the finalize script inside the target, used as `init=`.
pub(crate) const FINALIZE_SCRIPT: &str = "/installbootloader";
/// I/O port of the emulator's isa-debug-exit device. Writing a byte `v`
/// there ends the emulator with status `(v << 1) | 1`.
pub(crate) const FAILURE_EXIT_PORT: u16 = 0xf4;

/// The root device detection line we replace.
const ROOT_DEVICE_LINE: &str = "GRUB_DEVICE=\"`${grub_probe} --target=device /`\"";
/// Present in the generator once patched.
const PATCH_MARKER: &str = "GRUB_DEVICE=\"ZFS=";

const ROOT_DEVICE_PATCH: &str = indoc::indoc! { r#"
    if [ "`stat -f -c %T /`" = "zfs" ] ; then
      GRUB_DEVICE="ZFS=`zfs list -H -o name / 2>/dev/null`"
    else
      GRUB_DEVICE="`${grub_probe} --target=device /`"
    fi"# };

/// Make the root device detection of the generator understand datasets.
fn patch_generator(contents: &str) -> Result<String> {
    if !contents.lines().any(|l| l.trim() == ROOT_DEVICE_LINE) {
        anyhow::bail!("Root device detection not found in {GRUB_MKCONFIG}");
    }
    let mut patched = String::with_capacity(contents.len() + ROOT_DEVICE_PATCH.len());
    for line in contents.split_inclusive('\n') {
        if line.trim() == ROOT_DEVICE_LINE {
            patched.push_str(ROOT_DEVICE_PATCH);
            patched.push('\n');
        } else {
            patched.push_str(line);
        }
    }
    Ok(patched)
}

/// Patch the target's GRUB config generator, once.
///
/// The original is kept next to it as `.orig`. Returns `true` if the
/// generator was modified.
#[context("Patching {GRUB_MKCONFIG}")]
pub(crate) fn patch_bootloader_generator(root: &Utf8Path) -> Result<bool> {
    let target = root.join(GRUB_MKCONFIG);
    let contents = fs::read_to_string(&target).with_context(|| format!("Reading {target}"))?;
    if contents.contains(PATCH_MARKER) {
        tracing::debug!("{target} is already patched");
        return Ok(false);
    }
    let backup = target.with_extension("orig");
    if !backup.exists() {
        fs::copy(&target, &backup).with_context(|| format!("Backing up to {backup}"))?;
    }
    let patched = patch_generator(&contents)?;
    let scratch = target.with_extension("tmp");
    fs::write(&scratch, patched).with_context(|| format!("Writing {scratch}"))?;
    fs::set_permissions(&scratch, Permissions::from_mode(0o755))
        .with_context(|| format!("Setting mode of {scratch}"))?;
    fs::rename(&scratch, &target).with_context(|| format!("Replacing {target}"))?;
    tracing::info!("Patched {GRUB_MKCONFIG} for ZFS root detection");
    Ok(true)
}

/// The kernel arguments unlocking `luks` in the initramfs.
pub(crate) fn luks_kernel_args(luks: &EncryptedVolume) -> String {
    format!("rd.luks.uuid={} rd.luks.allow-discards", luks.name)
}

/// The script run as init in the emulated boot. It installs and
/// configures the bootloader, then reboots, which ends the emulator.
pub(crate) fn finalize_script(pool: &str, luks: Option<&EncryptedVolume>) -> String {
    let mut s = indoc::formatdoc! { r#"
        #!/bin/bash -xe
        error() {{
            retval=$?
            echo "There was an unrecoverable error finishing setup" >&2
            printf '\x01' | dd of=/dev/port bs=1 seek={port} count=1 2>/dev/null || true
            exit $retval
        }}
        trap error ERR
        export PATH=/sbin:/usr/sbin:/bin:/usr/bin
        mountpoint -q /proc || mount -t proc proc /proc
        mountpoint -q /sys || mount -t sysfs sysfs /sys
        mountpoint -q /dev || mount -t devtmpfs devtmpfs /dev
        mount /boot
        mount -o remount,rw /
        grub2-install /dev/sda
    "#, port = FAILURE_EXIT_PORT };
    if let Some(luks) = luks {
        s.push_str("touch /etc/default/grub\n");
        s.push_str("sed -i '/^GRUB_CMDLINE_LINUX=/d' /etc/default/grub\n");
        s.push_str(&format!(
            "echo 'GRUB_CMDLINE_LINUX=\"{}\"' >> /etc/default/grub\n",
            luks_kernel_args(luks)
        ));
    }
    s.push_str("grub2-mkconfig -o /boot/grub2/grub.cfg\n");
    s.push_str(&format!("zfs inherit com.sun:auto-snapshot \"{pool}\"\n"));
    s.push_str(&format!(
        "zpool set cachefile=/etc/zfs/zpool.cache \"{pool}\"\n"
    ));
    s.push_str(indoc::indoc! { r#"
        for kver in /lib/modules/* ; do
            kver=$(basename "$kver")
            dracut -f "/boot/initramfs-$kver.img" "$kver"
        done
        umount /boot
        rm -f /installbootloader
        sync
        echo 1 > /proc/sys/kernel/sysrq
        echo b > /proc/sysrq-trigger
    "# });
    s
}

/// Write the finalize script into `root`.
#[context("Writing finalize script")]
pub(crate) fn write_finalize_script(
    root: &Utf8Path,
    pool: &str,
    luks: Option<&EncryptedVolume>,
) -> Result<()> {
    let path = root.join(FINALIZE_SCRIPT.trim_start_matches('/'));
    fs::write(&path, finalize_script(pool, luks)).with_context(|| format!("Writing {path}"))?;
    fs::set_permissions(&path, Permissions::from_mode(0o755))
        .with_context(|| format!("Setting mode of {path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENERATOR: &str = indoc::indoc! { r#"
        #! /bin/sh
        set -e
        # Device containing our userland.  Typically used for root= parameter.
        GRUB_DEVICE="`${grub_probe} --target=device /`"
        GRUB_DEVICE_UUID="`${grub_probe} --device ${GRUB_DEVICE} --target=fs_uuid 2> /dev/null`" || true
    "# };

    #[test]
    fn test_patch_generator() -> Result<()> {
        let patched = patch_generator(GENERATOR)?;
        assert!(patched.contains(PATCH_MARKER));
        assert!(patched.contains("zfs list -H -o name /"));
        assert!(patched.ends_with("--target=fs_uuid 2> /dev/null`\" || true\n"));
        assert!(patch_generator("#! /bin/sh\n").is_err());
        Ok(())
    }

    #[test]
    fn test_patch_idempotent() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        fs::create_dir_all(root.join("usr/sbin"))?;
        let target = root.join(GRUB_MKCONFIG);
        fs::write(&target, GENERATOR)?;

        assert!(patch_bootloader_generator(root)?);
        let once = fs::read_to_string(&target)?;
        assert_eq!(fs::metadata(&target)?.permissions().mode() & 0o777, 0o755);
        assert_eq!(
            fs::read_to_string(root.join("usr/sbin/grub2-mkconfig.orig"))?,
            GENERATOR
        );
        assert!(!root.join("usr/sbin/grub2-mkconfig.tmp").exists());

        assert!(!patch_bootloader_generator(root)?);
        assert_eq!(fs::read_to_string(&target)?, once);
        assert_eq!(
            fs::read_to_string(root.join("usr/sbin/grub2-mkconfig.orig"))?,
            GENERATOR
        );
        Ok(())
    }

    #[test]
    fn test_finalize_script() {
        let plain = finalize_script("tank", None);
        assert!(plain.starts_with("#!/bin/bash -xe\n"));
        assert!(plain.contains("grub2-install /dev/sda\n"));
        assert!(plain.contains("grub2-mkconfig -o /boot/grub2/grub.cfg\n"));
        assert!(plain.contains("zfs inherit com.sun:auto-snapshot \"tank\"\n"));
        assert!(plain.contains("zpool set cachefile=/etc/zfs/zpool.cache \"tank\"\n"));
        assert!(!plain.contains("rd.luks"));
        assert!(plain.ends_with("echo b > /proc/sysrq-trigger\n"));
        // A failure stops the emulator rather than leaving init to exit
        assert!(plain.contains(
            "printf '\\x01' | dd of=/dev/port bs=1 seek=244 count=1 2>/dev/null || true\n"
        ));
        assert!(plain.find("dd of=/dev/port").unwrap() < plain.find("trap error ERR").unwrap());
        // The bootloader must be installed before its config is generated
        let install = plain.find("grub2-install").unwrap();
        let mkconfig = plain.find("grub2-mkconfig").unwrap();
        assert!(install < mkconfig);

        let luks = EncryptedVolume::from_uuid("abcd1234");
        let encrypted = finalize_script("tank", Some(&luks));
        assert!(encrypted.contains(
            "echo 'GRUB_CMDLINE_LINUX=\"rd.luks.uuid=luks-abcd1234 rd.luks.allow-discards\"' >> /etc/default/grub\n"
        ));
        let cmdline = encrypted.find("GRUB_CMDLINE_LINUX=").unwrap();
        assert!(cmdline < encrypted.find("grub2-mkconfig").unwrap());
    }

    #[test]
    fn test_write_finalize_script() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        write_finalize_script(root, "tank", None)?;
        let path = root.join("installbootloader");
        assert_eq!(fs::read_to_string(&path)?, finalize_script("tank", None));
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o755);
        Ok(())
    }
}

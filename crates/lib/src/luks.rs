//! LUKS encrypted volumes holding the pool.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::blockdev;
use crate::ledger::{Acquisition, Ledger};
use crate::task::Task;

/// Prefix of the device mapper name of an opened volume.
pub(crate) const MAPPING_PREFIX: &str = "luks-";

/// An opened encrypted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EncryptedVolume {
    /// LUKS header UUID of the underlying partition.
    pub(crate) uuid: String,
    /// Device mapper name, `luks-<uuid>`.
    pub(crate) name: String,
}

impl EncryptedVolume {
    pub(crate) fn from_uuid(uuid: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            name: format!("{MAPPING_PREFIX}{uuid}"),
        }
    }

    /// The decrypted block device.
    pub(crate) fn device(&self) -> Utf8PathBuf {
        Utf8Path::new("/dev/mapper").join(&self.name)
    }

    /// The `/etc/crypttab` line unlocking this volume at boot.
    pub(crate) fn crypttab_line(&self) -> String {
        format!("{} UUID={} none discard\n", self.name, self.uuid)
    }
}

fn luks_uuid(partition: &Utf8Path) -> Result<Option<String>> {
    blockdev::filesystem_uuid(partition)
}

/// The steps [`ensure_encrypted_volume`] takes for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EncryptionPlan {
    format: bool,
    open: bool,
}

impl EncryptionPlan {
    /// Plan from the partition's UUID, if any, and whether the mapping
    /// derived from that UUID already exists.
    fn new(uuid: Option<&str>, mapping_open: bool) -> Self {
        let format = uuid.is_none();
        Self {
            format,
            open: format || !mapping_open,
        }
    }

    /// What the run must release after carrying out this plan on `volume`.
    fn acquisition(self, volume: &EncryptedVolume) -> Option<Acquisition> {
        self.open.then(|| Acquisition::EncryptedClose(volume.name.clone()))
    }
}

/// Make sure `partition` is a LUKS volume and is open.
///
/// The partition is formatted only when it carries no UUID at all, and
/// opened only when its mapping does not exist yet. Opening records an
/// [`Acquisition::EncryptedClose`].
#[context("Setting up encryption on {partition}")]
pub(crate) fn ensure_encrypted_volume(
    partition: &Utf8Path,
    passphrase: &str,
    ledger: &mut Ledger,
) -> Result<EncryptedVolume> {
    let existing = luks_uuid(partition)?;
    let mapping_open = existing
        .as_deref()
        .is_some_and(|uuid| EncryptedVolume::from_uuid(uuid).device().exists());
    let plan = EncryptionPlan::new(existing.as_deref(), mapping_open);
    let uuid = match existing {
        Some(uuid) if !plan.format => {
            tracing::debug!("{partition} already formatted ({uuid})");
            uuid
        }
        _ => {
            Task::new(format!("Formatting {partition} with LUKS"), "cryptsetup")
                .args(["-q", "luksFormat", "--key-file=-"])
                .arg(partition)
                .run_with_stdin(passphrase.as_bytes())?;
            blockdev::udev_settle()?;
            luks_uuid(partition)?
                .ok_or_else(|| anyhow::anyhow!("No UUID on {partition} after luksFormat"))?
        }
    };
    let volume = EncryptedVolume::from_uuid(&uuid);
    if plan.open {
        Task::new(format!("Opening {partition} as {}", volume.name), "cryptsetup")
            .args(["luksOpen", "--key-file=-"])
            .arg(partition)
            .arg(&volume.name)
            .run_with_stdin(passphrase.as_bytes())?;
    } else {
        tracing::debug!("{} is already open", volume.device());
    }
    if let Some(acquisition) = plan.acquisition(&volume) {
        ledger.record(acquisition);
    }
    Ok(volume)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_name() {
        let v = EncryptedVolume::from_uuid("abcd1234");
        assert_eq!(v.name, "luks-abcd1234");
        assert_eq!(v.device(), "/dev/mapper/luks-abcd1234");
        assert_eq!(
            v.crypttab_line(),
            "luks-abcd1234 UUID=abcd1234 none discard\n"
        );
    }

    #[test]
    fn test_encryption_plan() {
        let volume = EncryptedVolume::from_uuid("abcd1234");
        let close = Some(Acquisition::EncryptedClose("luks-abcd1234".into()));

        // Formatted and open from an earlier run: nothing to do or release.
        let plan = EncryptionPlan::new(Some("abcd1234"), true);
        assert!(!plan.format && !plan.open);
        assert_eq!(plan.acquisition(&volume), None);

        let plan = EncryptionPlan::new(Some("abcd1234"), false);
        assert!(!plan.format && plan.open);
        assert_eq!(plan.acquisition(&volume), close);

        // A mapping cannot be open without a header to name it.
        for mapping_open in [false, true] {
            let plan = EncryptionPlan::new(None, mapping_open);
            assert!(plan.format && plan.open);
            assert_eq!(plan.acquisition(&volume), close);
        }
    }
}

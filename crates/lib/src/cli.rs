//! # Command line interface
//!
//! Parsing of the command line into a target description, and the
//! top level entrypoint.

use std::ffi::OsString;

use anyhow::{ensure, Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use rustix::process::getuid;

use crate::blockdev::parse_size_mib;
use crate::install::{self, TargetSpec};

/// Install Fedora into a ZFS pool on a block device or disk image, then
/// boot the result once to install the bootloader.
#[derive(Debug, Parser)]
#[clap(name = "zfs-install", version)]
pub struct Opt {
    /// Block device or image file to install to. A missing file is
    /// created with `--vol-size`.
    pub volume: Utf8PathBuf,

    /// Size of the image file when it is created (e.g. `11000`, `12G`).
    #[clap(long, value_parser = parse_size_mib, default_value = "11000")]
    pub vol_size: u64,

    /// Put `/boot` on this separate device or image file instead of a
    /// partition of the volume.
    #[clap(long, value_name = "PATH")]
    pub separate_boot: Option<Utf8PathBuf>,

    /// Size of the boot partition or boot image file.
    #[clap(long, value_parser = parse_size_mib, default_value = "256")]
    pub boot_size: u64,

    /// Name of the ZFS pool.
    #[clap(long, default_value = "tank")]
    pub pool_name: String,

    /// Host name of the installed system.
    #[clap(long, default_value = "localhost.localdomain")]
    pub host_name: String,

    /// Root password of the installed system, if it has none yet.
    #[clap(long, default_value = "password")]
    pub root_password: String,

    /// Size of the swap volume.
    #[clap(long, value_parser = parse_size_mib, default_value = "1024")]
    pub swap_size: u64,

    /// Fedora release to install.
    #[clap(long, default_value_t = 40)]
    pub releasever: u32,

    /// Encrypt the pool with LUKS using this passphrase.
    #[clap(long)]
    pub luks_password: Option<String>,

    /// Leave acquired devices, pools and mounts in place when the
    /// install fails.
    #[clap(long)]
    pub no_cleanup: bool,

    /// Directory holding the pool mount point and the extracted kernel.
    /// Defaults to the current directory.
    #[clap(long)]
    pub workdir: Option<Utf8PathBuf>,

    /// Increase log verbosity; repeat for more.
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Opt {
    /// The log filter used when `RUST_LOG` is unset.
    pub fn log_directive(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    fn into_target(self) -> Result<TargetSpec> {
        let workdir = match self.workdir {
            Some(w) => w,
            None => {
                let cwd = std::env::current_dir().context("Querying current directory")?;
                Utf8PathBuf::try_from(cwd).context("Current directory is not UTF-8")?
            }
        };
        let spec = TargetSpec {
            volume: self.volume,
            volume_size_mib: self.vol_size,
            boot_device: self.separate_boot,
            boot_size_mib: self.boot_size,
            pool_name: self.pool_name,
            host_name: self.host_name,
            root_password: self.root_password,
            swap_size_mib: self.swap_size,
            releasever: self.releasever,
            luks_passphrase: self.luks_password,
            cleanup: !self.no_cleanup,
            workdir,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Run an install as described by `opt`.
pub fn run(opt: Opt) -> Result<()> {
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    ensure!(getuid().is_root(), "Must run as the root user");
    let spec = opt.into_target()?;
    install::install(&spec)
}

/// Parse the provided arguments, set up logging and run.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    zfs_install_utils::initialize_tracing(opt.log_directive());
    run(opt)
}

//! The main entrypoint for zfs-install, the Fedora on ZFS installer.

use anyhow::Result;

fn run() -> Result<()> {
    zfs_install_lib::cli::run_from_iter(std::env::args_os())
}

fn main() {
    // In order to print the error in a custom format (with :#) our
    // main simply invokes a run() where all the work is done.
    // This code just captures any errors.
    if let Err(e) = run() {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

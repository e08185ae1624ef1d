//! # Fedora on ZFS installer
//!
//! Provisions a pool on block devices or image files, installs Fedora into
//! it from the host, and finishes the install by booting the result once.

pub mod cli;
mod bootloader;
mod chroot;
mod error;
mod finalize;
mod install;
mod interrupt;
mod ledger;
mod luks;
mod packages;
mod pool;
mod task;

pub(crate) use zfs_install_blockdev as blockdev;

//! System provider for storechain.
//!
//! Integrates with the host via:
//! - `lvm` (pvs/vgs/lvs, pvcreate, vgcreate, lvcreate, vgchange)
//! - `systemctl` and `journalctl` for the boot units
//! - `qemu-img`, `mkfs.*`, `blkid`, `mount` and `udevadm`
//! - `/proc/mounts`, sysfs and the account database

mod accounts;
mod command;
mod system;

pub use system::{SystemHost, MOUNTS_PATH_ENV};

//! Provider contract for host-level tools: image creation, filesystems,
//! mounts, device probes and the account database.

use crate::ToolStatus;
use std::error::Error;
use std::path::Path;

pub trait HostTools {
    type Error: Error + Send + Sync + 'static;

    /// Create a disk image of `format` and `size` at `path`.
    fn create_image(&self, path: &Path, format: &str, size: &str)
        -> Result<ToolStatus, Self::Error>;

    /// Format `device` with `fs_type`, overwriting any existing signature.
    fn make_filesystem(&self, fs_type: &str, device: &Path) -> Result<ToolStatus, Self::Error>;

    /// Probe the filesystem signature on `device`. `None` means no signature.
    fn filesystem_type(&self, device: &Path) -> Result<Option<String>, Self::Error>;

    /// Mount `mountpoint` using its mount-table entry.
    fn mount(&self, mountpoint: &Path) -> Result<ToolStatus, Self::Error>;

    fn is_mounted(&self, mountpoint: &Path) -> Result<bool, Self::Error>;

    fn is_block_device(&self, path: &Path) -> bool;

    /// Block device exists, reports a non-zero size and serves a 1 KiB read.
    fn device_ready(&self, path: &Path) -> bool;

    /// Wait for the device event queue to drain.
    fn settle(&self) -> Result<ToolStatus, Self::Error>;

    /// Resolve a user name to its uid.
    fn lookup_user(&self, name: &str) -> Result<Option<u32>, Self::Error>;

    /// Resolve a group name to its gid.
    fn lookup_group(&self, name: &str) -> Result<Option<u32>, Self::Error>;

    /// Whether the current process holds administrative privileges.
    fn is_privileged(&self) -> bool;

    /// Names of required tools that could not be located.
    fn missing_tools(&self) -> Vec<String>;
}

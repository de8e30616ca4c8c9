//! Fail-fast environment checks run before anything is modified.

use crate::config::StorechainConfig;
use crate::error::{StorechainError, StorechainResult};
use crate::provider::HostTools;

/// Account ids resolved from the configured names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accounts {
    pub image_uid: u32,
    pub image_gid: u32,
    pub owner_uid: u32,
    pub owner_gid: u32,
}

/// Verify privileges, tools and accounts. Each failure is reported as a
/// distinct error; nothing is created on the host's behalf.
pub fn check_preconditions<H>(host: &H, config: &StorechainConfig) -> StorechainResult<Accounts>
where
    H: HostTools<Error = StorechainError>,
{
    if !host.is_privileged() {
        return Err(StorechainError::Privilege(
            "storechain must run as root to manage block devices, units and /etc/fstab".into(),
        ));
    }

    let missing = host.missing_tools();
    if !missing.is_empty() {
        return Err(StorechainError::Precondition(format!(
            "required tools not found: {} (install them or set [tools.paths] overrides)",
            missing.join(", ")
        )));
    }

    let owner_uid = require_user(host, &config.mount.owner, "mount.owner")?;
    let owner_gid = require_group(host, &config.mount.group, "mount.group")?;
    let image_uid = require_user(host, &config.image.owner, "image.owner")?;
    let image_gid = require_group(host, &config.image.group, "image.group")?;

    Ok(Accounts {
        image_uid,
        image_gid,
        owner_uid,
        owner_gid,
    })
}

fn require_user<H>(host: &H, name: &str, field: &str) -> StorechainResult<u32>
where
    H: HostTools<Error = StorechainError>,
{
    host.lookup_user(name)?.ok_or_else(|| {
        StorechainError::Precondition(format!(
            "user `{name}` ({field}) does not exist; create it before provisioning"
        ))
    })
}

fn require_group<H>(host: &H, name: &str, field: &str) -> StorechainResult<u32>
where
    H: HostTools<Error = StorechainError>,
{
    host.lookup_group(name)?.ok_or_else(|| {
        StorechainError::Precondition(format!(
            "group `{name}` ({field}) does not exist; create it before provisioning"
        ))
    })
}

//! Mode and ownership enforcement that only touches what differs.

use crate::error::StorechainResult;
use log::warn;
use std::fmt;
use std::fs;
use std::os::unix::fs::{chown, MetadataExt, PermissionsExt};
use std::path::Path;

/// Target mode and ownership. `None` fields are left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessPolicy {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// A single adjustment applied by [`enforce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChange {
    Mode { from: u32, to: u32 },
    Owner { from: u32, to: u32 },
    Group { from: u32, to: u32 },
}

impl fmt::Display for PermissionChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionChange::Mode { from, to } => write!(f, "mode {from:04o} -> {to:04o}"),
            PermissionChange::Owner { from, to } => write!(f, "owner uid {from} -> {to}"),
            PermissionChange::Group { from, to } => write!(f, "group gid {from} -> {to}"),
        }
    }
}

/// Bring `path` in line with `policy`, returning the changes made.
///
/// An empty result means the path already matched.
pub fn enforce(path: &Path, policy: &AccessPolicy) -> StorechainResult<Vec<PermissionChange>> {
    let meta = fs::metadata(path)?;
    let mut changes = Vec::new();

    if let Some(target) = policy.mode {
        let current = meta.permissions().mode() & 0o7777;
        if current != target {
            warn!(
                "{} has mode {current:04o}, expected {target:04o}",
                path.display()
            );
            fs::set_permissions(path, fs::Permissions::from_mode(target))?;
            changes.push(PermissionChange::Mode {
                from: current,
                to: target,
            });
        }
    }

    let uid_change = policy.uid.filter(|uid| *uid != meta.uid());
    let gid_change = policy.gid.filter(|gid| *gid != meta.gid());
    if let Some(uid) = uid_change {
        warn!(
            "{} is owned by uid {}, expected {uid}",
            path.display(),
            meta.uid()
        );
        changes.push(PermissionChange::Owner {
            from: meta.uid(),
            to: uid,
        });
    }
    if let Some(gid) = gid_change {
        warn!(
            "{} has group gid {}, expected {gid}",
            path.display(),
            meta.gid()
        );
        changes.push(PermissionChange::Group {
            from: meta.gid(),
            to: gid,
        });
    }
    if uid_change.is_some() || gid_change.is_some() {
        chown(path, uid_change, gid_change)?;
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mode_is_corrected_once() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("disk.qcow2");
        fs::write(&image, b"").unwrap();
        fs::set_permissions(&image, fs::Permissions::from_mode(0o644)).unwrap();

        let policy = AccessPolicy {
            mode: Some(0o660),
            ..AccessPolicy::default()
        };
        let changes = enforce(&image, &policy).unwrap();
        assert_eq!(
            changes,
            vec![PermissionChange::Mode {
                from: 0o644,
                to: 0o660
            }]
        );
        assert_eq!(
            fs::metadata(&image).unwrap().permissions().mode() & 0o7777,
            0o660
        );

        assert!(enforce(&image, &policy).unwrap().is_empty());
    }

    #[test]
    fn matching_ownership_is_left_alone() {
        let dir = tempdir().unwrap();
        let meta = fs::metadata(dir.path()).unwrap();
        let policy = AccessPolicy {
            mode: None,
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
        };
        assert!(enforce(dir.path(), &policy).unwrap().is_empty());
    }

    #[test]
    fn changes_render_readably() {
        let change = PermissionChange::Mode {
            from: 0o644,
            to: 0o660,
        };
        assert_eq!(change.to_string(), "mode 0644 -> 0660");
    }
}

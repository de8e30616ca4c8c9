//! Resource state inspection.
//!
//! Every provisioning decision is derived from what these functions observe
//! on the live system; nothing is remembered between runs.

use crate::config::StorechainConfig;
use crate::error::StorechainResult;
use crate::fstab::MountEntry;
use crate::provider::{HostTools, LvLookup, VolumeManager};
use crate::StorechainError;
use log::warn;
use std::fs;
use std::io;
use std::path::Path;

/// Three-way classification shared by every managed resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    Absent,
    PresentCorrect,
    PresentConflicting(String),
}

/// Classify the backing image. Size is never re-validated.
pub fn inspect_image(path: &Path) -> StorechainResult<ResourceState> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(ResourceState::PresentCorrect),
        Ok(_) => Ok(ResourceState::PresentConflicting(format!(
            "{} exists but is not a regular file",
            path.display()
        ))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(ResourceState::Absent),
        Err(err) => Err(err.into()),
    }
}

/// Logical volume classification plus any ambiguity worth surfacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInspection {
    pub state: ResourceState,
    pub ambiguity: Option<String>,
}

/// Classify the logical volume.
///
/// The volume manager is authoritative. Only when its query fails does the
/// device node decide, and then the result is flagged as ambiguous.
pub fn inspect_volume<H>(host: &H, config: &StorechainConfig) -> StorechainResult<VolumeInspection>
where
    H: VolumeManager<Error = StorechainError> + HostTools<Error = StorechainError>,
{
    let expected = config.lv_device_path();
    match host.lookup_lv(&config.volume.vg_name, &config.volume.lv_name)? {
        LvLookup::Found(path) if path == expected => Ok(VolumeInspection {
            state: ResourceState::PresentCorrect,
            ambiguity: None,
        }),
        LvLookup::Found(path) => Ok(VolumeInspection {
            state: ResourceState::PresentConflicting(format!(
                "volume manager reports {}/{} at {} instead of {}",
                config.volume.vg_name,
                config.volume.lv_name,
                path.display(),
                expected.display()
            )),
            ambiguity: None,
        }),
        LvLookup::Missing => Ok(VolumeInspection {
            state: ResourceState::Absent,
            ambiguity: None,
        }),
        LvLookup::QueryFailed(reason) => {
            if host.is_block_device(&expected) {
                let note = format!(
                    "volume manager query failed ({reason}); {} exists as a block device, assuming the volume is present",
                    expected.display()
                );
                warn!("{note}");
                Ok(VolumeInspection {
                    state: ResourceState::PresentCorrect,
                    ambiguity: Some(note),
                })
            } else {
                let note = format!(
                    "volume manager query failed ({reason}) and {} does not exist; treating the volume as absent",
                    expected.display()
                );
                warn!("{note}");
                Ok(VolumeInspection {
                    state: ResourceState::Absent,
                    ambiguity: Some(note),
                })
            }
        }
    }
}

/// How the mount table relates to the desired entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountTableMatch {
    /// A line names both the device and the mountpoint.
    Exact,
    /// Another device is declared for the mountpoint.
    MountpointClaimed { device: String },
    /// The device is declared for another mountpoint.
    DeviceElsewhere { mountpoint: String },
    Absent,
}

impl MountTableMatch {
    pub fn state(&self) -> ResourceState {
        match self {
            MountTableMatch::Exact => ResourceState::PresentCorrect,
            MountTableMatch::Absent => ResourceState::Absent,
            MountTableMatch::MountpointClaimed { device } => ResourceState::PresentConflicting(
                format!("mountpoint is already claimed by {device}"),
            ),
            MountTableMatch::DeviceElsewhere { mountpoint } => ResourceState::PresentConflicting(
                format!("device is already declared for {mountpoint}"),
            ),
        }
    }
}

/// Classify `contents` (fstab syntax) against `entry`.
///
/// Every line is considered; a conflicting line wins over an exact one.
/// A line that does not name our device but repeats the mountpoint in any
/// later field still counts as claiming it.
pub fn classify_mount_table(contents: &str, entry: &MountEntry) -> MountTableMatch {
    let mut exact = false;
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<String> = trimmed.split_whitespace().map(unescape_mount_field).collect();
        let Some(device) = fields.first() else {
            continue;
        };
        let mountpoint = fields.get(1).map(String::as_str).unwrap_or("");

        if device == &entry.device {
            if same_path(mountpoint, &entry.mountpoint) {
                exact = true;
            } else {
                return MountTableMatch::DeviceElsewhere {
                    mountpoint: mountpoint.to_string(),
                };
            }
        } else if fields
            .iter()
            .skip(1)
            .any(|field| same_path(field, &entry.mountpoint))
        {
            return MountTableMatch::MountpointClaimed {
                device: device.clone(),
            };
        }
    }

    if exact {
        MountTableMatch::Exact
    } else {
        MountTableMatch::Absent
    }
}

/// Path equality by components, so `/mnt/data/` and `/mnt//data` match `/mnt/data`.
fn same_path(left: &str, right: &str) -> bool {
    Path::new(left) == Path::new(right)
}

/// Read and classify the mount table at `path`.
pub fn inspect_mount_table(path: &Path, entry: &MountEntry) -> StorechainResult<MountTableMatch> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(classify_mount_table(&contents, entry)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorechainError::Precondition(
            format!("mount table {} does not exist", path.display()),
        )),
        Err(err) => Err(err.into()),
    }
}

/// Whether the live mount table (`/proc/mounts` format) shows `mountpoint`.
pub fn mounts_contain(contents: &str, mountpoint: &Path) -> bool {
    contents.lines().any(|line| {
        let mut parts = line.split_whitespace();
        let _device = parts.next();
        parts
            .next()
            .map(|field| Path::new(&unescape_mount_field(field)) == mountpoint)
            .unwrap_or(false)
    })
}

/// Decode the octal escapes (`\040` and friends) used in mount tables.
pub fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut oct = String::new();
        while oct.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    oct.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&oct, 8) {
            Ok(value) if oct.len() == 3 => output.push(value as char),
            _ => {
                output.push('\\');
                output.push_str(&oct);
            }
        }
    }

    output
}

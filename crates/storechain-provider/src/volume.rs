//! Provider contract for the volume manager (LVM).
//!
//! Creation calls are one-shot: callers must consult `lookup_lv` and
//! `pv_state` first and never replay a create against existing metadata.

use crate::ToolStatus;
use std::error::Error;
use std::path::{Path, PathBuf};

/// Answer to "does `<vg>/<lv>` exist?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LvLookup {
    /// The volume manager reported the logical volume at this device path.
    Found(PathBuf),
    Missing,
    /// The query itself could not be answered (tool failure, timeout, ...).
    QueryFailed(String),
}

/// Physical-volume signature state of the backing block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PvState {
    /// No volume-manager label and no other recognised signature.
    Unlabeled,
    /// Labelled as a physical volume, optionally already in a volume group.
    PhysicalVolume { vg: Option<String> },
    /// Something else is on the device, or its state could not be determined.
    Unknown(String),
}

/// Abstraction over the volume-manager commands the orchestrator needs.
pub trait VolumeManager {
    type Error: Error + Send + Sync + 'static;

    /// Look up the logical volume `<vg>/<lv>`.
    fn lookup_lv(&self, vg: &str, lv: &str) -> Result<LvLookup, Self::Error>;

    /// Inspect the signature currently on `device`.
    fn pv_state(&self, device: &Path) -> Result<PvState, Self::Error>;

    /// Label `device` as a physical volume.
    fn create_pv(&self, device: &Path) -> Result<ToolStatus, Self::Error>;

    /// Create volume group `vg` on `device`.
    fn create_vg(&self, vg: &str, device: &Path) -> Result<ToolStatus, Self::Error>;

    /// Create logical volume `lv` consuming all free extents of `vg`.
    fn create_lv(&self, vg: &str, lv: &str) -> Result<ToolStatus, Self::Error>;

    fn activate_vg(&self, vg: &str) -> Result<ToolStatus, Self::Error>;

    fn deactivate_vg(&self, vg: &str) -> Result<ToolStatus, Self::Error>;

    /// Human-readable dump of PVs, VGs and LVs, used in failure diagnostics.
    fn describe_layout(&self) -> Result<String, Self::Error>;
}

//! Mount table reconciliation and live mounting.

use crate::config::StorechainConfig;
use crate::error::{StorechainError, StorechainResult};
use crate::inspect::{classify_mount_table, MountTableMatch};
use crate::provider::{HostTools, VolumeManager};
use chrono::Local;
use log::{info, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: String,
    pub fs_type: String,
    pub options: String,
    pub dump: u32,
    pub pass: u32,
}

impl MountEntry {
    pub fn from_config(config: &StorechainConfig) -> Self {
        Self {
            device: config.lv_device_path().to_string_lossy().into_owned(),
            mountpoint: config.mount.mountpoint.clone(),
            fs_type: config.mount.fs_type.clone(),
            options: config.mount.options.clone(),
            dump: config.mount.dump,
            pass: config.mount.pass,
        }
    }

    /// Render as a whitespace-separated fstab line (without newline).
    pub fn render(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            escape_mount_field(&self.device),
            escape_mount_field(&self.mountpoint),
            self.fs_type,
            self.options,
            self.dump,
            self.pass
        )
    }
}

/// Comment written above the managed entry.
pub fn entry_comment(config: &StorechainConfig) -> String {
    format!(
        "Entry added by storechain for LVM data volume ({}/{})",
        config.volume.vg_name, config.volume.lv_name
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged,
    Appended { backup: PathBuf },
    /// The table contradicts the entry; nothing was written.
    Conflict(String),
}

/// Make sure `entry` is declared in the mount table at `path`.
///
/// Appends only when neither the device nor the mountpoint is declared,
/// after copying the original file to a timestamped backup.
pub fn reconcile(
    path: &Path,
    entry: &MountEntry,
    comment: &str,
) -> StorechainResult<ReconcileOutcome> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(StorechainError::Precondition(format!(
                "mount table {} does not exist",
                path.display()
            )))
        }
        Err(err) => return Err(err.into()),
    };

    let found = classify_mount_table(&contents, entry);
    match found {
        MountTableMatch::Exact => Ok(ReconcileOutcome::Unchanged),
        MountTableMatch::MountpointClaimed { device } => Ok(ReconcileOutcome::Conflict(format!(
            "{} already declares {device} for {}; remove or correct that line before retrying",
            path.display(),
            entry.mountpoint
        ))),
        MountTableMatch::DeviceElsewhere { mountpoint } => Ok(ReconcileOutcome::Conflict(format!(
            "{} already declares {} for {mountpoint}; remove or correct that line before retrying",
            path.display(),
            entry.device
        ))),
        MountTableMatch::Absent => {
            let backup = backup_path(path, &Local::now().format("%Y%m%d_%H%M%S").to_string());
            fs::copy(path, &backup)?;
            info!("backed up {} to {}", path.display(), backup.display());

            let mut payload = String::new();
            if !contents.is_empty() && !contents.ends_with('\n') {
                payload.push('\n');
            }
            payload.push_str(&format!("\n# {comment}\n{}\n", entry.render()));

            let mut file = OpenOptions::new().append(true).open(path)?;
            file.write_all(payload.as_bytes())?;
            file.flush()?;
            Ok(ReconcileOutcome::Appended { backup })
        }
    }
}

/// `<path>.bak-<stamp>`, suffixed with `-N` when that name is taken.
pub fn backup_path(path: &Path, stamp: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fstab".to_string());
    let base = path.with_file_name(format!("{file_name}.bak-{stamp}"));
    if !base.exists() {
        return base;
    }
    let mut counter = 1u32;
    loop {
        let candidate = path.with_file_name(format!("{file_name}.bak-{stamp}-{counter}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Result of the best-effort live mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountAttempt {
    Mounted,
    AlreadyMounted,
    Skipped(String),
    Failed(String),
}

/// Mount the declared entry now, activating the volume group first when the
/// logical volume node is missing. Never fatal for tool failures.
pub fn live_mount<H>(host: &H, config: &StorechainConfig) -> StorechainResult<MountAttempt>
where
    H: VolumeManager<Error = StorechainError> + HostTools<Error = StorechainError>,
{
    let mountpoint = config.mountpoint();
    match host.is_mounted(&mountpoint) {
        Ok(true) => return Ok(MountAttempt::AlreadyMounted),
        Ok(false) => {}
        Err(err) => {
            return Ok(MountAttempt::Failed(format!(
                "cannot read the mount table to check {}: {err}",
                mountpoint.display()
            )))
        }
    }

    let lv_path = config.lv_device_path();
    if !host.is_block_device(&lv_path) {
        let status = host.activate_vg(&config.volume.vg_name)?;
        if !status.is_ok() {
            warn!(
                "vgchange -ay {} before mounting failed: {status}",
                config.volume.vg_name
            );
        }
        let ready = config
            .lv_node_policy()
            .await_ready(|| host.is_block_device(&lv_path));
        if !ready.is_ready() {
            return Ok(MountAttempt::Skipped(format!(
                "{} is not available; mount it manually once the volume group is active",
                lv_path.display()
            )));
        }
    }

    let status = host.mount(&mountpoint)?;
    if status.is_ok() || matches!(host.is_mounted(&mountpoint), Ok(true)) {
        return Ok(MountAttempt::Mounted);
    }
    Ok(MountAttempt::Failed(format!(
        "mount {} failed: {status}",
        mountpoint.display()
    )))
}

fn escape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            ' ' => out.push_str("\\040"),
            '\t' => out.push_str("\\011"),
            '\n' => out.push_str("\\012"),
            '\\' => out.push_str("\\134"),
            _ => out.push(ch),
        }
    }
    out
}

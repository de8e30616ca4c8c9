//! Volume group, logical volume and filesystem provisioning.
//!
//! Creation is one-shot. The device's signature is classified before any
//! destructive command runs, and nothing is ever re-created on top of
//! existing metadata.

use super::{event, StepOutcome, WorkflowEvent, WorkflowLevel};
use crate::activation::with_activated;
use crate::config::StorechainConfig;
use crate::error::{require_ok, StorechainError, StorechainResult};
use crate::inspect::{inspect_volume, ResourceState};
use crate::provider::{Host, PvState};
use log::{info, warn};

const CLEANUP_ADVICE: &str =
    "inspect with `pvs`, `vgs` and `lvs`, clean up manually (e.g. `vgremove`, `pvremove`, `wipefs`) and re-run";

/// Ensure the logical volume exists and carries the configured filesystem.
///
/// The connect unit is started transiently unless it is already active.
pub(super) fn ensure_volume<H: Host>(
    host: &H,
    config: &StorechainConfig,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<StepOutcome> {
    let connect = &config.units.connect_unit;
    if host.unit_state(connect)?.active {
        info!("{connect} already active; inspecting volumes in place");
        return provision_volume(host, config, events);
    }

    events.push(event(
        WorkflowLevel::Info,
        format!("Starting {connect} transiently to inspect {}", config.device.path),
    ));
    with_activated(host, connect, config.tools.journal_lines, || {
        let result = provision_volume(host, config, events);
        release_volume_group(host, config);
        result
    })
}

fn provision_volume<H: Host>(
    host: &H,
    config: &StorechainConfig,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<StepOutcome> {
    let device = config.device_path();
    config
        .device_verify_policy()
        .require(&format!("nbd device {}", device.display()), || {
            host.device_ready(&device)
        })?;

    let inspection = inspect_volume(host, config)?;
    let mut outcome = StepOutcome::AlreadySatisfied;
    if let Some(note) = inspection.ambiguity {
        events.push(event(WorkflowLevel::Warn, note));
        outcome = StepOutcome::Warned;
    }

    let volume = format!("{}/{}", config.volume.vg_name, config.volume.lv_name);
    match inspection.state {
        ResourceState::Absent => {
            create_volume(host, config, events)?;
            Ok(outcome.merge(StepOutcome::Applied))
        }
        ResourceState::PresentCorrect => {
            events.push(event(
                WorkflowLevel::Info,
                format!("Logical volume {volume} already exists; not recreating"),
            ));
            Ok(outcome.merge(ensure_filesystem(host, config, events)?))
        }
        ResourceState::PresentConflicting(reason) => Err(StorechainError::Conflict(format!(
            "{reason}; {CLEANUP_ADVICE}"
        ))),
    }
}

fn create_volume<H: Host>(
    host: &H,
    config: &StorechainConfig,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<()> {
    let result = create_volume_inner(host, config, events);
    if result.is_err() {
        log_layout(host);
    }
    result
}

fn create_volume_inner<H: Host>(
    host: &H,
    config: &StorechainConfig,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<()> {
    let device = config.device_path();
    let vg = &config.volume.vg_name;
    let lv = &config.volume.lv_name;

    match host.pv_state(&device)? {
        PvState::Unlabeled => {
            require_ok("lvm pvcreate", host.create_pv(&device)?)?;
            events.push(event(
                WorkflowLevel::Success,
                format!("Created physical volume on {}", device.display()),
            ));
            create_vg(host, config, events)?;
        }
        PvState::PhysicalVolume { vg: None } => {
            events.push(event(
                WorkflowLevel::Warn,
                format!(
                    "{} is already a physical volume without a volume group; resuming at vgcreate",
                    device.display()
                ),
            ));
            create_vg(host, config, events)?;
        }
        PvState::PhysicalVolume { vg: Some(existing) } if &existing == vg => {
            events.push(event(
                WorkflowLevel::Warn,
                format!("Volume group {vg} already exists without {lv}; resuming at lvcreate"),
            ));
        }
        PvState::PhysicalVolume { vg: Some(other) } => {
            return Err(StorechainError::Conflict(format!(
                "{} already belongs to volume group {other}, not {vg}; {CLEANUP_ADVICE}",
                device.display()
            )));
        }
        PvState::Unknown(reason) => {
            return Err(StorechainError::Conflict(format!(
                "refusing to label {}: {reason}; {CLEANUP_ADVICE}",
                device.display()
            )));
        }
    }

    require_ok("lvm lvcreate", host.create_lv(vg, lv)?)?;
    events.push(event(
        WorkflowLevel::Success,
        format!("Created logical volume {vg}/{lv} using 100% of free extents"),
    ));

    wait_for_lv_node(host, config)?;
    format_volume(host, config, events)
}

fn create_vg<H: Host>(
    host: &H,
    config: &StorechainConfig,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<()> {
    let vg = &config.volume.vg_name;
    require_ok("lvm vgcreate", host.create_vg(vg, &config.device_path())?)?;
    events.push(event(
        WorkflowLevel::Success,
        format!("Created volume group {vg}"),
    ));
    Ok(())
}

fn ensure_filesystem<H: Host>(
    host: &H,
    config: &StorechainConfig,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<StepOutcome> {
    let lv_path = config.lv_device_path();
    let mut outcome = StepOutcome::AlreadySatisfied;
    if !host.is_block_device(&lv_path) {
        require_ok("lvm vgchange -ay", host.activate_vg(&config.volume.vg_name)?)?;
        wait_for_lv_node(host, config)?;
        outcome = StepOutcome::Applied;
    }

    match host.filesystem_type(&lv_path)? {
        Some(found) if found == config.mount.fs_type => {
            events.push(event(
                WorkflowLevel::Info,
                format!("{} already carries {found}", lv_path.display()),
            ));
            Ok(outcome)
        }
        Some(found) => Err(StorechainError::Conflict(format!(
            "{} carries a {found} filesystem, expected {}; refusing to reformat",
            lv_path.display(),
            config.mount.fs_type
        ))),
        None => {
            events.push(event(
                WorkflowLevel::Warn,
                format!(
                    "{} has no filesystem signature; formatting",
                    lv_path.display()
                ),
            ));
            format_volume(host, config, events)?;
            Ok(StepOutcome::Applied)
        }
    }
}

fn wait_for_lv_node<H: Host>(host: &H, config: &StorechainConfig) -> StorechainResult<()> {
    let lv_path = config.lv_device_path();
    config
        .lv_node_policy()
        .require(&format!("logical volume node {}", lv_path.display()), || {
            host.is_block_device(&lv_path)
        })?;
    Ok(())
}

fn format_volume<H: Host>(
    host: &H,
    config: &StorechainConfig,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<()> {
    let lv_path = config.lv_device_path();
    match host.settle() {
        Ok(status) if !status.is_ok() => warn!("udevadm settle reported {status}"),
        Err(err) => warn!("udevadm settle failed: {err}"),
        Ok(_) => {}
    }
    require_ok(
        config.mkfs_tool(),
        host.make_filesystem(&config.mount.fs_type, &lv_path)?,
    )?;
    events.push(event(
        WorkflowLevel::Success,
        format!(
            "Formatted {} as {}",
            lv_path.display(),
            config.mount.fs_type
        ),
    ));
    Ok(())
}

/// Deactivate the volume group before the device goes away.
fn release_volume_group<H: Host>(host: &H, config: &StorechainConfig) {
    match host.deactivate_vg(&config.volume.vg_name) {
        Ok(status) if status.is_ok() => {}
        Ok(status) => warn!(
            "vgchange -an {} reported {status}",
            config.volume.vg_name
        ),
        Err(err) => warn!("vgchange -an {} failed: {err}", config.volume.vg_name),
    }
}

fn log_layout<H: Host>(host: &H) {
    match host.describe_layout() {
        Ok(layout) => {
            warn!("current volume layout:");
            for line in layout.lines() {
                warn!("  {line}");
            }
        }
        Err(err) => warn!("unable to describe volume layout: {err}"),
    }
}

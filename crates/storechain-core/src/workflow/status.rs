//! Read-only inspection of the provisioned chain.
//!
//! Never starts units, creates anything or writes files; query failures are
//! reported as events instead of aborting the report.

use super::{event, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::config::StorechainConfig;
use crate::error::StorechainResult;
use crate::fstab::MountEntry;
use crate::inspect::{inspect_image, inspect_mount_table, inspect_volume, ResourceState};
use crate::provider::Host;
use crate::units::units_up_to_date;
use std::fs;
use std::os::unix::fs::PermissionsExt;

/// Describe the state of every managed resource.
pub fn status<H: Host>(config: &StorechainConfig, host: &H) -> StorechainResult<WorkflowReport> {
    let mut events = Vec::new();

    for issue in config.validate() {
        events.push(event(WorkflowLevel::Error, format!("config: {issue}")));
    }
    if !host.is_privileged() {
        events.push(event(
            WorkflowLevel::Warn,
            "Not running as root; volume queries may be incomplete.",
        ));
    }
    let missing = host.missing_tools();
    if !missing.is_empty() {
        events.push(event(
            WorkflowLevel::Warn,
            format!("Missing tools: {}", missing.join(", ")),
        ));
    }

    report_image(config, &mut events);
    report_units(config, host, &mut events);
    report_volume(config, host, &mut events);
    report_fstab(config, &mut events);

    match host.is_mounted(&config.mountpoint()) {
        Ok(true) => events.push(event(
            WorkflowLevel::Success,
            format!("{} is mounted", config.mount.mountpoint),
        )),
        Ok(false) => events.push(event(
            WorkflowLevel::Warn,
            format!("{} is not mounted", config.mount.mountpoint),
        )),
        Err(err) => events.push(event(
            WorkflowLevel::Warn,
            format!("Unable to read the live mount table: {err}"),
        )),
    }

    Ok(WorkflowReport {
        title: format!("Storage status for {}", config.mount.mountpoint),
        events,
        steps: Vec::new(),
    })
}

fn report_image(config: &StorechainConfig, events: &mut Vec<WorkflowEvent>) {
    let path = config.image_path();
    match inspect_image(&path) {
        Ok(ResourceState::PresentCorrect) => {
            let mode = fs::metadata(&path)
                .map(|meta| meta.permissions().mode() & 0o7777)
                .ok();
            match (mode, config.image_mode().ok()) {
                (Some(current), Some(expected)) if current != expected => events.push(event(
                    WorkflowLevel::Warn,
                    format!(
                        "Backing image {} has mode {current:04o}, expected {expected:04o}",
                        path.display()
                    ),
                )),
                _ => events.push(event(
                    WorkflowLevel::Success,
                    format!("Backing image {} present", path.display()),
                )),
            }
        }
        Ok(ResourceState::Absent) => events.push(event(
            WorkflowLevel::Warn,
            format!("Backing image {} does not exist", path.display()),
        )),
        Ok(ResourceState::PresentConflicting(reason)) => {
            events.push(event(WorkflowLevel::Error, reason))
        }
        Err(err) => events.push(event(
            WorkflowLevel::Warn,
            format!("Unable to inspect {}: {err}", path.display()),
        )),
    }
}

fn report_units<H: Host>(config: &StorechainConfig, host: &H, events: &mut Vec<WorkflowEvent>) {
    match units_up_to_date(config) {
        Ok(units) => {
            for (name, current) in units {
                if current {
                    events.push(event(
                        WorkflowLevel::Success,
                        format!("Unit {name} matches its rendering"),
                    ));
                } else {
                    events.push(event(
                        WorkflowLevel::Warn,
                        format!("Unit {name} is missing or outdated; run `storechain provision`"),
                    ));
                }
            }
        }
        Err(err) => events.push(event(
            WorkflowLevel::Warn,
            format!("Unable to read unit files: {err}"),
        )),
    }

    for unit in [&config.units.connect_unit, &config.units.activate_unit] {
        match host.unit_state(unit) {
            Ok(state) => {
                let level = if state.active && state.enabled {
                    WorkflowLevel::Success
                } else {
                    WorkflowLevel::Warn
                };
                events.push(event(
                    level,
                    format!(
                        "{unit}: {}, {}",
                        if state.active { "active" } else { "inactive" },
                        if state.enabled { "enabled" } else { "not enabled" }
                    ),
                ));
            }
            Err(err) => events.push(event(
                WorkflowLevel::Warn,
                format!("Unable to query {unit}: {err}"),
            )),
        }
    }
}

fn report_volume<H: Host>(config: &StorechainConfig, host: &H, events: &mut Vec<WorkflowEvent>) {
    let connected = host
        .unit_state(&config.units.connect_unit)
        .map(|state| state.active)
        .unwrap_or(false);
    if !connected {
        events.push(event(
            WorkflowLevel::Info,
            format!(
                "{} is not connected; volume state not inspected",
                config.device.path
            ),
        ));
        return;
    }

    let volume = format!("{}/{}", config.volume.vg_name, config.volume.lv_name);
    match inspect_volume(host, config) {
        Ok(inspection) => {
            if let Some(note) = inspection.ambiguity {
                events.push(event(WorkflowLevel::Warn, note));
            }
            match inspection.state {
                ResourceState::PresentCorrect => {
                    let lv_path = config.lv_device_path();
                    let fs = host.filesystem_type(&lv_path).ok().flatten();
                    events.push(event(
                        WorkflowLevel::Success,
                        format!(
                            "Logical volume {volume} present ({})",
                            fs.as_deref().unwrap_or("no filesystem signature")
                        ),
                    ));
                }
                ResourceState::Absent => events.push(event(
                    WorkflowLevel::Warn,
                    format!("Logical volume {volume} does not exist"),
                )),
                ResourceState::PresentConflicting(reason) => {
                    events.push(event(WorkflowLevel::Error, reason))
                }
            }
        }
        Err(err) => events.push(event(
            WorkflowLevel::Warn,
            format!("Unable to inspect {volume}: {err}"),
        )),
    }
}

fn report_fstab(config: &StorechainConfig, events: &mut Vec<WorkflowEvent>) {
    let entry = MountEntry::from_config(config);
    let path = config.fstab_path();
    match inspect_mount_table(&path, &entry).map(|found| found.state()) {
        Ok(ResourceState::PresentCorrect) => events.push(event(
            WorkflowLevel::Success,
            format!("{} declares {}", path.display(), entry.mountpoint),
        )),
        Ok(ResourceState::Absent) => events.push(event(
            WorkflowLevel::Warn,
            format!("{} has no entry for {}", path.display(), entry.mountpoint),
        )),
        Ok(ResourceState::PresentConflicting(reason)) => events.push(event(
            WorkflowLevel::Error,
            format!("{}: {reason}", path.display()),
        )),
        Err(err) => events.push(event(WorkflowLevel::Error, err.to_string())),
    }
}

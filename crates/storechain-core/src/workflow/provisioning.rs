//! End-to-end provisioning: image, boot units, volumes, mountpoint, fstab,
//! persistence and the live mount, in that order.
//!
//! Every step inspects live state first and only acts on what is missing,
//! so re-running against a provisioned host changes nothing.

use super::preconditions::{check_preconditions, Accounts};
use super::volumes::ensure_volume;
use super::{event, StepOutcome, StepSummary, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::config::StorechainConfig;
use crate::error::{require_ok, StorechainError, StorechainResult};
use crate::fstab::{
    entry_comment, live_mount, reconcile, MountAttempt, MountEntry, ReconcileOutcome,
};
use crate::inspect::{inspect_image, ResourceState};
use crate::perms::{enforce, AccessPolicy};
use crate::provider::Host;
use crate::units::{install_units, UnitWrite};
use log::{info, warn};
use std::fs;

pub const STEP_IMAGE: &str = "backing image";
pub const STEP_UNITS: &str = "boot units";
pub const STEP_VOLUMES: &str = "volumes";
pub const STEP_MOUNTPOINT: &str = "mountpoint";
pub const STEP_FSTAB: &str = "fstab";
pub const STEP_PERSISTENCE: &str = "persistence";
pub const STEP_LIVE_MOUNT: &str = "live mount";

/// Provision the full image -> device -> volume -> filesystem -> mountpoint
/// chain and make it boot-persistent.
///
/// Fatal conditions abort the remaining steps; steps that already completed
/// are left in place and will be recognised on the next run.
pub fn provision<H: Host>(config: &StorechainConfig, host: &H) -> StorechainResult<WorkflowReport> {
    config.ensure_valid()?;
    let accounts = check_preconditions(host, config)?;

    let mut events = Vec::new();
    let mut steps = Vec::new();
    let mut record = |name: &'static str, outcome: StepOutcome| {
        info!("step {name}: {outcome}");
        steps.push(StepSummary { name, outcome });
    };

    record(STEP_IMAGE, ensure_image(host, config, &accounts, &mut events)?);
    let (units_outcome, units_changed) = ensure_units(host, config, &mut events)?;
    record(STEP_UNITS, units_outcome);
    record(STEP_VOLUMES, ensure_volume(host, config, &mut events)?);
    record(STEP_MOUNTPOINT, ensure_mountpoint(config, &accounts, &mut events)?);
    record(STEP_FSTAB, ensure_fstab_entry(config, &mut events)?);
    record(
        STEP_PERSISTENCE,
        enable_persistence(host, config, units_changed, &mut events)?,
    );
    record(STEP_LIVE_MOUNT, mount_now(host, config, &accounts, &mut events)?);

    Ok(WorkflowReport {
        title: format!(
            "Provisioned {} on {}",
            config.mount.mountpoint,
            config.lv_device_path().display()
        ),
        events,
        steps,
    })
}

fn ensure_image<H: Host>(
    host: &H,
    config: &StorechainConfig,
    accounts: &Accounts,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<StepOutcome> {
    let path = config.image_path();
    let mut outcome = StepOutcome::AlreadySatisfied;

    match inspect_image(&path)? {
        ResourceState::Absent => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            require_ok(
                "qemu-img create",
                host.create_image(&path, &config.image.format, &config.image.size)?,
            )?;
            events.push(event(
                WorkflowLevel::Success,
                format!(
                    "Created {} image {} ({})",
                    config.image.format,
                    path.display(),
                    config.image.size
                ),
            ));
            outcome = StepOutcome::Applied;
        }
        ResourceState::PresentCorrect => events.push(event(
            WorkflowLevel::Info,
            format!("Backing image {} already exists; size not re-validated", path.display()),
        )),
        ResourceState::PresentConflicting(reason) => {
            return Err(StorechainError::Conflict(reason));
        }
    }

    let policy = AccessPolicy {
        mode: Some(config.image_mode()?),
        uid: Some(accounts.image_uid),
        gid: Some(accounts.image_gid),
    };
    let changes = enforce(&path, &policy)?;
    for change in &changes {
        events.push(event(
            WorkflowLevel::Warn,
            format!("Corrected {} on {}", change, path.display()),
        ));
    }
    if !changes.is_empty() {
        outcome = outcome.merge(StepOutcome::Applied);
    }
    Ok(outcome)
}

fn ensure_units<H: Host>(
    host: &H,
    config: &StorechainConfig,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<(StepOutcome, bool)> {
    let installed = install_units(config)?;
    let mut changed = false;
    for unit in &installed {
        match unit.write {
            UnitWrite::Written => {
                changed = true;
                events.push(event(
                    WorkflowLevel::Success,
                    format!("Installed unit {}", unit.path.display()),
                ));
            }
            UnitWrite::Unchanged => events.push(event(
                WorkflowLevel::Info,
                format!("Unit {} is up to date", unit.name),
            )),
        }
    }

    if !changed {
        return Ok((StepOutcome::AlreadySatisfied, false));
    }
    require_ok("systemctl daemon-reload", host.daemon_reload()?)?;
    events.push(event(WorkflowLevel::Info, "systemd daemon reloaded."));
    Ok((StepOutcome::Applied, true))
}

fn ensure_mountpoint(
    config: &StorechainConfig,
    accounts: &Accounts,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<StepOutcome> {
    let mountpoint = config.mountpoint();
    let mut outcome = StepOutcome::AlreadySatisfied;
    if !mountpoint.is_dir() {
        fs::create_dir_all(&mountpoint)?;
        events.push(event(
            WorkflowLevel::Success,
            format!("Created mountpoint {}", mountpoint.display()),
        ));
        outcome = StepOutcome::Applied;
    }

    let changes = enforce(&mountpoint, &owner_policy(accounts))?;
    for change in &changes {
        events.push(event(
            WorkflowLevel::Warn,
            format!("Corrected {} on {}", change, mountpoint.display()),
        ));
    }
    if !changes.is_empty() {
        outcome = outcome.merge(StepOutcome::Applied);
    }
    Ok(outcome)
}

fn ensure_fstab_entry(
    config: &StorechainConfig,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<StepOutcome> {
    let entry = MountEntry::from_config(config);
    let path = config.fstab_path();
    match reconcile(&path, &entry, &entry_comment(config))? {
        ReconcileOutcome::Unchanged => {
            events.push(event(
                WorkflowLevel::Info,
                format!("{} already declares {}", path.display(), entry.mountpoint),
            ));
            Ok(StepOutcome::AlreadySatisfied)
        }
        ReconcileOutcome::Appended { backup } => {
            events.push(event(
                WorkflowLevel::Success,
                format!(
                    "Appended `{}` to {} (backup at {})",
                    entry.render(),
                    path.display(),
                    backup.display()
                ),
            ));
            Ok(StepOutcome::Applied)
        }
        ReconcileOutcome::Conflict(reason) => Err(StorechainError::Conflict(reason)),
    }
}

fn enable_persistence<H: Host>(
    host: &H,
    config: &StorechainConfig,
    units_changed: bool,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<StepOutcome> {
    let units = [&config.units.connect_unit, &config.units.activate_unit];
    let mut outcome = StepOutcome::AlreadySatisfied;

    let mut states = Vec::with_capacity(units.len());
    for unit in units {
        let state = host.unit_state(unit)?;
        if !state.enabled {
            require_ok(format!("systemctl enable {unit}"), host.enable(unit)?)?;
            events.push(event(WorkflowLevel::Success, format!("Enabled {unit}")));
            outcome = outcome.merge(StepOutcome::Applied);
        }
        states.push((unit, state));
    }

    for (unit, state) in states {
        if state.active && !units_changed {
            continue;
        }
        if state.active {
            events.push(event(
                WorkflowLevel::Info,
                format!("{unit} is active; updated definition applies from the next start"),
            ));
            continue;
        }
        let status = host.start(unit)?;
        if status.is_ok() {
            events.push(event(WorkflowLevel::Success, format!("Started {unit}")));
            outcome = outcome.merge(StepOutcome::Applied);
        } else {
            let journal = host
                .recent_logs(unit, config.tools.journal_lines)
                .unwrap_or_else(|err| format!("journal unavailable: {err}"));
            for line in journal.lines() {
                warn!("{unit}: {line}");
            }
            let tail = journal
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no journal output");
            events.push(event(
                WorkflowLevel::Warn,
                format!(
                    "systemctl start {unit} failed ({status}); it stays enabled for the next boot. Last journal line: {tail}"
                ),
            ));
            outcome = outcome.merge(StepOutcome::Warned);
        }
    }
    Ok(outcome)
}

fn mount_now<H: Host>(
    host: &H,
    config: &StorechainConfig,
    accounts: &Accounts,
    events: &mut Vec<WorkflowEvent>,
) -> StorechainResult<StepOutcome> {
    let mountpoint = config.mountpoint();
    let mut outcome = match live_mount(host, config)? {
        MountAttempt::AlreadyMounted => StepOutcome::AlreadySatisfied,
        MountAttempt::Mounted => {
            events.push(event(
                WorkflowLevel::Success,
                format!("Mounted {}", mountpoint.display()),
            ));
            StepOutcome::Applied
        }
        MountAttempt::Skipped(reason) | MountAttempt::Failed(reason) => {
            events.push(event(
                WorkflowLevel::Warn,
                format!("Live mount not performed: {reason}. The fstab entry applies at next boot."),
            ));
            return Ok(StepOutcome::Warned);
        }
    };

    let changes = enforce(&mountpoint, &owner_policy(accounts))?;
    for change in &changes {
        events.push(event(
            WorkflowLevel::Warn,
            format!("Corrected {} on mounted {}", change, mountpoint.display()),
        ));
    }
    if !changes.is_empty() {
        outcome = outcome.merge(StepOutcome::Applied);
    }
    Ok(outcome)
}

fn owner_policy(accounts: &Accounts) -> AccessPolicy {
    AccessPolicy {
        mode: None,
        uid: Some(accounts.owner_uid),
        gid: Some(accounts.owner_gid),
    }
}

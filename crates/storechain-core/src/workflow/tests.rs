use super::provisioning::{
    STEP_FSTAB, STEP_IMAGE, STEP_LIVE_MOUNT, STEP_MOUNTPOINT, STEP_PERSISTENCE, STEP_UNITS,
    STEP_VOLUMES,
};
use super::*;
use crate::config::StorechainConfig;
use crate::error::{StorechainError, StorechainResult};
use crate::fstab::MountEntry;
use crate::provider::{
    HostTools, LvLookup, PvState, ServiceManager, ToolStatus, UnitState, VolumeManager,
};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

const CONNECT: &str = "qemu-nbd-connect.service";
const ACTIVATE: &str = "lvm-activate-data-vg.service";
const BASE_FSTAB: &str = "proc /proc proc defaults 0 0\n";

struct MockState {
    calls: Vec<String>,
    privileged: bool,
    pv: PvState,
    lv_exists: bool,
    lv_active: bool,
    fs: Option<String>,
    units: BTreeMap<String, UnitState>,
    mounted: bool,
    fail_start: Option<String>,
    fail_pvcreate: bool,
    mounts_unreadable: bool,
    uid: u32,
    gid: u32,
}

#[derive(Clone)]
struct MockHost {
    state: Arc<Mutex<MockState>>,
}

impl MockHost {
    fn new(uid: u32, gid: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                calls: Vec::new(),
                privileged: true,
                pv: PvState::Unlabeled,
                lv_exists: false,
                lv_active: false,
                fs: None,
                units: BTreeMap::new(),
                mounted: false,
                fail_start: None,
                fail_pvcreate: false,
                mounts_unreadable: false,
                uid,
                gid,
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    fn record(&self, call: impl Into<String>) {
        self.with(|state| state.calls.push(call.into()));
    }

    fn calls(&self) -> Vec<String> {
        self.with(|state| state.calls.clone())
    }

    fn clear_calls(&self) {
        self.with(|state| state.calls.clear());
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    fn unit(&self, name: &str) -> UnitState {
        self.with(|state| state.units.get(name).copied().unwrap_or_default())
    }
}

impl VolumeManager for MockHost {
    type Error = StorechainError;

    fn lookup_lv(&self, vg: &str, lv: &str) -> StorechainResult<LvLookup> {
        self.record("lvs");
        Ok(if self.with(|state| state.lv_exists) {
            LvLookup::Found(PathBuf::from(format!("/dev/{vg}/{lv}")))
        } else {
            LvLookup::Missing
        })
    }

    fn pv_state(&self, _device: &Path) -> StorechainResult<PvState> {
        self.record("pvs");
        Ok(self.with(|state| state.pv.clone()))
    }

    fn create_pv(&self, _device: &Path) -> StorechainResult<ToolStatus> {
        self.record("pvcreate");
        Ok(self.with(|state| {
            if state.fail_pvcreate {
                ToolStatus::ToolError {
                    exit_code: 5,
                    stderr: "Can't open /dev/nbd0 exclusively.".into(),
                }
            } else {
                state.pv = PvState::PhysicalVolume { vg: None };
                ToolStatus::Ok
            }
        }))
    }

    fn create_vg(&self, vg: &str, _device: &Path) -> StorechainResult<ToolStatus> {
        self.record(format!("vgcreate {vg}"));
        self.with(|state| {
            state.pv = PvState::PhysicalVolume {
                vg: Some(vg.to_string()),
            }
        });
        Ok(ToolStatus::Ok)
    }

    fn create_lv(&self, vg: &str, lv: &str) -> StorechainResult<ToolStatus> {
        self.record(format!("lvcreate {vg}/{lv}"));
        self.with(|state| {
            state.lv_exists = true;
            state.lv_active = true;
        });
        Ok(ToolStatus::Ok)
    }

    fn activate_vg(&self, vg: &str) -> StorechainResult<ToolStatus> {
        self.record(format!("vgchange -ay {vg}"));
        self.with(|state| state.lv_active = state.lv_exists);
        Ok(ToolStatus::Ok)
    }

    fn deactivate_vg(&self, vg: &str) -> StorechainResult<ToolStatus> {
        self.record(format!("vgchange -an {vg}"));
        self.with(|state| state.lv_active = false);
        Ok(ToolStatus::Ok)
    }

    fn describe_layout(&self) -> StorechainResult<String> {
        self.record("describe_layout");
        Ok("PV /dev/nbd0  VG -  PSize 126.00g".into())
    }
}

impl ServiceManager for MockHost {
    type Error = StorechainError;

    fn daemon_reload(&self) -> StorechainResult<ToolStatus> {
        self.record("daemon-reload");
        Ok(ToolStatus::Ok)
    }

    fn enable(&self, unit: &str) -> StorechainResult<ToolStatus> {
        self.record(format!("enable {unit}"));
        self.with(|state| state.units.entry(unit.to_string()).or_default().enabled = true);
        Ok(ToolStatus::Ok)
    }

    fn start(&self, unit: &str) -> StorechainResult<ToolStatus> {
        self.record(format!("start {unit}"));
        Ok(self.with(|state| {
            if state.fail_start.as_deref() == Some(unit) {
                return ToolStatus::ToolError {
                    exit_code: 1,
                    stderr: format!("Job for {unit} failed."),
                };
            }
            state.units.entry(unit.to_string()).or_default().active = true;
            if unit == ACTIVATE {
                state.lv_active = state.lv_exists;
            }
            ToolStatus::Ok
        }))
    }

    fn stop(&self, unit: &str) -> StorechainResult<ToolStatus> {
        self.record(format!("stop {unit}"));
        self.with(|state| state.units.entry(unit.to_string()).or_default().active = false);
        Ok(ToolStatus::Ok)
    }

    fn unit_state(&self, unit: &str) -> StorechainResult<UnitState> {
        Ok(self.unit(unit))
    }

    fn recent_logs(&self, unit: &str, _lines: usize) -> StorechainResult<String> {
        self.record(format!("journal {unit}"));
        Ok("qemu-nbd: starting\nnbd0: device did not become ready\n".into())
    }
}

impl HostTools for MockHost {
    type Error = StorechainError;

    fn create_image(&self, path: &Path, format: &str, size: &str) -> StorechainResult<ToolStatus> {
        self.record(format!("qemu-img create {format} {size}"));
        fs::write(path, b"QFI\xfb")?;
        Ok(ToolStatus::Ok)
    }

    fn make_filesystem(&self, fs_type: &str, _device: &Path) -> StorechainResult<ToolStatus> {
        self.record(format!("mkfs.{fs_type}"));
        self.with(|state| state.fs = Some(fs_type.to_string()));
        Ok(ToolStatus::Ok)
    }

    fn filesystem_type(&self, _device: &Path) -> StorechainResult<Option<String>> {
        Ok(self.with(|state| state.fs.clone()))
    }

    fn mount(&self, _mountpoint: &Path) -> StorechainResult<ToolStatus> {
        self.record("mount");
        self.with(|state| state.mounted = true);
        Ok(ToolStatus::Ok)
    }

    fn is_mounted(&self, _mountpoint: &Path) -> StorechainResult<bool> {
        if self.with(|state| state.mounts_unreadable) {
            return Err(StorechainError::System("mount table unreadable".into()));
        }
        Ok(self.with(|state| state.mounted))
    }

    fn is_block_device(&self, path: &Path) -> bool {
        path == Path::new("/dev/data_vg/data_lv") && self.with(|state| state.lv_active)
    }

    fn device_ready(&self, _path: &Path) -> bool {
        self.unit(CONNECT).active
    }

    fn settle(&self) -> StorechainResult<ToolStatus> {
        self.record("settle");
        Ok(ToolStatus::Ok)
    }

    fn lookup_user(&self, name: &str) -> StorechainResult<Option<u32>> {
        Ok((name != "ghost").then(|| self.with(|state| state.uid)))
    }

    fn lookup_group(&self, name: &str) -> StorechainResult<Option<u32>> {
        Ok((name != "ghost").then(|| self.with(|state| state.gid)))
    }

    fn is_privileged(&self) -> bool {
        self.with(|state| state.privileged)
    }

    fn missing_tools(&self) -> Vec<String> {
        Vec::new()
    }
}

struct Fixture {
    dir: TempDir,
    config: StorechainConfig,
    host: MockHost,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let meta = fs::metadata(dir.path()).unwrap();
        let host = MockHost::new(meta.uid(), meta.gid());

        let mut config = StorechainConfig::default();
        let root = dir.path();
        config.image.path = root.join("android.qcow2").display().to_string();
        config.units.directory = root.join("units").display().to_string();
        config.mount.mountpoint = root.join("mnt/data").display().to_string();
        config.mount.fstab_path = root.join("fstab").display().to_string();
        config.device.verify_interval_ms = 0;
        config.volume.node_interval_ms = 0;
        config.volume.node_attempts = 3;
        fs::write(config.fstab_path(), BASE_FSTAB).unwrap();

        Self { dir, config, host }
    }

    fn fstab(&self) -> String {
        fs::read_to_string(self.config.fstab_path()).unwrap()
    }

    fn backups(&self) -> usize {
        fs::read_dir(self.dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("fstab.bak-"))
            .count()
    }
}

#[test]
fn fresh_host_is_provisioned_end_to_end() {
    let fx = Fixture::new();
    let report = provision(&fx.config, &fx.host).expect("provision");

    for step in [
        STEP_IMAGE,
        STEP_UNITS,
        STEP_VOLUMES,
        STEP_MOUNTPOINT,
        STEP_FSTAB,
        STEP_PERSISTENCE,
        STEP_LIVE_MOUNT,
    ] {
        assert_eq!(report.step(step), Some(StepOutcome::Applied), "{step}");
    }

    let calls = fx.host.calls();
    let position = |call: &str| calls.iter().position(|c| c == call).unwrap();
    assert!(position("pvcreate") < position("vgcreate data_vg"));
    assert!(position("vgcreate data_vg") < position("lvcreate data_vg/data_lv"));
    assert!(position("lvcreate data_vg/data_lv") < position("mkfs.ext4"));
    assert!(position("mkfs.ext4") < position("vgchange -an data_vg"));
    assert!(position("vgchange -an data_vg") < position(&format!("stop {CONNECT}")));
    assert_eq!(fx.host.count("daemon-reload"), 1);
    assert_eq!(fx.host.count(&format!("stop {CONNECT}")), 1);

    assert_eq!(fx.host.count("qemu-img create qcow2 126G"), 1);
    assert!(fx.config.image_path().is_file());
    let image_mode = fs::metadata(fx.config.image_path())
        .unwrap()
        .permissions()
        .mode()
        & 0o777;
    assert_eq!(image_mode, 0o660);
    assert!(fx.config.mountpoint().is_dir());
    assert!(fx.config.units_dir().join(CONNECT).is_file());
    assert!(fx.config.units_dir().join(ACTIVATE).is_file());

    let fstab = fx.fstab();
    assert!(fstab.starts_with(BASE_FSTAB));
    assert!(fstab.contains(&format!(
        "/dev/data_vg/data_lv {} ext4 defaults,nofail,_netdev 0 2",
        fx.config.mount.mountpoint
    )));
    assert_eq!(fx.backups(), 1);

    let connect = fx.host.unit(CONNECT);
    let activate = fx.host.unit(ACTIVATE);
    assert!(connect.enabled && connect.active);
    assert!(activate.enabled && activate.active);
    assert!(fx.host.with(|state| state.mounted));
}

#[test]
fn second_run_changes_nothing() {
    let fx = Fixture::new();
    provision(&fx.config, &fx.host).expect("first run");
    let fstab = fx.fstab();
    fx.host.clear_calls();

    let report = provision(&fx.config, &fx.host).expect("second run");

    assert!(report
        .steps
        .iter()
        .all(|step| step.outcome == StepOutcome::AlreadySatisfied));
    for destructive in [
        "qemu-img",
        "pvcreate",
        "vgcreate",
        "lvcreate",
        "mkfs",
        "daemon-reload",
        "enable",
        "start",
        "stop",
        "mount",
    ] {
        assert!(!fx.host.called(destructive), "unexpected {destructive}");
    }
    assert_eq!(fx.fstab(), fstab);
    assert_eq!(fx.backups(), 1);
}

#[test]
fn fully_provisioned_host_is_only_inspected() {
    let fx = Fixture::new();
    fs::write(fx.config.image_path(), b"QFI\xfb").unwrap();
    fs::set_permissions(fx.config.image_path(), fs::Permissions::from_mode(0o660)).unwrap();
    crate::units::install_units(&fx.config).unwrap();
    fs::create_dir_all(fx.config.mountpoint()).unwrap();
    let entry = MountEntry::from_config(&fx.config);
    fs::write(
        fx.config.fstab_path(),
        format!("{BASE_FSTAB}{}\n", entry.render()),
    )
    .unwrap();
    fx.host.with(|state| {
        state.pv = PvState::PhysicalVolume {
            vg: Some("data_vg".into()),
        };
        state.lv_exists = true;
        state.lv_active = true;
        state.fs = Some("ext4".into());
        state.mounted = true;
        for unit in [CONNECT, ACTIVATE] {
            state.units.insert(
                unit.to_string(),
                UnitState {
                    active: true,
                    enabled: true,
                },
            );
        }
    });

    let report = provision(&fx.config, &fx.host).expect("provision");

    assert!(report
        .steps
        .iter()
        .all(|step| step.outcome == StepOutcome::AlreadySatisfied));
    assert_eq!(fx.host.calls(), vec!["lvs"]);
    assert_eq!(fx.backups(), 0);
}

#[test]
fn pvcreate_failure_stops_connect_unit_once() {
    let fx = Fixture::new();
    fx.host.with(|state| state.fail_pvcreate = true);

    let err = provision(&fx.config, &fx.host).unwrap_err();

    assert!(matches!(err, StorechainError::Tool { ref tool, .. } if tool == "lvm pvcreate"));
    assert_eq!(fx.host.count(&format!("stop {CONNECT}")), 1);
    assert_eq!(fx.host.count("describe_layout"), 1);
    assert!(!fx.host.called("lvcreate"));
    assert!(!fx.host.unit(CONNECT).active);
    assert_eq!(fx.fstab(), BASE_FSTAB);
    assert_eq!(fx.backups(), 0);
}

#[test]
fn failed_transient_start_stops_and_reads_journal() {
    let fx = Fixture::new();
    fx.host.with(|state| state.fail_start = Some(CONNECT.into()));

    let err = provision(&fx.config, &fx.host).unwrap_err();

    assert!(matches!(err, StorechainError::Tool { .. }));
    assert_eq!(fx.host.count(&format!("stop {CONNECT}")), 1);
    assert_eq!(fx.host.count(&format!("journal {CONNECT}")), 1);
    assert!(!fx.host.called("lvs"));
    assert!(!fx.host.called("pvcreate"));
}

#[test]
fn foreign_volume_group_is_a_conflict() {
    let fx = Fixture::new();
    fx.host.with(|state| {
        state.pv = PvState::PhysicalVolume {
            vg: Some("backup_vg".into()),
        }
    });

    let err = provision(&fx.config, &fx.host).unwrap_err();

    match err {
        StorechainError::Conflict(reason) => {
            assert!(reason.contains("backup_vg"), "{reason}");
            assert!(reason.contains("vgremove"), "{reason}");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(!fx.host.called("pvcreate"));
    assert!(!fx.host.called("vgcreate"));
    assert_eq!(fx.host.count(&format!("stop {CONNECT}")), 1);
}

#[test]
fn orphan_physical_volume_resumes_at_vgcreate() {
    let fx = Fixture::new();
    fx.host
        .with(|state| state.pv = PvState::PhysicalVolume { vg: None });

    let report = provision(&fx.config, &fx.host).expect("provision");

    assert!(!fx.host.called("pvcreate"));
    assert_eq!(fx.host.count("vgcreate data_vg"), 1);
    assert_eq!(fx.host.count("lvcreate data_vg/data_lv"), 1);
    assert_eq!(report.step(STEP_VOLUMES), Some(StepOutcome::Applied));
    assert!(report
        .events
        .iter()
        .any(|e| e.level == WorkflowLevel::Warn && e.message.contains("resuming at vgcreate")));
}

#[test]
fn existing_volume_with_other_filesystem_is_not_reformatted() {
    let fx = Fixture::new();
    fx.host.with(|state| {
        state.pv = PvState::PhysicalVolume {
            vg: Some("data_vg".into()),
        };
        state.lv_exists = true;
        state.fs = Some("xfs".into());
    });

    let err = provision(&fx.config, &fx.host).unwrap_err();

    assert!(matches!(err, StorechainError::Conflict(ref reason) if reason.contains("xfs")));
    assert!(!fx.host.called("mkfs"));
    assert!(!fx.host.called("lvcreate"));
    assert!(fx.host.called("vgchange -ay data_vg"));
}

#[test]
fn existing_volume_without_filesystem_is_formatted() {
    let fx = Fixture::new();
    fx.host.with(|state| {
        state.pv = PvState::PhysicalVolume {
            vg: Some("data_vg".into()),
        };
        state.lv_exists = true;
    });

    provision(&fx.config, &fx.host).expect("provision");

    assert!(!fx.host.called("lvcreate"));
    assert_eq!(fx.host.count("mkfs.ext4"), 1);
}

#[test]
fn conflicting_fstab_line_is_left_untouched() {
    let fx = Fixture::new();
    let original = format!(
        "{BASE_FSTAB}/dev/sdb1 {} ext4 defaults 0 2\n",
        fx.config.mount.mountpoint
    );
    fs::write(fx.config.fstab_path(), &original).unwrap();

    let err = provision(&fx.config, &fx.host).unwrap_err();

    assert!(matches!(err, StorechainError::Conflict(ref reason) if reason.contains("/dev/sdb1")));
    assert_eq!(fx.fstab(), original);
    assert_eq!(fx.backups(), 0);
    assert!(!fx.host.called("enable"));
    assert!(!fx.host.called("mount"));
}

#[test]
fn unprivileged_run_is_rejected_before_any_change() {
    let fx = Fixture::new();
    fx.host.with(|state| state.privileged = false);

    let err = provision(&fx.config, &fx.host).unwrap_err();

    assert!(matches!(err, StorechainError::Privilege(_)));
    assert!(fx.host.calls().is_empty());
    assert!(!fx.config.image_path().exists());
    assert!(!fx.config.units_dir().exists());
}

#[test]
fn missing_owner_account_is_a_precondition_failure() {
    let mut fx = Fixture::new();
    fx.config.mount.owner = "ghost".into();

    let err = provision(&fx.config, &fx.host).unwrap_err();

    assert!(
        matches!(err, StorechainError::Precondition(ref reason) if reason.contains("mount.owner"))
    );
    assert!(!fx.config.image_path().exists());
}

#[test]
fn failed_boot_start_warns_and_keeps_unit_enabled() {
    let fx = Fixture::new();
    fx.host.with(|state| state.fail_start = Some(ACTIVATE.into()));

    let report = provision(&fx.config, &fx.host).expect("provision");

    assert_eq!(report.step(STEP_PERSISTENCE), Some(StepOutcome::Warned));
    assert!(fx.host.unit(ACTIVATE).enabled);
    assert_eq!(fx.host.count(&format!("journal {ACTIVATE}")), 1);
    assert!(report.events.iter().any(|e| e.level == WorkflowLevel::Warn
        && e.message.contains("device did not become ready")));
    // The live mount activates the volume group itself.
    assert!(fx.host.with(|state| state.mounted));
}

#[test]
fn status_reports_without_touching_the_host() {
    let fx = Fixture::new();
    provision(&fx.config, &fx.host).expect("provision");
    fx.host.clear_calls();

    let report = status(&fx.config, &fx.host).expect("status");

    assert!(report.steps.is_empty());
    assert!(
        report
            .events
            .iter()
            .all(|e| e.level != WorkflowLevel::Error && e.level != WorkflowLevel::Warn),
        "{:?}",
        report.events
    );
    assert!(fx.host.calls().iter().all(|c| c == "lvs"), "{:?}", fx.host.calls());
}

#[test]
fn status_on_fresh_host_creates_nothing() {
    let fx = Fixture::new();

    let report = status(&fx.config, &fx.host).expect("status");

    assert!(fx.host.calls().is_empty());
    assert!(!fx.config.image_path().exists());
    assert!(!fx.config.units_dir().exists());
    assert_eq!(fx.fstab(), BASE_FSTAB);
    assert!(report
        .events
        .iter()
        .any(|e| e.message.contains("volume state not inspected")));
}

#[test]
fn unreadable_mount_table_only_warns_at_live_mount() {
    let fx = Fixture::new();
    fx.host.with(|state| state.mounts_unreadable = true);

    let report = provision(&fx.config, &fx.host).expect("provision");

    assert_eq!(report.step(STEP_FSTAB), Some(StepOutcome::Applied));
    assert_eq!(report.step(STEP_PERSISTENCE), Some(StepOutcome::Applied));
    assert_ne!(report.step(STEP_LIVE_MOUNT), Some(StepOutcome::Applied));
    assert!(report
        .events
        .iter()
        .any(|event| event.level == WorkflowLevel::Warn && event.message.contains("mount table")));
    assert_eq!(fx.host.count("mount"), 0);
}

//! Configuration model and helpers used by storechain workflows.

use crate::error::{StorechainError, StorechainResult};
use crate::poll::PollPolicy;
use crate::units::systemd_escape_path;
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/storechain.toml";
pub const CONFIG_PATH_ENV: &str = "STORECHAIN_CONFIG";

/// Well-known install locations, checked in order.
pub(crate) const KNOWN_TOOL_PATHS: &[(&str, &[&str])] = &[
    ("qemu-img", &["/usr/bin/qemu-img", "/usr/local/bin/qemu-img"]),
    ("qemu-nbd", &["/usr/bin/qemu-nbd", "/usr/local/bin/qemu-nbd"]),
    ("lvm", &["/usr/sbin/lvm", "/sbin/lvm"]),
    ("mkfs.ext4", &["/usr/sbin/mkfs.ext4", "/sbin/mkfs.ext4"]),
    ("systemctl", &["/usr/bin/systemctl", "/bin/systemctl"]),
    ("journalctl", &["/usr/bin/journalctl", "/bin/journalctl"]),
    ("udevadm", &["/usr/bin/udevadm", "/sbin/udevadm", "/bin/udevadm"]),
    ("mount", &["/usr/bin/mount", "/bin/mount"]),
    ("blkid", &["/usr/sbin/blkid", "/sbin/blkid"]),
    ("modprobe", &["/usr/sbin/modprobe", "/sbin/modprobe"]),
    ("lsblk", &["/usr/bin/lsblk", "/bin/lsblk"]),
    ("dd", &["/usr/bin/dd", "/bin/dd"]),
    ("bash", &["/bin/bash", "/usr/bin/bash"]),
];
const TOOL_SEARCH_DIRS: &[&str] = &[
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
    "/usr/local/sbin",
    "/usr/local/bin",
];

pub(crate) fn detect_binary_path(candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(|path| path.to_string_lossy().into_owned())
}

fn known_candidates(tool: &str) -> &'static [&'static str] {
    KNOWN_TOOL_PATHS
        .iter()
        .find(|(name, _)| *name == tool)
        .map(|(_, candidates)| *candidates)
        .unwrap_or(&[])
}

/// Lightweight check for LVM object names (VG and LV).
pub fn looks_like_lvm_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed != name {
        return false;
    }
    if trimmed.starts_with('-') || trimmed == "." || trimmed == ".." {
        return false;
    }
    trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-' | '+'))
}

/// Parse an octal permission string such as `0660` or `0o660`.
pub fn parse_mode(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
}

fn looks_like_image_size(size: &str) -> bool {
    let trimmed = size.trim();
    let digits = trimmed.trim_end_matches(|ch: char| "KMGTPEkmgtpe".contains(ch));
    !digits.is_empty()
        && digits.chars().all(|ch| ch.is_ascii_digit())
        && trimmed.len() - digits.len() <= 1
}

fn render_bootstrap_template() -> String {
    let mut tool_lines = String::new();
    for (tool, candidates) in KNOWN_TOOL_PATHS {
        let detected = detect_binary_path(candidates)
            .unwrap_or_else(|| candidates.first().copied().unwrap_or_default().to_string());
        tool_lines.push_str(&format!("# \"{tool}\" = \"{detected}\"\n"));
    }

    format!(
        "# Auto-generated storechain configuration bootstrap.\n\
# Review every value before running `storechain provision`.\n\
\n\
[image]\n\
# qcow2 backing file bound to the nbd device at boot.\n\
path = \"{image_path}\"\n\
size = \"{image_size}\"\n\
format = \"qcow2\"\n\
mode = \"0660\"\n\
owner = \"root\"\n\
group = \"disk\"\n\
\n\
[device]\n\
path = \"/dev/nbd0\"\n\
nbds_max = 16\n\
ready_attempts = 60\n\
ready_interval_ms = 500\n\
\n\
[volume]\n\
vg_name = \"data_vg\"\n\
lv_name = \"data_lv\"\n\
\n\
[mount]\n\
mountpoint = \"/mnt/data\"\n\
fs_type = \"ext4\"\n\
options = \"defaults,nofail,_netdev\"\n\
dump = 0\n\
pass = 2\n\
# Account that should own the mounted filesystem root.\n\
owner = \"droid\"\n\
group = \"users\"\n\
fstab_path = \"/etc/fstab\"\n\
\n\
[units]\n\
directory = \"/etc/systemd/system\"\n\
connect_unit = \"qemu-nbd-connect.service\"\n\
activate_unit = \"lvm-activate-data-vg.service\"\n\
\n\
[tools]\n\
command_timeout_secs = 30\n\
start_timeout_secs = 90\n\
mkfs_timeout_secs = 300\n\
\n\
[tools.paths]\n\
# Override tool locations when they live outside the usual directories.\n\
{tool_lines}",
        image_path = default_image_path(),
        image_size = default_image_size(),
    )
}

pub fn bootstrap_template() -> String {
    render_bootstrap_template()
}

/// Backing disk image attributes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImageCfg {
    #[serde(default = "default_image_path")]
    pub path: String,

    /// Virtual size passed to `qemu-img create` (e.g. `126G`).
    #[serde(default = "default_image_size")]
    pub size: String,

    #[serde(default = "default_image_format")]
    pub format: String,

    /// Octal mode enforced on the image file.
    #[serde(default = "default_image_mode")]
    pub mode: String,

    #[serde(default = "default_image_owner")]
    pub owner: String,

    #[serde(default = "default_image_group")]
    pub group: String,
}

fn default_image_path() -> String {
    "/android.qcow2".to_string()
}

fn default_image_size() -> String {
    "126G".to_string()
}

fn default_image_format() -> String {
    "qcow2".to_string()
}

fn default_image_mode() -> String {
    "0660".to_string()
}

fn default_image_owner() -> String {
    "root".to_string()
}

fn default_image_group() -> String {
    "disk".to_string()
}

impl Default for ImageCfg {
    fn default() -> Self {
        Self {
            path: default_image_path(),
            size: default_image_size(),
            format: default_image_format(),
            mode: default_image_mode(),
            owner: default_image_owner(),
            group: default_image_group(),
        }
    }
}

/// Network block device binding and readiness polling budgets.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeviceCfg {
    #[serde(default = "default_device_path")]
    pub path: String,

    #[serde(default = "default_nbds_max")]
    pub nbds_max: u32,

    /// Post-start readiness poll inside the connect unit.
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,

    #[serde(default = "default_ready_interval_ms")]
    pub ready_interval_ms: u64,

    /// Pre-start re-check inside the activation unit.
    #[serde(default = "default_recheck_attempts")]
    pub recheck_attempts: u32,

    #[serde(default = "default_recheck_interval_ms")]
    pub recheck_interval_ms: u64,

    /// In-process verification after a transient start.
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,

    #[serde(default = "default_verify_interval_ms")]
    pub verify_interval_ms: u64,
}

fn default_device_path() -> String {
    "/dev/nbd0".to_string()
}

fn default_nbds_max() -> u32 {
    16
}

fn default_ready_attempts() -> u32 {
    60
}

fn default_ready_interval_ms() -> u64 {
    500
}

fn default_recheck_attempts() -> u32 {
    30
}

fn default_recheck_interval_ms() -> u64 {
    1_000
}

fn default_verify_attempts() -> u32 {
    10
}

fn default_verify_interval_ms() -> u64 {
    500
}

impl Default for DeviceCfg {
    fn default() -> Self {
        Self {
            path: default_device_path(),
            nbds_max: default_nbds_max(),
            ready_attempts: default_ready_attempts(),
            ready_interval_ms: default_ready_interval_ms(),
            recheck_attempts: default_recheck_attempts(),
            recheck_interval_ms: default_recheck_interval_ms(),
            verify_attempts: default_verify_attempts(),
            verify_interval_ms: default_verify_interval_ms(),
        }
    }
}

/// Volume group / logical volume names and node polling budgets.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VolumeCfg {
    #[serde(default = "default_vg_name")]
    pub vg_name: String,

    #[serde(default = "default_lv_name")]
    pub lv_name: String,

    /// In-process wait for the LV node after creation or activation.
    #[serde(default = "default_node_attempts")]
    pub node_attempts: u32,

    #[serde(default = "default_node_interval_ms")]
    pub node_interval_ms: u64,

    /// Post-start wait for the LV node inside the activation unit.
    #[serde(default = "default_unit_node_attempts")]
    pub unit_node_attempts: u32,

    #[serde(default = "default_unit_node_interval_ms")]
    pub unit_node_interval_ms: u64,
}

fn default_vg_name() -> String {
    "data_vg".to_string()
}

fn default_lv_name() -> String {
    "data_lv".to_string()
}

fn default_node_attempts() -> u32 {
    15
}

fn default_node_interval_ms() -> u64 {
    1_000
}

fn default_unit_node_attempts() -> u32 {
    30
}

fn default_unit_node_interval_ms() -> u64 {
    1_000
}

impl Default for VolumeCfg {
    fn default() -> Self {
        Self {
            vg_name: default_vg_name(),
            lv_name: default_lv_name(),
            node_attempts: default_node_attempts(),
            node_interval_ms: default_node_interval_ms(),
            unit_node_attempts: default_unit_node_attempts(),
            unit_node_interval_ms: default_unit_node_interval_ms(),
        }
    }
}

/// Mount table entry and mountpoint ownership.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MountCfg {
    #[serde(default = "default_mountpoint")]
    pub mountpoint: String,

    #[serde(default = "default_fs_type")]
    pub fs_type: String,

    #[serde(default = "default_mount_options")]
    pub options: String,

    #[serde(default)]
    pub dump: u32,

    #[serde(default = "default_pass")]
    pub pass: u32,

    #[serde(default = "default_mount_owner")]
    pub owner: String,

    #[serde(default = "default_mount_group")]
    pub group: String,

    #[serde(default = "default_fstab_path")]
    pub fstab_path: String,
}

fn default_mountpoint() -> String {
    "/mnt/data".to_string()
}

fn default_fs_type() -> String {
    "ext4".to_string()
}

fn default_mount_options() -> String {
    "defaults,nofail,_netdev".to_string()
}

fn default_pass() -> u32 {
    2
}

fn default_mount_owner() -> String {
    "droid".to_string()
}

fn default_mount_group() -> String {
    "users".to_string()
}

fn default_fstab_path() -> String {
    "/etc/fstab".to_string()
}

impl Default for MountCfg {
    fn default() -> Self {
        Self {
            mountpoint: default_mountpoint(),
            fs_type: default_fs_type(),
            options: default_mount_options(),
            dump: 0,
            pass: default_pass(),
            owner: default_mount_owner(),
            group: default_mount_group(),
            fstab_path: default_fstab_path(),
        }
    }
}

/// Boot unit names and install location.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UnitsCfg {
    #[serde(default = "default_units_directory")]
    pub directory: String,

    #[serde(default = "default_connect_unit")]
    pub connect_unit: String,

    #[serde(default = "default_activate_unit")]
    pub activate_unit: String,
}

fn default_units_directory() -> String {
    "/etc/systemd/system".to_string()
}

fn default_connect_unit() -> String {
    "qemu-nbd-connect.service".to_string()
}

fn default_activate_unit() -> String {
    "lvm-activate-data-vg.service".to_string()
}

impl Default for UnitsCfg {
    fn default() -> Self {
        Self {
            directory: default_units_directory(),
            connect_unit: default_connect_unit(),
            activate_unit: default_activate_unit(),
        }
    }
}

/// External tool time budgets and path overrides.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolsCfg {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_pvcreate_timeout_secs")]
    pub pvcreate_timeout_secs: u64,

    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    #[serde(default = "default_mkfs_timeout_secs")]
    pub mkfs_timeout_secs: u64,

    /// Journal lines surfaced when a unit fails to start.
    #[serde(default = "default_journal_lines")]
    pub journal_lines: usize,

    /// Explicit tool locations keyed by tool name (e.g. `lvm`).
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_pvcreate_timeout_secs() -> u64 {
    60
}

fn default_start_timeout_secs() -> u64 {
    90
}

fn default_mkfs_timeout_secs() -> u64 {
    300
}

fn default_journal_lines() -> usize {
    50
}

impl Default for ToolsCfg {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            pvcreate_timeout_secs: default_pvcreate_timeout_secs(),
            start_timeout_secs: default_start_timeout_secs(),
            mkfs_timeout_secs: default_mkfs_timeout_secs(),
            journal_lines: default_journal_lines(),
            paths: BTreeMap::new(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StorechainConfig {
    #[serde(default)]
    pub image: ImageCfg,

    #[serde(default)]
    pub device: DeviceCfg,

    #[serde(default)]
    pub volume: VolumeCfg,

    #[serde(default)]
    pub mount: MountCfg,

    #[serde(default)]
    pub units: UnitsCfg,

    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl StorechainConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Pick the configuration path: explicit argument, then
    /// `STORECHAIN_CONFIG`, then the system default.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match env::var(CONFIG_PATH_ENV) {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
            _ => Self::default_path().to_path_buf(),
        }
    }

    /// Load configuration from disk, writing the bootstrap template first
    /// when the file does not exist yet.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> StorechainResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        let created = ensure_bootstrap_file(target).map_err(|err| {
            StorechainError::InvalidConfig(format!(
                "failed to initialise configuration at {}: {err}",
                target.display()
            ))
        })?;
        if created {
            info!("storechain config bootstrap created at {}", target.display());
        }
        Self::load(target)
    }

    /// Load configuration without touching the filesystem: a missing file
    /// yields the built-in defaults instead of a bootstrap template.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> StorechainResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }
        info!(
            "no configuration at {}; using built-in defaults",
            target.display()
        );
        Ok(Self {
            path: target.to_path_buf(),
            ..Self::default()
        })
    }

    /// Read a config file from disk and detect its format by extension.
    pub fn load<P: AsRef<Path>>(path: P) -> StorechainResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if !Path::new(&self.image.path).is_absolute() {
            issues.push(format!(
                "image.path must be absolute (got `{}`)",
                self.image.path
            ));
        }
        if !looks_like_image_size(&self.image.size) {
            issues.push(format!(
                "image.size must be a number with an optional K/M/G/T/P/E suffix (got `{}`)",
                self.image.size
            ));
        }
        if self.image.format.trim().is_empty() {
            issues.push("image.format must not be empty".to_string());
        }
        if parse_mode(&self.image.mode).is_none() {
            issues.push(format!(
                "image.mode must be an octal mode between 0000 and 7777 (got `{}`)",
                self.image.mode
            ));
        }
        if self.image.owner.trim().is_empty() || self.image.group.trim().is_empty() {
            issues.push("image.owner and image.group must not be empty".to_string());
        }

        if !self.device.path.starts_with("/dev/") {
            issues.push(format!(
                "device.path must live under /dev (got `{}`)",
                self.device.path
            ));
        }
        if self.device.nbds_max == 0 {
            issues.push("device.nbds_max must be at least 1".to_string());
        }
        for (name, attempts) in [
            ("device.ready_attempts", self.device.ready_attempts),
            ("device.recheck_attempts", self.device.recheck_attempts),
            ("device.verify_attempts", self.device.verify_attempts),
            ("volume.node_attempts", self.volume.node_attempts),
            ("volume.unit_node_attempts", self.volume.unit_node_attempts),
        ] {
            if attempts == 0 {
                issues.push(format!("{name} must be at least 1"));
            }
        }

        for (name, value) in [
            ("volume.vg_name", &self.volume.vg_name),
            ("volume.lv_name", &self.volume.lv_name),
        ] {
            if !looks_like_lvm_name(value) {
                issues.push(format!("{name} contains an invalid LVM name: `{value}`"));
            }
        }

        let mountpoint = Path::new(&self.mount.mountpoint);
        if !mountpoint.is_absolute() || mountpoint == Path::new("/") {
            issues.push(format!(
                "mount.mountpoint must be an absolute path other than / (got `{}`)",
                self.mount.mountpoint
            ));
        }
        if self.mount.fs_type.is_empty()
            || !self
                .mount
                .fs_type
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric())
        {
            issues.push(format!(
                "mount.fs_type must be a plain filesystem name (got `{}`)",
                self.mount.fs_type
            ));
        }
        if self.mount.options.is_empty() || self.mount.options.chars().any(char::is_whitespace) {
            issues.push("mount.options must be non-empty and contain no whitespace".to_string());
        }
        if self.mount.pass > 2 {
            issues.push("mount.pass must be 0, 1 or 2".to_string());
        }
        if self.mount.owner.trim().is_empty() || self.mount.group.trim().is_empty() {
            issues.push("mount.owner and mount.group must not be empty".to_string());
        }
        if !Path::new(&self.mount.fstab_path).is_absolute() {
            issues.push("mount.fstab_path must be absolute".to_string());
        }

        if !Path::new(&self.units.directory).is_absolute() {
            issues.push("units.directory must be absolute".to_string());
        }
        for (name, unit) in [
            ("units.connect_unit", &self.units.connect_unit),
            ("units.activate_unit", &self.units.activate_unit),
        ] {
            if !unit.ends_with(".service") || unit.contains('/') || unit.len() <= ".service".len()
            {
                issues.push(format!("{name} must be a plain *.service name (got `{unit}`)"));
            }
        }
        if self.units.connect_unit == self.units.activate_unit {
            issues.push("units.connect_unit and units.activate_unit must differ".to_string());
        }

        for (name, secs) in [
            ("tools.command_timeout_secs", self.tools.command_timeout_secs),
            ("tools.pvcreate_timeout_secs", self.tools.pvcreate_timeout_secs),
            ("tools.start_timeout_secs", self.tools.start_timeout_secs),
            ("tools.mkfs_timeout_secs", self.tools.mkfs_timeout_secs),
        ] {
            if secs == 0 {
                issues.push(format!("{name} must be greater than 0"));
            }
        }
        for (tool, path) in &self.tools.paths {
            if !Path::new(path).is_absolute() {
                issues.push(format!("tools.paths.{tool} must be absolute (got `{path}`)"));
            }
        }

        issues
    }

    /// Fail with `InvalidConfig` when `validate` reports anything.
    pub fn ensure_valid(&self) -> StorechainResult<()> {
        let issues = self.validate();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(StorechainError::InvalidConfig(issues.join("; ")))
        }
    }

    pub fn image_path(&self) -> PathBuf {
        PathBuf::from(&self.image.path)
    }

    pub fn image_mode(&self) -> StorechainResult<u32> {
        parse_mode(&self.image.mode).ok_or_else(|| {
            StorechainError::InvalidConfig(format!("invalid image.mode `{}`", self.image.mode))
        })
    }

    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(&self.device.path)
    }

    /// Device node the volume manager exposes for the logical volume.
    pub fn lv_device_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/dev/{}/{}",
            self.volume.vg_name, self.volume.lv_name
        ))
    }

    pub fn mountpoint(&self) -> PathBuf {
        PathBuf::from(&self.mount.mountpoint)
    }

    pub fn fstab_path(&self) -> PathBuf {
        PathBuf::from(&self.mount.fstab_path)
    }

    pub fn units_dir(&self) -> PathBuf {
        PathBuf::from(&self.units.directory)
    }

    /// Mount unit systemd synthesises from the fstab entry.
    pub fn mount_unit_name(&self) -> String {
        format!("{}.mount", systemd_escape_path(&self.mount.mountpoint))
    }

    pub fn mkfs_tool(&self) -> String {
        format!("mkfs.{}", self.mount.fs_type)
    }

    /// Tools the provisioning run cannot proceed without.
    pub fn required_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = [
            "qemu-img", "qemu-nbd", "lvm", "systemctl", "udevadm", "mount", "blkid", "modprobe",
            "lsblk", "dd", "bash",
        ]
        .iter()
        .map(|tool| tool.to_string())
        .collect();
        tools.push(self.mkfs_tool());
        tools
    }

    /// Resolve a tool to an absolute path: configured override, known
    /// locations, the usual system directories, then a best guess.
    pub fn tool_path(&self, tool: &str) -> PathBuf {
        if let Some(explicit) = self.tools.paths.get(tool) {
            return PathBuf::from(explicit);
        }
        let candidates = known_candidates(tool);
        if let Some(found) = detect_binary_path(candidates) {
            return PathBuf::from(found);
        }
        let searched: Vec<String> = TOOL_SEARCH_DIRS
            .iter()
            .map(|dir| format!("{dir}/{tool}"))
            .collect();
        let searched_refs: Vec<&str> = searched.iter().map(String::as_str).collect();
        if let Some(found) = detect_binary_path(&searched_refs) {
            return PathBuf::from(found);
        }
        candidates
            .first()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/usr/bin/{tool}")))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.command_timeout_secs)
    }

    pub fn pvcreate_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.pvcreate_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.start_timeout_secs)
    }

    pub fn mkfs_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.mkfs_timeout_secs)
    }

    /// Device readiness poll rendered into the connect unit.
    pub fn device_ready_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.device.ready_attempts,
            Duration::from_millis(self.device.ready_interval_ms),
        )
    }

    /// Device re-check rendered into the activation unit.
    pub fn device_recheck_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.device.recheck_attempts,
            Duration::from_millis(self.device.recheck_interval_ms),
        )
    }

    /// In-process device verification after a transient start.
    pub fn device_verify_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.device.verify_attempts,
            Duration::from_millis(self.device.verify_interval_ms),
        )
    }

    /// In-process wait for the logical volume node.
    pub fn lv_node_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.volume.node_attempts,
            Duration::from_millis(self.volume.node_interval_ms),
        )
    }

    /// Logical volume node poll rendered into the activation unit.
    pub fn unit_lv_node_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.volume.unit_node_attempts,
            Duration::from_millis(self.volume.unit_node_interval_ms),
        )
    }
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            let template = render_bootstrap_template();
            file.write_all(template.as_bytes())?;
            file.flush()?;
            #[cfg(unix)]
            {
                let mode = if path.starts_with("/etc/") {
                    0o640
                } else {
                    0o600
                };
                fs::set_permissions(path, PermissionsExt::from_mode(mode))?;
            }
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

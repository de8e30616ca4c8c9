//! Boot unit generation and installation.
//!
//! Two oneshot services rebuild the chain on every boot: the connect unit
//! binds the image to the nbd device, the activation unit brings the volume
//! group up once the device serves reads. The mount itself comes from the
//! fstab entry, which systemd turns into a mount unit ordered after both.

use crate::config::StorechainConfig;
use crate::error::StorechainResult;
use crate::poll::{unit_command, ProbeCheck, ShellProbe};
use log::info;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const UNIT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const UNIT_HEADER: &str = "# Managed by storechain. Regenerated on every provisioning run.\n";

/// One `[Section]` of a unit file, directives kept in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSection {
    pub name: &'static str,
    pub directives: Vec<(String, String)>,
}

impl UnitSection {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            directives: Vec::new(),
        }
    }

    fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.directives.push((key.to_string(), value.into()));
        self
    }
}

/// In-memory unit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    pub name: String,
    pub sections: Vec<UnitSection>,
}

impl UnitFile {
    pub fn render(&self) -> String {
        let mut out = String::from(UNIT_HEADER);
        for section in &self.sections {
            out.push('\n');
            out.push_str(&format!("[{}]\n", section.name));
            for (key, value) in &section.directives {
                out.push_str(&format!("{key}={value}\n"));
            }
        }
        out
    }

    /// All values of `key` in `section`, in order.
    pub fn values(&self, section: &str, key: &str) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|s| s.name == section)
            .flat_map(|s| s.directives.iter())
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Whitespace-separated unit names listed under a dependency key.
    pub fn dependencies(&self, key: &str) -> Vec<&str> {
        self.values("Unit", key)
            .into_iter()
            .flat_map(str::split_whitespace)
            .collect()
    }
}

/// Unit that binds the backing image to the nbd device.
pub fn device_connect_unit(config: &StorechainConfig) -> UnitFile {
    let qemu_nbd = tool(config, "qemu-nbd");
    let bash = tool(config, "bash");
    let device = exec_arg(&config.device.path);
    let ready = config.device_ready_policy().render_shell(&ShellProbe::new(
        format!("nbd device {}", config.device.path),
        vec![
            ProbeCheck::BlockDevice(config.device.path.clone()),
            ProbeCheck::NonZeroSize(config.device.path.clone()),
            ProbeCheck::TrialRead(config.device.path.clone()),
        ],
    ));

    UnitFile {
        name: config.units.connect_unit.clone(),
        sections: vec![
            UnitSection::new("Unit")
                .set(
                    "Description",
                    format!(
                        "Connect {} to {} via qemu-nbd",
                        config.image.path, config.device.path
                    ),
                )
                .set("DefaultDependencies", "no")
                .set("RequiresMountsFor", exec_arg(&config.image.path))
                .set("After", "systemd-modules-load.service")
                .set("Wants", "systemd-modules-load.service")
                .set("Conflicts", "shutdown.target")
                .set(
                    "Before",
                    format!(
                        "lvm2-activation-early.service lvm2-activation.service {} shutdown.target",
                        config.units.activate_unit
                    ),
                ),
            UnitSection::new("Service")
                .set("Type", "oneshot")
                .set("RemainAfterExit", "yes")
                .set("Environment", UNIT_PATH_ENV)
                .set(
                    "ExecStartPre",
                    format!(
                        "{} nbd nbds_max={}",
                        tool(config, "modprobe"),
                        config.device.nbds_max
                    ),
                )
                .set("ExecStartPre", format!("-{qemu_nbd} --disconnect {device}"))
                .set(
                    "ExecStart",
                    format!(
                        "{qemu_nbd} --connect={device} {}",
                        exec_arg(&config.image.path)
                    ),
                )
                .set("ExecStartPost", unit_command(&bash, &ready))
                .set("ExecStop", format!("{qemu_nbd} --disconnect {device}")),
            UnitSection::new("Install").set("WantedBy", "multi-user.target"),
        ],
    }
}

/// Unit that activates the volume group once the nbd device is usable.
pub fn volume_activate_unit(config: &StorechainConfig) -> UnitFile {
    let lvm = tool(config, "lvm");
    let bash = tool(config, "bash");
    let vg = exec_arg(&config.volume.vg_name);
    let lv_path = config.lv_device_path().to_string_lossy().into_owned();
    let device_recheck = config.device_recheck_policy().render_shell(&ShellProbe::new(
        format!("nbd device {}", config.device.path),
        vec![
            ProbeCheck::BlockDevice(config.device.path.clone()),
            ProbeCheck::TrialRead(config.device.path.clone()),
        ],
    ));
    let lv_node = config.unit_lv_node_policy().render_shell(&ShellProbe::new(
        format!("logical volume {lv_path}"),
        vec![ProbeCheck::BlockDevice(lv_path.clone())],
    ));

    UnitFile {
        name: config.units.activate_unit.clone(),
        sections: vec![
            UnitSection::new("Unit")
                .set(
                    "Description",
                    format!(
                        "Activate LVM volume group {} on {}",
                        config.volume.vg_name, config.device.path
                    ),
                )
                .set("DefaultDependencies", "no")
                .set("Requires", config.units.connect_unit.clone())
                .set(
                    "After",
                    format!(
                        "{} systemd-udev-settle.service",
                        config.units.connect_unit
                    ),
                )
                .set("Conflicts", "shutdown.target")
                .set(
                    "Before",
                    format!(
                        "local-fs.target remote-fs.target {} shutdown.target",
                        config.mount_unit_name()
                    ),
                ),
            UnitSection::new("Service")
                .set("Type", "oneshot")
                .set("RemainAfterExit", "yes")
                .set("Environment", UNIT_PATH_ENV)
                .set(
                    "ExecStartPre",
                    format!("{} settle --timeout=30", tool(config, "udevadm")),
                )
                .set("ExecStartPre", unit_command(&bash, &device_recheck))
                .set("ExecStart", format!("{lvm} vgchange -ay {vg}"))
                .set("ExecStartPost", unit_command(&bash, &lv_node))
                .set("ExecStop", format!("{lvm} vgchange -an {vg}")),
            UnitSection::new("Install").set("WantedBy", "multi-user.target"),
        ],
    }
}

/// Both managed units, connect first.
pub fn render_units(config: &StorechainConfig) -> Vec<UnitFile> {
    vec![device_connect_unit(config), volume_activate_unit(config)]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitWrite {
    Written,
    Unchanged,
}

/// Result of installing one unit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInstall {
    pub name: String,
    pub path: PathBuf,
    pub write: UnitWrite,
}

/// Write every unit whose on-disk content differs from the rendering.
pub fn install_units(config: &StorechainConfig) -> StorechainResult<Vec<UnitInstall>> {
    let directory = config.units_dir();
    fs::create_dir_all(&directory)?;

    let mut installed = Vec::new();
    for unit in render_units(config) {
        let path = directory.join(&unit.name);
        let write = write_if_changed(&path, &unit.render())?;
        if write == UnitWrite::Written {
            info!("installed unit {}", path.display());
        }
        installed.push(UnitInstall {
            name: unit.name,
            path,
            write,
        });
    }
    Ok(installed)
}

/// Compare installed unit files with their rendering without writing.
pub fn units_up_to_date(config: &StorechainConfig) -> StorechainResult<Vec<(String, bool)>> {
    let directory = config.units_dir();
    render_units(config)
        .into_iter()
        .map(|unit| {
            let current = read_optional(&directory.join(&unit.name))?;
            let matches = current.as_deref() == Some(unit.render().as_str());
            Ok((unit.name, matches))
        })
        .collect()
}

fn write_if_changed(path: &Path, content: &str) -> StorechainResult<UnitWrite> {
    if read_optional(path)?.as_deref() == Some(content) {
        return Ok(UnitWrite::Unchanged);
    }
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    Ok(UnitWrite::Written)
}

fn read_optional(path: &Path) -> StorechainResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Escape an absolute path the way `systemd-escape --path` does.
pub fn systemd_escape_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return "-".to_string();
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut previous_slash = false;
    for (index, byte) in trimmed.bytes().enumerate() {
        if byte == b'/' {
            if !previous_slash {
                out.push('-');
            }
            previous_slash = true;
            continue;
        }
        previous_slash = false;
        match byte {
            b'.' if index == 0 => out.push_str("\\x2e"),
            b if b.is_ascii_alphanumeric() || matches!(b, b':' | b'_' | b'.') => {
                out.push(b as char)
            }
            b => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

fn tool(config: &StorechainConfig, name: &str) -> String {
    exec_arg(&config.tool_path(name).to_string_lossy())
}

/// Quote and escape one argument of an `Exec*=` command line.
fn exec_arg(raw: &str) -> String {
    let escaped = raw.replace('%', "%%").replace('$', "$$");
    if escaped.chars().any(|ch| ch.is_whitespace() || ch == '"' || ch == '\\') {
        format!(
            "\"{}\"",
            escaped.replace('\\', "\\\\").replace('"', "\\\"")
        )
    } else {
        escaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> StorechainConfig {
        let mut config = StorechainConfig::default();
        config.units.directory = dir.join("system").to_string_lossy().into_owned();
        config
    }

    #[test]
    fn activation_unit_orders_between_connect_and_mount() {
        let config = StorechainConfig::default();
        let unit = volume_activate_unit(&config);

        assert_eq!(unit.dependencies("Requires"), vec!["qemu-nbd-connect.service"]);
        assert!(unit.dependencies("After").contains(&"qemu-nbd-connect.service"));
        let before = unit.dependencies("Before");
        assert!(before.contains(&"mnt-data.mount"));
        assert!(before.contains(&"local-fs.target"));
        assert_eq!(unit.values("Service", "ExecStop").len(), 1);
        assert!(unit.values("Service", "ExecStart")[0].ends_with("vgchange -ay data_vg"));
    }

    #[test]
    fn connect_unit_runs_before_activation() {
        let config = StorechainConfig::default();
        let unit = device_connect_unit(&config);

        assert!(unit
            .dependencies("Before")
            .contains(&"lvm-activate-data-vg.service"));
        assert_eq!(unit.values("Service", "Type"), vec!["oneshot"]);
        assert_eq!(unit.values("Service", "RemainAfterExit"), vec!["yes"]);

        let pre = unit.values("Service", "ExecStartPre");
        assert_eq!(pre.len(), 2);
        assert!(pre[0].ends_with("nbd nbds_max=16"));
        assert!(pre[1].starts_with('-'));
        assert!(pre[1].ends_with("--disconnect /dev/nbd0"));
        assert!(unit.values("Service", "ExecStart")[0]
            .ends_with("--connect=/dev/nbd0 /android.qcow2"));
        assert_eq!(unit.values("Install", "WantedBy"), vec!["multi-user.target"]);
    }

    #[test]
    fn boot_units_stay_out_of_the_sysinit_ordering() {
        let config = StorechainConfig::default();
        let connect = device_connect_unit(&config);
        let activate = volume_activate_unit(&config);

        for unit in [&connect, &activate] {
            assert_eq!(unit.values("Unit", "DefaultDependencies"), vec!["no"]);
            assert_eq!(unit.dependencies("Conflicts"), vec!["shutdown.target"]);
            assert!(unit.dependencies("Before").contains(&"shutdown.target"));
            assert!(!unit.dependencies("After").contains(&"local-fs.target"));
            assert!(!unit.dependencies("After").contains(&"sysinit.target"));
            assert!(!unit.dependencies("After").contains(&"network-online.target"));
        }
        assert_eq!(connect.values("Unit", "RequiresMountsFor"), vec!["/android.qcow2"]);
        assert!(activate.dependencies("Before").contains(&"local-fs.target"));
    }

    #[test]
    fn installed_units_pass_systemd_analyze_when_available() {
        let analyzer = Path::new("/usr/bin/systemd-analyze");
        if !analyzer.is_file() {
            return;
        }
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let installed = install_units(&config).unwrap();

        let output = std::process::Command::new(analyzer)
            .arg("verify")
            .args(installed.iter().map(|unit| &unit.path))
            .output()
            .unwrap();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let cycles: Vec<&str> = stderr
            .lines()
            .filter(|line| line.contains("cycl"))
            .filter(|line| installed.iter().any(|unit| line.contains(&unit.name)))
            .collect();
        assert!(cycles.is_empty(), "{stderr}");
    }

    #[test]
    fn readiness_scripts_escape_shell_variables() {
        let config = StorechainConfig::default();
        let rendered = device_connect_unit(&config).render();
        let post = rendered
            .lines()
            .find(|line| line.starts_with("ExecStartPost="))
            .unwrap();
        assert!(post.contains(" -c 'tries=60; delay=0.5;"));
        assert!(post.contains("$$i"));
        assert!(!post.contains(" $i"));
        assert!(post.ends_with("exit 1'"));
    }

    #[test]
    fn rendered_unit_has_sections_in_order() {
        let rendered = volume_activate_unit(&StorechainConfig::default()).render();
        let unit_at = rendered.find("[Unit]").unwrap();
        let service_at = rendered.find("[Service]").unwrap();
        let install_at = rendered.find("[Install]").unwrap();
        assert!(unit_at < service_at && service_at < install_at);
        assert!(rendered.starts_with("# Managed by storechain"));
    }

    #[test]
    fn install_writes_once_then_reports_unchanged() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());

        let first = install_units(&config).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|u| u.write == UnitWrite::Written));
        let mode = fs::metadata(&first[0].path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);

        let second = install_units(&config).unwrap();
        assert!(second.iter().all(|u| u.write == UnitWrite::Unchanged));
        assert!(units_up_to_date(&config).unwrap().iter().all(|(_, ok)| *ok));

        fs::write(&first[1].path, "[Unit]\n").unwrap();
        let third = install_units(&config).unwrap();
        assert_eq!(third[0].write, UnitWrite::Unchanged);
        assert_eq!(third[1].write, UnitWrite::Written);
    }

    #[test]
    fn escape_path_matches_systemd() {
        assert_eq!(systemd_escape_path("/mnt/data"), "mnt-data");
        assert_eq!(systemd_escape_path("/"), "-");
        assert_eq!(systemd_escape_path("/srv//my-data/"), "srv-my\\x2ddata");
        assert_eq!(systemd_escape_path("/mnt/data store"), "mnt-data\\x20store");
        assert_eq!(systemd_escape_path("/.hidden"), "\\x2ehidden");
    }

    #[test]
    fn exec_args_are_quoted_when_needed() {
        assert_eq!(exec_arg("/android.qcow2"), "/android.qcow2");
        assert_eq!(exec_arg("/srv/vm images/a.qcow2"), "\"/srv/vm images/a.qcow2\"");
        assert_eq!(exec_arg("/srv/50%.img"), "/srv/50%%.img");
    }
}

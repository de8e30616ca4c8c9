//! System-backed host implementation.
//!
//! Wraps `lvm`, `systemctl`, `journalctl`, `qemu-img`, `mkfs.*`, `blkid`,
//! `mount` and `udevadm`, resolving every binary through the configured
//! tool paths.

use crate::accounts;
use crate::command::{Execution, ToolCommand};
use log::{debug, warn};
use storechain_core::config::StorechainConfig;
use storechain_core::error::{StorechainError, StorechainResult};
use storechain_core::inspect::mounts_contain;
use storechain_provider::host::HostTools;
use storechain_provider::service::{ServiceManager, UnitState};
use storechain_provider::volume::{LvLookup, PvState, VolumeManager};
use storechain_provider::ToolStatus;
use std::env;
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the live mount table location (defaults to `/proc/mounts`).
pub const MOUNTS_PATH_ENV: &str = "STORECHAIN_MOUNTS_PATH";
const DEFAULT_MOUNTS_PATH: &str = "/proc/mounts";
const SYSFS_BLOCK: &str = "/sys/class/block";
const SETTLE_TIMEOUT_SECS: u64 = 30;

/// Host provider driving the real system tools.
#[derive(Debug, Clone)]
pub struct SystemHost {
    lvm: ToolCommand,
    pvcreate: ToolCommand,
    systemctl: ToolCommand,
    systemctl_start: ToolCommand,
    journalctl: ToolCommand,
    qemu_img: ToolCommand,
    mkfs: ToolCommand,
    blkid: ToolCommand,
    mount: ToolCommand,
    udevadm: ToolCommand,
    required: Vec<(String, PathBuf)>,
    mounts_path: PathBuf,
}

impl SystemHost {
    /// Build a host from configuration, resolving every tool path once.
    pub fn from_config(config: &StorechainConfig) -> Self {
        let timeout = config.command_timeout();
        let tool = |name: &str| ToolCommand::new(config.tool_path(name), timeout);

        let lvm = tool("lvm");
        let systemctl = tool("systemctl");
        let required = config
            .required_tools()
            .into_iter()
            .map(|name| {
                let path = config.tool_path(&name);
                (name, path)
            })
            .collect();
        let mounts_path = env::var_os(MOUNTS_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNTS_PATH));

        Self {
            pvcreate: lvm.with_timeout(config.pvcreate_timeout()),
            systemctl_start: systemctl.with_timeout(config.start_timeout()),
            mkfs: ToolCommand::new(config.tool_path(&config.mkfs_tool()), config.mkfs_timeout()),
            journalctl: tool("journalctl"),
            qemu_img: tool("qemu-img"),
            blkid: tool("blkid"),
            mount: tool("mount"),
            udevadm: tool("udevadm"),
            lvm,
            systemctl,
            required,
            mounts_path,
        }
    }

    /// Run a query and return its stdout, failing with a `Tool` error otherwise.
    fn query(&self, command: &ToolCommand, args: &[&str]) -> StorechainResult<String> {
        match command.run(args)? {
            Execution::Finished(out) if out.status == 0 => Ok(out.stdout),
            other => Err(StorechainError::Tool {
                tool: format!("{} {}", tool_name(command), args.join(" ")),
                status: other.into_status(),
            }),
        }
    }

    /// Probe signatures with low-level blkid when LVM does not claim the device.
    fn probe_foreign_signature(&self, device: &Path) -> StorechainResult<PvState> {
        let device_arg = device.to_string_lossy();
        match self
            .blkid
            .run(&["-p", "-o", "value", "-s", "TYPE", device_arg.as_ref()])?
        {
            // blkid exits 2 when no signature is present.
            Execution::Finished(out) if out.status == 2 => Ok(PvState::Unlabeled),
            Execution::Finished(out) if out.status == 0 => {
                let kind = out.stdout.trim();
                if kind.is_empty() {
                    Ok(PvState::Unlabeled)
                } else {
                    Ok(PvState::Unknown(format!(
                        "{} carries a {kind} signature",
                        device.display()
                    )))
                }
            }
            other => Ok(PvState::Unknown(format!(
                "unable to probe {}: {}",
                device.display(),
                other.into_status()
            ))),
        }
    }
}

fn tool_name(command: &ToolCommand) -> String {
    command
        .binary()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.binary().display().to_string())
}

impl VolumeManager for SystemHost {
    type Error = StorechainError;

    fn lookup_lv(&self, vg: &str, lv: &str) -> StorechainResult<LvLookup> {
        let target = format!("{vg}/{lv}");
        let result = self
            .lvm
            .run(&["lvs", "--noheadings", "-o", "lv_path", &target])?;
        Ok(match result {
            Execution::Finished(out) if out.status == 0 => {
                let path = out.stdout.trim();
                if path.is_empty() {
                    LvLookup::Missing
                } else {
                    LvLookup::Found(PathBuf::from(path))
                }
            }
            other => match other.into_status() {
                ToolStatus::NotFound => LvLookup::Missing,
                status => LvLookup::QueryFailed(format!("lvs {target}: {status}")),
            },
        })
    }

    fn pv_state(&self, device: &Path) -> StorechainResult<PvState> {
        let device_arg = device.to_string_lossy();
        match self
            .lvm
            .run(&["pvs", "--noheadings", "-o", "vg_name", device_arg.as_ref()])?
        {
            Execution::Finished(out) if out.status == 0 => {
                let vg = out.stdout.trim();
                Ok(PvState::PhysicalVolume {
                    vg: (!vg.is_empty()).then(|| vg.to_string()),
                })
            }
            other => match other.into_status() {
                ToolStatus::NotFound => self.probe_foreign_signature(device),
                status => Ok(PvState::Unknown(format!(
                    "pvs {} failed: {status}",
                    device.display()
                ))),
            },
        }
    }

    fn create_pv(&self, device: &Path) -> StorechainResult<ToolStatus> {
        let device_arg = device.to_string_lossy();
        self.pvcreate
            .status(&["pvcreate", "-ff", "-y", device_arg.as_ref()])
    }

    fn create_vg(&self, vg: &str, device: &Path) -> StorechainResult<ToolStatus> {
        let device_arg = device.to_string_lossy();
        self.lvm.status(&["vgcreate", "-y", vg, device_arg.as_ref()])
    }

    fn create_lv(&self, vg: &str, lv: &str) -> StorechainResult<ToolStatus> {
        self.lvm
            .status(&["lvcreate", "-y", "-l", "100%FREE", "-n", lv, vg])
    }

    fn activate_vg(&self, vg: &str) -> StorechainResult<ToolStatus> {
        self.lvm.status(&["vgchange", "-ay", vg])
    }

    fn deactivate_vg(&self, vg: &str) -> StorechainResult<ToolStatus> {
        self.lvm.status(&["vgchange", "-an", vg])
    }

    fn describe_layout(&self) -> StorechainResult<String> {
        let mut layout = String::new();
        for report in ["pvs", "vgs", "lvs"] {
            layout.push_str(&format!("$ lvm {report}\n"));
            match self.lvm.run(&[report])? {
                Execution::Finished(out) if out.status == 0 => layout.push_str(&out.stdout),
                other => layout.push_str(&format!("({})\n", other.into_status())),
            }
        }
        Ok(layout)
    }
}

impl ServiceManager for SystemHost {
    type Error = StorechainError;

    fn daemon_reload(&self) -> StorechainResult<ToolStatus> {
        self.systemctl.status(&["daemon-reload"])
    }

    fn enable(&self, unit: &str) -> StorechainResult<ToolStatus> {
        self.systemctl.status(&["enable", unit])
    }

    fn start(&self, unit: &str) -> StorechainResult<ToolStatus> {
        self.systemctl_start.status(&["start", unit])
    }

    fn stop(&self, unit: &str) -> StorechainResult<ToolStatus> {
        self.systemctl.status(&["stop", unit])
    }

    fn unit_state(&self, unit: &str) -> StorechainResult<UnitState> {
        let stdout = self.query(
            &self.systemctl,
            &["show", "-p", "ActiveState", "-p", "UnitFileState", unit],
        )?;
        Ok(parse_unit_state(&stdout))
    }

    fn recent_logs(&self, unit: &str, lines: usize) -> StorechainResult<String> {
        let count = lines.to_string();
        self.query(
            &self.journalctl,
            &["-u", unit, "-n", &count, "--no-pager"],
        )
    }
}

/// Parse `systemctl show` key=value output.
fn parse_unit_state(stdout: &str) -> UnitState {
    let mut state = UnitState::default();
    for line in stdout.lines() {
        match line.trim().split_once('=') {
            Some(("ActiveState", value)) => state.active = value == "active",
            Some(("UnitFileState", value)) => {
                state.enabled = matches!(value, "enabled" | "enabled-runtime")
            }
            _ => {}
        }
    }
    state
}

/// Flag that forces `mkfs.<fs_type>` over a stale signature.
fn mkfs_force_flag(fs_type: &str) -> Option<&'static str> {
    match fs_type {
        "ext2" | "ext3" | "ext4" => Some("-F"),
        "xfs" | "btrfs" | "f2fs" => Some("-f"),
        _ => None,
    }
}

impl HostTools for SystemHost {
    type Error = StorechainError;

    fn create_image(&self, path: &Path, format: &str, size: &str) -> StorechainResult<ToolStatus> {
        let path_arg = path.to_string_lossy();
        self.qemu_img
            .status(&["create", "-f", format, path_arg.as_ref(), size])
    }

    fn make_filesystem(&self, fs_type: &str, device: &Path) -> StorechainResult<ToolStatus> {
        let device_arg = device.to_string_lossy();
        let mut args = Vec::new();
        args.extend(mkfs_force_flag(fs_type));
        args.push(device_arg.as_ref());
        self.mkfs.status(&args)
    }

    fn filesystem_type(&self, device: &Path) -> StorechainResult<Option<String>> {
        let device_arg = device.to_string_lossy();
        match self
            .blkid
            .run(&["-o", "value", "-s", "TYPE", device_arg.as_ref()])?
        {
            Execution::Finished(out) if out.status == 0 => {
                let kind = out.stdout.trim();
                Ok((!kind.is_empty()).then(|| kind.to_string()))
            }
            Execution::Finished(out) if out.status == 2 => Ok(None),
            other => Err(StorechainError::Tool {
                tool: format!("blkid {}", device.display()),
                status: other.into_status(),
            }),
        }
    }

    fn mount(&self, mountpoint: &Path) -> StorechainResult<ToolStatus> {
        let mountpoint_arg = mountpoint.to_string_lossy();
        self.mount.status(&[mountpoint_arg.as_ref()])
    }

    fn is_mounted(&self, mountpoint: &Path) -> StorechainResult<bool> {
        let contents = fs::read_to_string(&self.mounts_path)?;
        Ok(mounts_contain(&contents, mountpoint))
    }

    fn is_block_device(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|meta| meta.file_type().is_block_device())
            .unwrap_or(false)
    }

    fn device_ready(&self, path: &Path) -> bool {
        if !self.is_block_device(path) {
            return false;
        }
        let size = fs::canonicalize(path)
            .ok()
            .and_then(|real| real.file_name().map(|name| name.to_os_string()))
            .and_then(|name| fs::read_to_string(Path::new(SYSFS_BLOCK).join(name).join("size")).ok())
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(0);
        if size == 0 {
            debug!("{} reports zero size", path.display());
            return false;
        }

        let mut buf = [0u8; 1024];
        match File::open(path).and_then(|mut file| file.read_exact(&mut buf)) {
            Ok(()) => true,
            Err(err) => {
                debug!("trial read of {} failed: {err}", path.display());
                false
            }
        }
    }

    fn settle(&self) -> StorechainResult<ToolStatus> {
        let timeout = format!("--timeout={SETTLE_TIMEOUT_SECS}");
        self.udevadm
            .with_timeout(Duration::from_secs(SETTLE_TIMEOUT_SECS + 5))
            .status(&["settle", &timeout])
    }

    fn lookup_user(&self, name: &str) -> StorechainResult<Option<u32>> {
        Ok(accounts::user_id(name))
    }

    fn lookup_group(&self, name: &str) -> StorechainResult<Option<u32>> {
        Ok(accounts::group_id(name))
    }

    fn is_privileged(&self) -> bool {
        accounts::running_as_root()
    }

    fn missing_tools(&self) -> Vec<String> {
        self.required
            .iter()
            .filter(|(_, path)| !path.is_file())
            .map(|(name, path)| {
                warn!("{name} not found at {}", path.display());
                name.clone()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_state_parses_show_output() {
        let state = parse_unit_state("ActiveState=active\nUnitFileState=enabled\n");
        assert!(state.active && state.enabled);

        let state = parse_unit_state("ActiveState=failed\nUnitFileState=disabled\n");
        assert_eq!(state, UnitState::default());

        let state = parse_unit_state("UnitFileState=enabled-runtime\nActiveState=activating\n");
        assert!(!state.active && state.enabled);
    }

    #[test]
    fn mkfs_force_flag_matches_filesystem_family() {
        assert_eq!(mkfs_force_flag("ext4"), Some("-F"));
        assert_eq!(mkfs_force_flag("xfs"), Some("-f"));
        assert_eq!(mkfs_force_flag("vfat"), None);
    }
}

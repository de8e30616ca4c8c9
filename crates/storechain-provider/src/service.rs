//! Provider contract for the service manager (systemd).

use crate::ToolStatus;
use std::error::Error;

/// Runtime and install state of a single unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitState {
    pub active: bool,
    pub enabled: bool,
}

/// Abstraction over the service-manager commands the orchestrator needs.
pub trait ServiceManager {
    type Error: Error + Send + Sync + 'static;

    /// Ask the service manager to re-read unit files.
    fn daemon_reload(&self) -> Result<ToolStatus, Self::Error>;

    /// Mark `unit` to start at boot.
    fn enable(&self, unit: &str) -> Result<ToolStatus, Self::Error>;

    /// Start `unit` and block until its start sequence (including post-start
    /// checks) completes or fails.
    fn start(&self, unit: &str) -> Result<ToolStatus, Self::Error>;

    fn stop(&self, unit: &str) -> Result<ToolStatus, Self::Error>;

    fn unit_state(&self, unit: &str) -> Result<UnitState, Self::Error>;

    /// Return the last `lines` journal lines for `unit`.
    fn recent_logs(&self, unit: &str, lines: usize) -> Result<String, Self::Error>;
}

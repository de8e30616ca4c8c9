#![forbid(unsafe_code)]

//! Provider contracts shared across storechain.
//!
//! Workflows in `storechain-core` talk to the host exclusively through these
//! traits, so the orchestration logic can be exercised against mock hosts
//! without touching real block devices.

pub mod host;
pub mod service;
pub mod volume;

use std::fmt;
use std::time::Duration;

/// Structured result of an external tool invocation.
///
/// Decision logic matches on these variants instead of scraping tool output;
/// classification of raw diagnostics happens once inside the system provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    Ok,
    /// The tool binary or the object it was asked about does not exist.
    NotFound,
    /// The tool refused because the target is already claimed or in use.
    Conflict(String),
    /// The tool was killed after exceeding its time budget.
    Timeout(Duration),
    ToolError { exit_code: i32, stderr: String },
}

impl ToolStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolStatus::Ok)
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolStatus::Ok => write!(f, "ok"),
            ToolStatus::NotFound => write!(f, "not found"),
            ToolStatus::Conflict(reason) => write!(f, "conflict: {reason}"),
            ToolStatus::Timeout(after) => write!(f, "timed out after {after:?}"),
            ToolStatus::ToolError { exit_code, stderr } => {
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    write!(f, "exit code {exit_code}")
                } else {
                    write!(f, "exit code {exit_code}: {stderr}")
                }
            }
        }
    }
}

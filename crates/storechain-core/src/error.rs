//! Error taxonomy shared by every storechain crate.

use storechain_provider::ToolStatus;
use thiserror::Error;

pub type StorechainResult<T> = Result<T, StorechainError>;

#[derive(Debug, Error)]
pub enum StorechainError {
    /// Environment is not fit to run (privileges, tools, accounts, files).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A readiness poll exhausted its attempt budget.
    #[error("timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    /// Existing state contradicts the desired state; operator action needed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A non-idempotent step reported failure.
    #[error("{tool} failed: {status}")]
    Tool { tool: String, status: ToolStatus },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The process lacks the rights to touch block devices, units or fstab.
    #[error("insufficient privileges: {0}")]
    Privilege(String),

    /// Host integration failure that is not tied to a single tool result.
    #[error("system error: {0}")]
    System(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML configuration: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to process YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Turn a non-`Ok` tool status into a `Tool` error tagged with `tool`.
pub fn require_ok(tool: impl Into<String>, status: ToolStatus) -> StorechainResult<()> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(StorechainError::Tool {
            tool: tool.into(),
            status,
        })
    }
}

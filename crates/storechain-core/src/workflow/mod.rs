//! Workflow orchestration for provisioning and read-only status checks.

mod preconditions;
mod provisioning;
mod status;
mod volumes;

pub use preconditions::{check_preconditions, Accounts};
pub use provisioning::provision;
pub use status::status;

use std::fmt;

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// What a provisioning step ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    AlreadySatisfied,
    Applied,
    /// Completed, but something non-fatal needs operator attention.
    Warned,
}

impl StepOutcome {
    /// Fold two outcomes, keeping the most noteworthy.
    pub fn merge(self, other: StepOutcome) -> StepOutcome {
        use StepOutcome::*;
        match (self, other) {
            (Warned, _) | (_, Warned) => Warned,
            (Applied, _) | (_, Applied) => Applied,
            _ => AlreadySatisfied,
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::AlreadySatisfied => write!(f, "already satisfied"),
            StepOutcome::Applied => write!(f, "applied"),
            StepOutcome::Warned => write!(f, "completed with warnings"),
        }
    }
}

/// Per-step summary line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSummary {
    pub name: &'static str,
    pub outcome: StepOutcome,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
    pub steps: Vec<StepSummary>,
}

impl WorkflowReport {
    /// Outcome recorded for `name`, if that step ran.
    pub fn step(&self, name: &str) -> Option<StepOutcome> {
        self.steps
            .iter()
            .find(|step| step.name == name)
            .map(|step| step.outcome)
    }
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests;

//! Operator-facing reporting and host preconditions.

mod privilege;

pub use privilege::ensure_privilege;

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowReport {
    pub fn has_errors(&self) -> bool {
        self.events
            .iter()
            .any(|event| event.level == WorkflowLevel::Error)
    }
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

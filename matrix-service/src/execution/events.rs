// Execution Events
// Progress reporting and event types for matrix runs

use crate::execution::checks::{CheckStatus, SubCheck};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a matrix run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started for the given changes
    RunStarted { changes: Vec<String> },

    /// Run finished
    RunCompleted {
        success: bool,
        total: usize,
        failed: usize,
        duration: Duration,
    },

    /// Commits of a change were found
    ChangeResolved { change: String, commits: usize },

    /// A change could not be resolved; its group is skipped
    ResolutionFailed { change: String, error: String },

    /// A change's field map was expanded
    MatrixExpanded {
        change: String,
        entries: usize,
        memo_keys: usize,
    },

    /// Preparation of a shared artifact started
    ArtifactStarted { key: String },

    /// Preparation of a shared artifact finished
    ArtifactCompleted {
        key: String,
        success: bool,
        duration: Duration,
    },

    /// Checking an entry started
    EntryStarted { group: String, name: String },

    /// Checking an entry finished
    EntryCompleted {
        group: String,
        name: String,
        status: CheckStatus,
        duration: Duration,
    },

    /// A sub-check of an entry started
    CheckStarted { name: String, check: SubCheck },

    /// A sub-check of an entry finished
    CheckCompleted {
        name: String,
        check: SubCheck,
        status: CheckStatus,
        duration: Duration,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        change: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn run_started(changes: &[String]) -> Self {
        Self::RunStarted {
            changes: changes.to_vec(),
        }
    }

    pub fn run_completed(success: bool, total: usize, failed: usize, duration: Duration) -> Self {
        Self::RunCompleted {
            success,
            total,
            failed,
            duration,
        }
    }

    pub fn entry_started(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self::EntryStarted {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn entry_completed(
        group: impl Into<String>,
        name: impl Into<String>,
        status: CheckStatus,
        duration: Duration,
    ) -> Self {
        Self::EntryCompleted {
            group: group.into(),
            name: name.into(),
            status,
            duration,
        }
    }

    pub fn check_started(name: impl Into<String>, check: SubCheck) -> Self {
        Self::CheckStarted {
            name: name.into(),
            check,
        }
    }

    pub fn check_completed(
        name: impl Into<String>,
        check: SubCheck,
        status: CheckStatus,
        duration: Duration,
    ) -> Self {
        Self::CheckCompleted {
            name: name.into(),
            check,
            status,
            duration,
        }
    }

    /// Create a log event
    pub fn log(level: LogLevel, message: impl Into<String>, change: Option<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
            change,
        }
    }

    pub fn warning(message: impl Into<String>, change: Option<String>) -> Self {
        Self::log(LogLevel::Warning, message, change)
    }
}

/// Helper trait for sending events
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

// Check Model
// Sub-check kinds, statuses, and per-entry results

use crate::matrix::MatrixEntry;
use crate::results::ResultName;

use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// One named step of checking an entry, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubCheck {
    Build,
    Test,
    Clippy,
    Doc,
    Fmt,
    Fuzz,
}

impl SubCheck {
    pub const ALL: [SubCheck; 6] = [
        SubCheck::Build,
        SubCheck::Test,
        SubCheck::Clippy,
        SubCheck::Doc,
        SubCheck::Fmt,
        SubCheck::Fuzz,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubCheck::Build => "build",
            SubCheck::Test => "test",
            SubCheck::Clippy => "clippy",
            SubCheck::Doc => "doc",
            SubCheck::Fmt => "fmt",
            SubCheck::Fuzz => "fuzz",
        }
    }

    /// Step that must pass first; a failed prerequisite skips this step
    pub fn requires(&self) -> Option<SubCheck> {
        match self {
            SubCheck::Test => Some(SubCheck::Build),
            _ => None,
        }
    }

    /// Entry field enabling this step. Build and test always run.
    pub fn enabled_by(&self) -> Option<&'static str> {
        match self {
            SubCheck::Build | SubCheck::Test => None,
            SubCheck::Clippy => Some("clippy"),
            SubCheck::Doc => Some("doc"),
            SubCheck::Fmt => Some("fmt"),
            SubCheck::Fuzz => Some("fuzz"),
        }
    }
}

impl fmt::Display for SubCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a step or a whole entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    /// Exceeded its wall-clock bound; reported apart from ordinary failures
    TimedOut,
    Skipped,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passed => "passed",
            CheckStatus::Failed => "failed",
            CheckStatus::TimedOut => "timed_out",
            CheckStatus::Skipped => "skipped",
        }
    }

    /// Passed and skipped steps do not fail an entry
    pub fn is_success(&self) -> bool {
        matches!(self, CheckStatus::Passed | CheckStatus::Skipped)
    }

    /// Combine step statuses: any failure wins over a timeout, which wins
    /// over success
    pub fn combine<I: IntoIterator<Item = CheckStatus>>(statuses: I) -> CheckStatus {
        statuses
            .into_iter()
            .fold(CheckStatus::Passed, |acc, status| match (acc, status) {
                (CheckStatus::Failed, _) | (_, CheckStatus::Failed) => CheckStatus::Failed,
                (CheckStatus::TimedOut, _) | (_, CheckStatus::TimedOut) => CheckStatus::TimedOut,
                _ => CheckStatus::Passed,
            })
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one sub-check
#[derive(Debug, Clone, Serialize)]
pub struct SubCheckResult {
    pub check: SubCheck,
    pub status: CheckStatus,
    /// Command lines run for this step
    pub commands: Vec<String>,
    pub exit_code: Option<i32>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    #[serde(skip)]
    pub log: String,
    /// Why the step was skipped or could not run
    pub reason: Option<String>,
}

impl SubCheckResult {
    pub fn skipped(check: SubCheck, reason: impl Into<String>) -> Self {
        Self {
            check,
            status: CheckStatus::Skipped,
            commands: Vec::new(),
            exit_code: None,
            duration: Duration::ZERO,
            log: String::new(),
            reason: Some(reason.into()),
        }
    }
}

/// Result of checking one matrix entry
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Group and name, assigned when results are aggregated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<ResultName>,
    pub entry: MatrixEntry,
    pub status: CheckStatus,
    pub steps: Vec<SubCheckResult>,
    /// Failure of the shared artifact computation, identical for every entry
    /// on the same memo key
    pub cause: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl CheckResult {
    pub fn from_steps(entry: MatrixEntry, steps: Vec<SubCheckResult>, duration: Duration) -> Self {
        let status = CheckStatus::combine(steps.iter().map(|s| s.status));
        Self {
            name: None,
            entry,
            status,
            steps,
            cause: None,
            duration,
        }
    }

    /// An entry that never ran because its artifact could not be prepared
    pub fn failed(entry: MatrixEntry, cause: impl Into<String>) -> Self {
        Self {
            name: None,
            entry,
            status: CheckStatus::Failed,
            steps: Vec::new(),
            cause: Some(cause.into()),
            duration: Duration::ZERO,
        }
    }

    pub fn success(&self) -> bool {
        self.status.is_success()
    }

    pub fn step(&self, check: SubCheck) -> Option<&SubCheckResult> {
        self.steps.iter().find(|s| s.check == check)
    }

    /// Combined log: the failure cause, then each step under a header
    pub fn log(&self) -> String {
        let mut log = String::new();
        if let Some(cause) = &self.cause {
            log.push_str(&format!("artifact preparation failed: {}\n", cause));
        }
        for step in &self.steps {
            log.push_str(&format!("==> {} [{}]\n", step.check, step.status));
            for command in &step.commands {
                log.push_str(&format!("$ {}\n", command));
            }
            if let Some(reason) = &step.reason {
                log.push_str(&format!("{}\n", reason));
            }
            if !step.log.is_empty() {
                log.push_str(&step.log);
                if !step.log.ends_with('\n') {
                    log.push('\n');
                }
            }
        }
        log
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

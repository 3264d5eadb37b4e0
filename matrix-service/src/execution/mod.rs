// Execution Module
// Standard matrix construction, artifact preparation, check execution, and run orchestration

pub mod artifact;
pub mod checks;
pub mod events;
pub mod executor;
pub mod plan;
pub mod run;

// Re-export key types
pub use artifact::{ArtifactBuilder, BuildArtifact, CargoArtifactBuilder, LockfileStrategy};
pub use checks::{CheckResult, CheckStatus, SubCheck, SubCheckResult};
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::{CheckExecutor, ExecutorConfig, StepPlan};
pub use plan::{entry_name, fields, memo_projection, StandardMatrix};
pub use run::{MatrixRun, PlannedEntry, RunContext, RunPlan, RunReport};

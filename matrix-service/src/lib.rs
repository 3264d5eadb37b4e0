// Matrix Service Library
// Expands pull requests into build/test matrices and checks every entry

pub mod config;
pub mod error;
pub mod execution;
pub mod features;
pub mod matrix;
pub mod memo;
pub mod results;
pub mod runners;
pub mod source;
pub mod toolchain;
pub mod utils;
pub mod value;

// Re-export commonly used types
pub use config::{RunConfig, WorkspaceOverride};
pub use error::{ErrorClass, ServiceError, ServiceResult};
pub use value::Value;

// Re-export matrix types
pub use matrix::{Derived, FieldArgs, FieldMap, FieldSpec, MatrixBuilder, MatrixEntry, MatrixExpander};
pub use memo::{ComputeError, KeyProjection, MemoCache, MemoKey, MemoOutcome};

// Re-export execution types
pub use execution::{
    CheckExecutor, CheckResult, CheckStatus, ExecutionEvent, LogLevel, MatrixRun, ProgressSender,
    RunContext, RunPlan, RunReport, SubCheck,
};

// Re-export collaborator types
pub use features::{FeaturePolicy, FeatureSelector, SampledFeatureSelector};
pub use runners::{LocalProcessRunner, ProcessCommand, ProcessOutput, ProcessRunner};
pub use source::{CommitInfo, CommitSource, Snapshot, SnapshotFetcher};
pub use toolchain::{Channel, ToolchainHandle, ToolchainResolver};

// Re-export result types
pub use results::{Aggregator, Discriminator, ReportFormat, ResultReporter, ResultSet};

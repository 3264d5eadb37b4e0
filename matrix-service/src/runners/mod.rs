// Runners Module
// Process execution behind a narrow trait

pub mod process;

#[cfg(test)]
pub(crate) mod fake;

// Re-export key types
pub use process::{require_tool, LocalProcessRunner, ProcessCommand, ProcessOutput, ProcessRunner};

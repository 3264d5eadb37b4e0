// Scripted Process Runner
// In-memory ProcessRunner for tests: records commands and replays canned outputs

use crate::error::ServiceResult;
use crate::runners::process::{ProcessCommand, ProcessOutput, ProcessRunner};

use std::sync::Mutex;

/// Replays the output of the first rule whose pattern occurs in the command
/// line; anything unmatched succeeds with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Vec<(String, ProcessOutput)>,
    calls: Mutex<Vec<ProcessCommand>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, pattern: &str, output: ProcessOutput) -> Self {
        self.rules.push((pattern.to_string(), output));
        self
    }

    pub fn stdout(self, pattern: &str, stdout: &str) -> Self {
        self.on(
            pattern,
            ProcessOutput {
                exit_code: Some(0),
                stdout: stdout.to_string(),
                ..Default::default()
            },
        )
    }

    pub fn fail(self, pattern: &str, stderr: &str) -> Self {
        self.on(
            pattern,
            ProcessOutput {
                exit_code: Some(1),
                stderr: stderr.to_string(),
                ..Default::default()
            },
        )
    }

    pub fn time_out(self, pattern: &str) -> Self {
        self.on(
            pattern,
            ProcessOutput {
                timed_out: true,
                ..Default::default()
            },
        )
    }

    pub fn calls(&self) -> Vec<ProcessCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Command lines of every recorded call
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(ProcessCommand::display).collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(pattern)).count()
    }
}

#[async_trait::async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, command: &ProcessCommand) -> ServiceResult<ProcessOutput> {
        self.calls.lock().unwrap().push(command.clone());
        let line = command.display();
        let output = self
            .rules
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or(ProcessOutput {
                exit_code: Some(0),
                ..Default::default()
            });
        Ok(output)
    }
}

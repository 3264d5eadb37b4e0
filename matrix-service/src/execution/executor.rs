// Check Executor
// Runs the ordered sub-checks of one matrix entry against its shared artifact

use crate::config::{RunConfig, WorkspaceOverride};
use crate::error::{ServiceError, ServiceResult};
use crate::execution::artifact::BuildArtifact;
use crate::execution::checks::{CheckResult, CheckStatus, SubCheck, SubCheckResult};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::plan::fields;
use crate::matrix::MatrixEntry;
use crate::memo::MemoOutcome;
use crate::runners::{ProcessCommand, ProcessRunner};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for check execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bound on every non-fuzz command (None = unbounded)
    pub step_timeout: Option<Duration>,
    /// Fuzzing time handed to libFuzzer per target
    pub fuzz_seconds: u64,
    /// Wall-clock bound per fuzz target, fuzzing time included
    pub fuzz_timeout: Duration,
    pub workspaces: BTreeMap<String, WorkspaceOverride>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

impl From<&RunConfig> for ExecutorConfig {
    fn from(config: &RunConfig) -> Self {
        Self {
            step_timeout: config.step_timeout(),
            fuzz_seconds: config.fuzz_seconds,
            fuzz_timeout: config.fuzz_timeout(),
            workspaces: config.workspaces.clone(),
        }
    }
}

/// What to do for one sub-check of an entry
#[derive(Debug, Clone, PartialEq)]
pub enum StepPlan {
    Run(Vec<ProcessCommand>),
    Skip(String),
}

/// Executes sub-checks through the process runner
pub struct CheckExecutor {
    runner: Arc<dyn ProcessRunner>,
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
}

impl CheckExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            config: ExecutorConfig::default(),
            event_tx: None,
        }
    }

    /// Set executor configuration
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Ordered sub-checks for an entry. Fails if the entry lacks a field the
    /// commands need.
    pub fn plan(
        &self,
        entry: &MatrixEntry,
        artifact: &BuildArtifact,
    ) -> ServiceResult<Vec<(SubCheck, StepPlan)>> {
        let workspace = entry
            .str(fields::WORKSPACE)
            .ok_or_else(|| ServiceError::MissingField(fields::WORKSPACE.to_string()))?;
        let features = entry
            .require(fields::FEATURES)?
            .as_string_list()
            .ok_or_else(|| ServiceError::Config("features must be a list of strings".to_string()))?;
        let overrides = self
            .config
            .workspaces
            .get(workspace)
            .cloned()
            .unwrap_or_default();
        let release = entry.flag(fields::RELEASE) || overrides.release;

        let mut selection = vec!["-p".to_string(), workspace.to_string(), "--no-default-features".to_string()];
        if !features.is_empty() {
            selection.push("--features".to_string());
            selection.push(features.join(","));
        }

        let cargo = |subcommand: &str| {
            ProcessCommand::new("cargo", &artifact.source_dir)
                .arg(format!("+{}", artifact.toolchain))
                .arg(subcommand)
                .env("CARGO_TARGET_DIR", artifact.target_dir.display().to_string())
                .timeout(self.config.step_timeout)
        };

        let mut plan = Vec::with_capacity(SubCheck::ALL.len());
        for check in SubCheck::ALL {
            if let Some(field) = check.enabled_by() {
                if !entry.flag(field) {
                    plan.push((check, StepPlan::Skip("not enabled for this entry".to_string())));
                    continue;
                }
            }

            let step = match check {
                SubCheck::Build | SubCheck::Test => {
                    let mut command = cargo(check.as_str()).arg("--locked").args(selection.clone());
                    if release {
                        command = command.arg("--release");
                    }
                    StepPlan::Run(vec![command])
                }
                SubCheck::Clippy if overrides.skip_clippy => {
                    StepPlan::Skip(format!("clippy disabled for {}", workspace))
                }
                SubCheck::Clippy => {
                    let mut command = cargo("clippy")
                        .arg("--locked")
                        .args(selection.clone())
                        .args(["--all-targets", "--", "-D", "warnings"]);
                    if let Some(dir) = artifact.lint_config.clippy.as_deref().and_then(Path::parent) {
                        command = command.env("CLIPPY_CONF_DIR", dir.display().to_string());
                    }
                    StepPlan::Run(vec![command])
                }
                SubCheck::Doc if overrides.skip_doc => {
                    StepPlan::Skip(format!("doc disabled for {}", workspace))
                }
                SubCheck::Doc => StepPlan::Run(vec![cargo("doc")
                    .args(["--locked", "--no-deps"])
                    .args(selection.clone())
                    .env("RUSTDOCFLAGS", "-D warnings")]),
                SubCheck::Fmt => {
                    let mut command = cargo("fmt").args(["--all", "--", "--check"]);
                    if let Some(path) = &artifact.lint_config.rustfmt {
                        command = command.arg("--config-path").arg(path.display().to_string());
                    }
                    StepPlan::Run(vec![command])
                }
                SubCheck::Fuzz if artifact.fuzz_targets.is_empty() => {
                    StepPlan::Skip("no fuzz targets".to_string())
                }
                SubCheck::Fuzz => StepPlan::Run(
                    artifact
                        .fuzz_targets
                        .iter()
                        .map(|target| {
                            cargo("fuzz")
                                .args(["run", target.as_str(), "--"])
                                .arg(format!("-max_total_time={}", self.config.fuzz_seconds))
                                .timeout(Some(self.config.fuzz_timeout))
                        })
                        .collect(),
                ),
            };
            plan.push((check, step));
        }

        Ok(plan)
    }

    /// Check one entry. A failed artifact fails the entry without running
    /// anything; otherwise every sub-check runs unless its prerequisite
    /// failed.
    pub async fn run(
        &self,
        name: &str,
        entry: &MatrixEntry,
        artifact: &MemoOutcome<Arc<BuildArtifact>>,
    ) -> CheckResult {
        let artifact = match artifact {
            Ok(artifact) => artifact,
            Err(err) => return CheckResult::failed(entry.clone(), err.message()),
        };

        let plan = match self.plan(entry, artifact) {
            Ok(plan) => plan,
            Err(err) => return CheckResult::failed(entry.clone(), err.to_string()),
        };

        let start = Instant::now();
        let mut steps: Vec<SubCheckResult> = Vec::with_capacity(plan.len());

        for (check, step) in plan {
            let blocked = check.requires().and_then(|required| {
                steps
                    .iter()
                    .find(|s| s.check == required && !s.status.is_success())
                    .map(|s| format!("skipped because {} {}", s.check, s.status))
            });

            let result = match (blocked, step) {
                (Some(reason), _) => SubCheckResult::skipped(check, reason),
                (None, StepPlan::Skip(reason)) => SubCheckResult::skipped(check, reason),
                (None, StepPlan::Run(commands)) => self.run_step(name, check, commands).await,
            };
            steps.push(result);
        }

        CheckResult::from_steps(entry.clone(), steps, start.elapsed())
    }

    async fn run_step(&self, name: &str, check: SubCheck, commands: Vec<ProcessCommand>) -> SubCheckResult {
        self.event_tx
            .send_event(ExecutionEvent::check_started(name, check));
        let start = Instant::now();

        let mut statuses = Vec::with_capacity(commands.len());
        let mut log = String::new();
        let mut exit_code = None;

        for command in &commands {
            match self.runner.run(command).await {
                Ok(output) => {
                    exit_code = output.exit_code;
                    let combined = output.combined();
                    if !combined.is_empty() {
                        log.push_str(&combined);
                        log.push('\n');
                    }
                    statuses.push(if output.timed_out {
                        CheckStatus::TimedOut
                    } else if output.success() {
                        CheckStatus::Passed
                    } else {
                        CheckStatus::Failed
                    });
                }
                Err(err) => {
                    log.push_str(&format!("{}\n", err));
                    statuses.push(CheckStatus::Failed);
                }
            }
        }

        let status = CheckStatus::combine(statuses);
        let duration = start.elapsed();
        tracing::debug!(entry = name, check = %check, status = %status, "sub-check finished");
        self.event_tx
            .send_event(ExecutionEvent::check_completed(name, check, status, duration));

        SubCheckResult {
            check,
            status,
            commands: commands.iter().map(ProcessCommand::display).collect(),
            exit_code,
            duration,
            log,
            reason: None,
        }
    }
}

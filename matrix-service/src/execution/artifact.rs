// Build Artifacts
// Per-memo-key staging of a snapshot with its lockfile strategy applied

use crate::error::ServiceError;
use crate::execution::plan::fields;
use crate::matrix::MatrixEntry;
use crate::memo::{ComputeError, MemoKey};
use crate::runners::{ProcessCommand, ProcessRunner};
use crate::source::{LintConfig, Snapshot};
use crate::value::fingerprint;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// How the dependency lockfile is produced before building
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockfileStrategy {
    /// The lockfile as committed (generated when the tree has none)
    Committed,
    /// Newest compatible versions
    Latest,
    /// Oldest versions the manifests allow
    Minimal,
}

impl LockfileStrategy {
    pub const ALL: [LockfileStrategy; 3] = [
        LockfileStrategy::Committed,
        LockfileStrategy::Latest,
        LockfileStrategy::Minimal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LockfileStrategy::Committed => "committed",
            LockfileStrategy::Latest => "latest",
            LockfileStrategy::Minimal => "minimal",
        }
    }
}

impl fmt::Display for LockfileStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockfileStrategy {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "committed" => Ok(LockfileStrategy::Committed),
            "latest" => Ok(LockfileStrategy::Latest),
            "minimal" => Ok(LockfileStrategy::Minimal),
            other => Err(ServiceError::Config(format!("unknown lockfile strategy '{}'", other))),
        }
    }
}

/// A prepared tree shared by every entry on one memo key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildArtifact {
    pub key: MemoKey,
    /// Staged copy of the snapshot with the lockfile applied
    pub source_dir: PathBuf,
    /// `CARGO_TARGET_DIR` for every command on this artifact
    pub target_dir: PathBuf,
    pub toolchain: String,
    pub lockfile: LockfileStrategy,
    pub fuzz_targets: Vec<String>,
    /// Lint configuration files inside `source_dir`
    pub lint_config: LintConfig,
}

/// The expensive computation behind the memo cache
#[async_trait::async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn prepare(
        &self,
        key: &MemoKey,
        entry: &MatrixEntry,
        snapshot: &Snapshot,
    ) -> Result<BuildArtifact, ComputeError>;
}

/// Stages snapshots under a work directory and resolves dependencies with cargo
pub struct CargoArtifactBuilder {
    runner: Arc<dyn ProcessRunner>,
    work_dir: PathBuf,
}

impl CargoArtifactBuilder {
    pub fn new(runner: Arc<dyn ProcessRunner>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            work_dir: work_dir.into(),
        }
    }

    /// Staging directory for a key; distinct keys never share one
    pub fn staging_dir(&self, key: &MemoKey) -> PathBuf {
        self.work_dir.join("artifacts").join(fingerprint(key.as_str()))
    }

    async fn step(&self, command: ProcessCommand) -> Result<(), ComputeError> {
        let line = command.display();
        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| ComputeError::new(e.to_string()))?;
        if output.success() {
            Ok(())
        } else {
            Err(ComputeError::new(format!("{}: {}", line, output.failure_summary())))
        }
    }

    fn lockfile_command(
        &self,
        strategy: LockfileStrategy,
        toolchain: &str,
        dir: &Path,
    ) -> Option<ProcessCommand> {
        match strategy {
            LockfileStrategy::Committed if dir.join("Cargo.lock").is_file() => None,
            LockfileStrategy::Committed => Some(
                ProcessCommand::new("cargo", dir).args([format!("+{}", toolchain), "generate-lockfile".into()]),
            ),
            LockfileStrategy::Latest => {
                Some(ProcessCommand::new("cargo", dir).args([format!("+{}", toolchain), "update".into()]))
            }
            // -Z flags need nightly whatever the entry's toolchain is
            LockfileStrategy::Minimal => Some(
                ProcessCommand::new("cargo", dir).args(["+nightly", "update", "-Z", "minimal-versions"]),
            ),
        }
    }
}

#[async_trait::async_trait]
impl ArtifactBuilder for CargoArtifactBuilder {
    async fn prepare(
        &self,
        key: &MemoKey,
        entry: &MatrixEntry,
        snapshot: &Snapshot,
    ) -> Result<BuildArtifact, ComputeError> {
        let toolchain = entry
            .str(fields::TOOLCHAIN)
            .ok_or_else(|| ComputeError::new("entry has no toolchain"))?
            .to_string();
        let lockfile: LockfileStrategy = entry
            .str(fields::LOCKFILE)
            .ok_or_else(|| ComputeError::new("entry has no lockfile strategy"))?
            .parse()
            .map_err(|e: ServiceError| ComputeError::new(e.to_string()))?;

        let staging = self.staging_dir(key);
        tracing::info!(key = %key, dir = %staging.display(), "preparing artifact");

        if staging.exists() {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| ComputeError::new(format!("clearing {}: {}", staging.display(), e)))?;
        }
        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ComputeError::new(format!("creating {}: {}", parent.display(), e)))?;
        }

        self.step(ProcessCommand::new("cp", &self.work_dir).args([
            "-a".to_string(),
            snapshot.path.display().to_string(),
            staging.display().to_string(),
        ]))
        .await?;

        if let Some(command) = self.lockfile_command(lockfile, &toolchain, &staging) {
            self.step(command).await?;
        }

        self.step(ProcessCommand::new("cargo", &staging).args([format!("+{}", toolchain), "fetch".into()]))
            .await?;

        let lint_config = snapshot
            .lint_config
            .as_ref()
            .map(|c| c.rebased(&snapshot.path, &staging))
            .unwrap_or_default();

        Ok(BuildArtifact {
            key: key.clone(),
            target_dir: staging.join("target"),
            source_dir: staging,
            toolchain,
            lockfile,
            fuzz_targets: snapshot.fuzz_targets.clone(),
            lint_config,
        })
    }
}

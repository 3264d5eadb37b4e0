// Git Source
// Pull request commit discovery and worktree snapshots through the git CLI

use crate::error::{ServiceError, ServiceResult};
use crate::runners::{ProcessCommand, ProcessRunner};
use crate::source::manifest::{parse_metadata, parse_toolchain_file};
use crate::source::{CommitInfo, CommitSource, LintConfig, Snapshot, SnapshotFetcher};

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Finds the commits of a pull request (or a bare commit) in a local clone
pub struct GitCommitSource {
    repo: PathBuf,
    remote: String,
    runner: Arc<dyn ProcessRunner>,
}

impl GitCommitSource {
    pub fn new(repo: impl Into<PathBuf>, remote: impl Into<String>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            repo: repo.into(),
            remote: remote.into(),
            runner,
        }
    }

    fn git<I, S>(&self, args: I) -> ProcessCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessCommand::new("git", &self.repo).args(args)
    }

    /// Commits between the PR's base and head, or None when the refs don't
    /// exist on the remote
    async fn pull_request_commits(&self, number: &str) -> ServiceResult<Option<Vec<CommitInfo>>> {
        let head = format!("refs/prmatrix/pull/{}/head", number);
        let merge = format!("refs/prmatrix/pull/{}/merge", number);

        let fetch = self.git([
            "fetch".to_string(),
            "--quiet".to_string(),
            self.remote.clone(),
            format!("+refs/pull/{}/head:{}", number, head),
            format!("+refs/pull/{}/merge:{}", number, merge),
        ]);
        let output = self.runner.run(&fetch).await?;
        if !output.success() {
            tracing::debug!(pr = number, error = %output.failure_summary(), "pull request refs not fetched");
            return Ok(None);
        }

        let list = self.git([
            "rev-list".to_string(),
            "--reverse".to_string(),
            format!("{}^1..{}", merge, head),
        ]);
        let output = self.runner.run(&list).await?;
        if !output.success() {
            return Err(ServiceError::command(list.display(), output.failure_summary()));
        }

        let mut ids: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        // Head already contained in the base: test the head alone
        if ids.is_empty() {
            match self.rev_parse(&head).await? {
                Some(id) => ids.push(id),
                None => return Ok(None),
            }
        }

        let last = ids.len() - 1;
        Ok(Some(
            ids.into_iter()
                .enumerate()
                .map(|(i, id)| CommitInfo::new(id, i == last))
                .collect(),
        ))
    }

    async fn rev_parse(&self, reference: &str) -> ServiceResult<Option<String>> {
        let command = self.git([
            "rev-parse".to_string(),
            "--verify".to_string(),
            "--quiet".to_string(),
            format!("{}^{{commit}}", reference),
        ]);
        let output = self.runner.run(&command).await?;
        let id = output.stdout.trim();
        if output.success() && !id.is_empty() {
            Ok(Some(id.to_string()))
        } else {
            Ok(None)
        }
    }
}

#[async_trait::async_trait]
impl CommitSource for GitCommitSource {
    async fn list_commits(&self, change: &str) -> ServiceResult<Vec<CommitInfo>> {
        let change = change.trim().trim_start_matches('#');

        if !change.is_empty() && change.chars().all(|c| c.is_ascii_digit()) {
            if let Some(commits) = self.pull_request_commits(change).await? {
                tracing::info!(pr = change, commits = commits.len(), "resolved pull request");
                return Ok(commits);
            }
        }

        if let Some(id) = self.rev_parse(change).await? {
            return Ok(vec![CommitInfo::new(id, true)]);
        }

        Err(ServiceError::NotFound {
            repo: self.repo.display().to_string(),
            reference: change.to_string(),
        })
    }
}

/// Checks commits out as detached worktrees under a work directory
pub struct GitSnapshotFetcher {
    repo: PathBuf,
    work_dir: PathBuf,
    runner: Arc<dyn ProcessRunner>,
}

impl GitSnapshotFetcher {
    pub fn new(repo: impl Into<PathBuf>, work_dir: impl Into<PathBuf>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            repo: repo.into(),
            work_dir: work_dir.into(),
            runner,
        }
    }

    pub fn snapshot_dir(&self, commit: &CommitInfo) -> PathBuf {
        self.work_dir.join("snapshots").join(commit.short_id())
    }

    async fn checkout(&self, commit: &CommitInfo, dir: &Path) -> ServiceResult<()> {
        // A worktree has a `.git` file; anything else at the path is stale
        if dir.join(".git").exists() {
            return Ok(());
        }
        if dir.exists() {
            tokio::fs::remove_dir_all(dir).await?;
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let command = ProcessCommand::new("git", &self.repo).args([
            "worktree".to_string(),
            "add".to_string(),
            "--detach".to_string(),
            "--force".to_string(),
            dir.display().to_string(),
            commit.id.clone(),
        ]);
        let output = self.runner.run(&command).await?;
        if !output.success() {
            return Err(ServiceError::command(command.display(), output.failure_summary()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SnapshotFetcher for GitSnapshotFetcher {
    async fn fetch(&self, commit: &CommitInfo) -> ServiceResult<Snapshot> {
        let dir = self.snapshot_dir(commit);
        self.checkout(commit, &dir).await?;

        let manifest_path = dir.join("Cargo.toml");
        if !manifest_path.is_file() {
            return Err(ServiceError::MalformedManifest {
                path: manifest_path,
                message: "no Cargo.toml at the repository root".to_string(),
            });
        }

        let command = ProcessCommand::new("cargo", &dir).args([
            "metadata",
            "--no-deps",
            "--format-version",
            "1",
        ]);
        let output = self.runner.run(&command).await?;
        if !output.success() {
            return Err(ServiceError::MalformedManifest {
                path: manifest_path,
                message: output.failure_summary(),
            });
        }
        let manifest = parse_metadata(&output.stdout, &manifest_path)?;

        let lint_config = detect_lint_config(&dir);
        let toolchain_pin = match read_toolchain_pin(&dir).await? {
            Some(pin) => Some(pin),
            None => manifest.rust_version().map(str::to_string),
        };
        let fuzz_targets = fuzz_targets(&dir).await?;

        tracing::debug!(
            commit = %commit.id,
            members = manifest.members.len(),
            pin = ?toolchain_pin,
            "snapshot ready"
        );

        Ok(Snapshot {
            commit: commit.clone(),
            path: dir,
            manifest,
            lint_config,
            toolchain_pin,
            fuzz_targets,
        })
    }
}

/// Lint configuration files at the tree root, if any
pub fn detect_lint_config(dir: &Path) -> Option<LintConfig> {
    let first = |names: &[&str]| {
        names
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    };
    let config = LintConfig {
        clippy: first(&["clippy.toml", ".clippy.toml"]),
        rustfmt: first(&["rustfmt.toml", ".rustfmt.toml"]),
    };
    (!config.is_empty()).then_some(config)
}

/// Toolchain pinned by a rust-toolchain file at the tree root
pub async fn read_toolchain_pin(dir: &Path) -> ServiceResult<Option<String>> {
    for (name, is_toml) in [("rust-toolchain.toml", true), ("rust-toolchain", false)] {
        let path = dir.join(name);
        if path.is_file() {
            let contents = tokio::fs::read_to_string(&path).await?;
            return Ok(parse_toolchain_file(&contents, is_toml));
        }
    }
    Ok(None)
}

/// Names of the cargo-fuzz targets, sorted
pub async fn fuzz_targets(dir: &Path) -> ServiceResult<Vec<String>> {
    let targets_dir = dir.join("fuzz").join("fuzz_targets");
    if !targets_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut targets = Vec::new();
    let mut entries = tokio::fs::read_dir(&targets_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("rs") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                targets.push(stem.to_string());
            }
        }
    }
    targets.sort();
    Ok(targets)
}

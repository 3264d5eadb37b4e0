// Source Module
// Commit discovery and snapshot fetching for the repository under test

pub mod git;
pub mod manifest;

// Re-export key types
pub use git::{GitCommitSource, GitSnapshotFetcher};
pub use manifest::{Manifest, WorkspaceMember};

use crate::error::ServiceResult;

use serde::Serialize;
use std::path::{Path, PathBuf};

/// A commit to test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub id: String,
    /// Newest commit of the change; expensive checks run only here
    pub is_tip: bool,
}

impl CommitInfo {
    pub fn new(id: impl Into<String>, is_tip: bool) -> Self {
        Self {
            id: id.into(),
            is_tip,
        }
    }

    /// Abbreviated id used in names and logs
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }
}

/// Lint configuration files present in a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LintConfig {
    pub clippy: Option<PathBuf>,
    pub rustfmt: Option<PathBuf>,
}

impl LintConfig {
    pub fn is_empty(&self) -> bool {
        self.clippy.is_none() && self.rustfmt.is_none()
    }

    /// The same files in a copy of the tree at `to`
    pub fn rebased(&self, from: &Path, to: &Path) -> LintConfig {
        let rebase = |path: &Option<PathBuf>| {
            path.as_ref().map(|p| match p.strip_prefix(from) {
                Ok(relative) => to.join(relative),
                Err(_) => p.clone(),
            })
        };
        LintConfig {
            clippy: rebase(&self.clippy),
            rustfmt: rebase(&self.rustfmt),
        }
    }
}

/// A checked-out commit with its manifest read
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub commit: CommitInfo,
    pub path: PathBuf,
    pub manifest: Manifest,
    pub lint_config: Option<LintConfig>,
    pub toolchain_pin: Option<String>,
    /// cargo-fuzz targets under `fuzz/fuzz_targets`
    pub fuzz_targets: Vec<String>,
}

/// Lists the commits making up a change
#[async_trait::async_trait]
pub trait CommitSource: Send + Sync {
    /// Commits of `change` oldest first; exactly one is the tip. Fails with
    /// `NotFound` when neither a pull request nor a commit id resolves.
    async fn list_commits(&self, change: &str) -> ServiceResult<Vec<CommitInfo>>;
}

/// Materializes a commit's working tree
#[async_trait::async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Fails with `MalformedManifest` when the manifest cannot be read
    async fn fetch(&self, commit: &CommitInfo) -> ServiceResult<Snapshot>;
}

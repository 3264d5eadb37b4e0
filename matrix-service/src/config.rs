// Run Configuration
// prmatrix.yml settings with defaults for every field

use crate::error::{ServiceError, ServiceResult};
use crate::execution::artifact::LockfileStrategy;
use crate::features::FeaturePolicy;
use crate::toolchain::{Channel, DEFAULT_FALLBACK_MSRV};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File names searched for at the repository root
pub const CONFIG_FILE_NAMES: [&str; 2] = ["prmatrix.yml", ".prmatrix.yml"];

/// Settings for one matrix run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RunConfig {
    /// Remote holding the pull request refs
    pub remote: String,
    /// Scratch space for worktrees and staged artifacts
    pub work_dir: Option<PathBuf>,
    /// Where results are written
    pub out_dir: PathBuf,
    /// Entries checked at the same time
    pub max_parallel: usize,
    pub channels: Vec<Channel>,
    /// Minimum supported version assumed when a snapshot pins none
    pub fallback_msrv: String,
    /// Install missing toolchains with rustup before the run
    pub install_toolchains: bool,
    pub lockfiles: Vec<LockfileStrategy>,
    pub features: FeaturePolicy,
    /// Workspace member that gets the expensive checks (first member if unset)
    pub designated_workspace: Option<String>,
    /// Channel for clippy and fmt (newest available if unset)
    pub lint_channel: Option<Channel>,
    /// Seconds of fuzzing per target
    pub fuzz_seconds: u64,
    /// Extra wall-clock time allowed on top of `fuzz_seconds`
    pub fuzz_grace_secs: u64,
    /// Bound on every non-fuzz step
    pub step_timeout_secs: Option<u64>,
    /// Per-member overrides, keyed by member name
    pub workspaces: BTreeMap<String, WorkspaceOverride>,
}

/// Adjustments for one workspace member
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct WorkspaceOverride {
    /// Build and test in release mode
    pub release: bool,
    pub skip_clippy: bool,
    pub skip_doc: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            work_dir: None,
            out_dir: PathBuf::from("prmatrix-out"),
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            channels: Channel::ALL.to_vec(),
            fallback_msrv: DEFAULT_FALLBACK_MSRV.to_string(),
            install_toolchains: false,
            lockfiles: LockfileStrategy::ALL.to_vec(),
            features: FeaturePolicy::default(),
            designated_workspace: None,
            lint_channel: None,
            fuzz_seconds: 60,
            fuzz_grace_secs: 30,
            step_timeout_secs: None,
            workspaces: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    pub fn from_yaml(content: &str) -> ServiceResult<Self> {
        let config: RunConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ServiceResult<Self> {
        let content = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loading configuration");
        Self::from_yaml(&content)
    }

    /// Load the config file at the repository root, or defaults if none exists
    pub fn discover(repo_root: &Path) -> ServiceResult<Self> {
        match CONFIG_FILE_NAMES
            .iter()
            .map(|name| repo_root.join(name))
            .find(|path| path.is_file())
        {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> ServiceResult<()> {
        if self.max_parallel == 0 {
            return Err(ServiceError::Config("max_parallel must be at least 1".to_string()));
        }
        if self.channels.is_empty() {
            return Err(ServiceError::Config("no toolchain channels enabled".to_string()));
        }
        if self.lockfiles.is_empty() {
            return Err(ServiceError::Config("no lockfile strategies enabled".to_string()));
        }
        if let Some(channel) = self.lint_channel {
            if !self.channels.contains(&channel) {
                return Err(ServiceError::Config(format!(
                    "lint_channel '{}' is not among the enabled channels",
                    channel
                )));
            }
        }
        Ok(())
    }

    pub fn workspace(&self, name: &str) -> WorkspaceOverride {
        self.workspaces.get(name).cloned().unwrap_or_default()
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }

    /// Wall-clock bound for one fuzz target
    pub fn fuzz_timeout(&self) -> Duration {
        Duration::from_secs(self.fuzz_seconds.saturating_add(self.fuzz_grace_secs))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(crate::utils::default_work_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = RunConfig::from_yaml("{}").unwrap();
        assert_eq!(config.remote, "origin");
        assert_eq!(config.channels.len(), 4);
        assert_eq!(config.lockfiles, LockfileStrategy::ALL.to_vec());
        assert_eq!(config.fuzz_timeout(), Duration::from_secs(90));
        assert_eq!(config.step_timeout(), None);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
remote: upstream
max_parallel: 2
channels: [stable, msrv]
lockfiles: [committed]
fallback_msrv: "1.60.0"
lint_channel: stable
fuzz_seconds: 10
step_timeout_secs: 600
features:
  skip_sampling: [heavy]
  extra:
    - [a, b]
  exclude:
    - [c]
workspaces:
  core:
    release: true
    skip_doc: true
"#;
        let config = RunConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.remote, "upstream");
        assert_eq!(config.channels, vec![Channel::Stable, Channel::Msrv]);
        assert_eq!(config.lockfiles, vec![LockfileStrategy::Committed]);
        assert!(config.features.skip_sampling.contains("heavy"));
        assert_eq!(config.features.extra, vec![vec!["a".to_string(), "b".to_string()]]);
        assert_eq!(config.step_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.fuzz_timeout(), Duration::from_secs(40));

        let core = config.workspace("core");
        assert!(core.release);
        assert!(core.skip_doc);
        assert!(!core.skip_clippy);
        assert_eq!(config.workspace("other"), WorkspaceOverride::default());
    }

    #[test]
    fn test_validation() {
        assert!(RunConfig::from_yaml("max_parallel: 0").is_err());
        assert!(RunConfig::from_yaml("lockfiles: []").is_err());
        assert!(RunConfig::from_yaml("channels: [stable]\nlint_channel: nightly").is_err());

        let err = RunConfig::from_yaml("channels: [lts]").unwrap_err();
        assert!(matches!(err, ServiceError::Yaml(_)));
    }

    #[test]
    fn test_fuzz_timeout_saturates() {
        let config = RunConfig::from_yaml("fuzz_seconds: 18446744073709551615\nfuzz_grace_secs: 60").unwrap();
        assert_eq!(config.fuzz_timeout(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_discover() {
        let dir = TempDir::new().unwrap();
        assert_eq!(RunConfig::discover(dir.path()).unwrap(), RunConfig::default());

        std::fs::write(dir.path().join(".prmatrix.yml"), "fuzz_seconds: 5\n").unwrap();
        assert_eq!(RunConfig::discover(dir.path()).unwrap().fuzz_seconds, 5);
    }
}

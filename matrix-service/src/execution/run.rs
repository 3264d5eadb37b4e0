// Matrix Run
// Resolves changes into entries and checks them on a bounded worker pool

use crate::config::RunConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::execution::artifact::{ArtifactBuilder, BuildArtifact, CargoArtifactBuilder};
use crate::execution::checks::CheckResult;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::executor::{CheckExecutor, ExecutorConfig};
use crate::execution::plan::{self, fields, StandardMatrix};
use crate::features::{FeatureSelector, SampledFeatureSelector};
use crate::matrix::{MatrixEntry, MatrixExpander};
use crate::memo::{ComputeError, KeyProjection, MemoCache, MemoKey};
use crate::results::{Aggregator, Discriminator, ResultName, ResultSet};
use crate::runners::{LocalProcessRunner, ProcessRunner};
use crate::source::{CommitSource, GitCommitSource, GitSnapshotFetcher, Snapshot, SnapshotFetcher};
use crate::toolchain::{RustupToolchainResolver, ToolchainResolver};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Configuration and collaborators shared by every stage of a run
#[derive(Clone)]
pub struct RunContext {
    pub config: RunConfig,
    pub commits: Arc<dyn CommitSource>,
    pub snapshots: Arc<dyn SnapshotFetcher>,
    pub toolchains: Arc<dyn ToolchainResolver>,
    pub features: Arc<dyn FeatureSelector>,
    pub artifacts: Arc<dyn ArtifactBuilder>,
    pub runner: Arc<dyn ProcessRunner>,
    pub event_tx: Option<ProgressSender>,
}

impl RunContext {
    /// Git, rustup and cargo collaborators working on the repository at `repo`
    pub fn local(repo: &Path, config: RunConfig) -> Self {
        let runner: Arc<dyn ProcessRunner> = Arc::new(LocalProcessRunner::new());
        let work_dir = config.work_dir();

        Self {
            commits: Arc::new(GitCommitSource::new(repo, config.remote.clone(), runner.clone())),
            snapshots: Arc::new(GitSnapshotFetcher::new(repo, &work_dir, runner.clone())),
            toolchains: Arc::new(
                RustupToolchainResolver::new(runner.clone())
                    .with_channels(config.channels.clone())
                    .with_fallback_msrv(config.fallback_msrv.clone())
                    .with_install(config.install_toolchains),
            ),
            features: Arc::new(SampledFeatureSelector::new(config.features.clone())),
            artifacts: Arc::new(CargoArtifactBuilder::new(runner.clone(), &work_dir)),
            runner,
            config,
            event_tx: None,
        }
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

/// An expanded entry with its result name and memo key
#[derive(Debug, Clone)]
pub struct PlannedEntry {
    pub name: ResultName,
    pub key: MemoKey,
    pub entry: MatrixEntry,
    snapshot: Arc<Snapshot>,
}

/// Expanded entries of every change that resolved
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub entries: Vec<PlannedEntry>,
    /// Changes that could not be resolved, with the reason
    pub resolution_failures: BTreeMap<String, String>,
}

impl RunPlan {
    pub fn memo_keys(&self) -> usize {
        self.entries.iter().map(|e| &e.key).collect::<BTreeSet<_>>().len()
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub results: ResultSet,
    pub resolution_failures: BTreeMap<String, String>,
    /// Artifact computations that actually ran
    pub computations: usize,
    pub duration: Duration,
}

impl RunReport {
    /// Every entry passed and every change resolved
    pub fn success(&self) -> bool {
        self.results.success() && self.resolution_failures.is_empty()
    }

    /// Write the result directory, plus `resolution_failures.json` when a
    /// change could not be resolved
    pub fn write_to_dir(&self, out: &Path) -> ServiceResult<()> {
        self.results.write_to_dir(out)?;
        if !self.resolution_failures.is_empty() {
            fs::write(
                out.join("resolution_failures.json"),
                serde_json::to_string_pretty(&self.resolution_failures)?,
            )?;
        }
        Ok(())
    }
}

/// Runs the standard matrix for a list of changes
pub struct MatrixRun {
    ctx: RunContext,
    aggregator: Aggregator,
    projection: KeyProjection,
}

impl MatrixRun {
    /// Groups by change and names entries by commit, toolchain, workspace,
    /// lockfile and feature fingerprint
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            aggregator: Aggregator::new(fields::CHANGE, Discriminator::custom(plan::entry_name)),
            projection: plan::memo_projection(),
        }
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.ctx.config
    }

    /// Resolve and expand every change without running anything.
    ///
    /// A change that fails to resolve is recorded and skipped; configuration
    /// and naming errors abort the plan.
    pub async fn plan(&self, changes: &[String]) -> ServiceResult<RunPlan> {
        let mut plan = RunPlan::default();
        let mut seen = BTreeSet::new();

        for change in changes {
            if !seen.insert(change.as_str()) {
                tracing::debug!(change = %change, "duplicate change ignored");
                continue;
            }

            match self.expand_change(change).await {
                Ok(entries) => plan.entries.extend(entries),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(change = %change, error = %err, "change could not be resolved");
                    self.ctx.event_tx.send_event(ExecutionEvent::ResolutionFailed {
                        change: change.clone(),
                        error: err.to_string(),
                    });
                    plan.resolution_failures.insert(change.clone(), err.to_string());
                }
            }
        }

        let entries: Vec<MatrixEntry> = plan.entries.iter().map(|e| e.entry.clone()).collect();
        for (planned, name) in plan.entries.iter_mut().zip(self.aggregator.names(&entries)?) {
            planned.name = name;
        }

        Ok(plan)
    }

    async fn expand_change(&self, change: &str) -> ServiceResult<Vec<PlannedEntry>> {
        let commits = self.ctx.commits.list_commits(change).await?;
        self.ctx.event_tx.send_event(ExecutionEvent::ChangeResolved {
            change: change.to_string(),
            commits: commits.len(),
        });

        let mut matrix = StandardMatrix::new(change, &self.ctx.config, self.ctx.features.clone());
        let mut snapshots = HashMap::new();

        for commit in &commits {
            let snapshot = self.ctx.snapshots.fetch(commit).await?;
            let toolchains = self.ctx.toolchains.resolve(snapshot.toolchain_pin.as_deref()).await?;
            for fallback in toolchains.iter().filter(|h| !h.pinned) {
                let message = format!(
                    "commit {} pins no toolchain; using {} as the minimum supported version",
                    commit.short_id(),
                    fallback.name
                );
                tracing::warn!(change = %change, commit = %commit.short_id(), "{}", message);
                self.ctx
                    .event_tx
                    .send_event(ExecutionEvent::warning(message, Some(change.to_string())));
            }

            matrix.add_snapshot(&snapshot, toolchains);
            snapshots.insert(commit.id.clone(), Arc::new(snapshot));
        }

        let entries = MatrixExpander::expand(&matrix.fields())?;
        let planned = entries
            .into_iter()
            .map(|entry| {
                let key = self.projection.key(&entry)?;
                let commit = entry.require(fields::COMMIT)?.as_string();
                let snapshot = snapshots
                    .get(&commit)
                    .cloned()
                    .ok_or_else(|| ServiceError::MissingField(fields::COMMIT.to_string()))?;
                Ok(PlannedEntry {
                    name: ResultName {
                        group: change.to_string(),
                        name: String::new(),
                    },
                    key,
                    entry,
                    snapshot,
                })
            })
            .collect::<ServiceResult<Vec<_>>>()?;

        let memo_keys = planned.iter().map(|e| &e.key).collect::<BTreeSet<_>>().len();
        tracing::info!(change = %change, entries = planned.len(), memo_keys, "matrix expanded");
        self.ctx.event_tx.send_event(ExecutionEvent::MatrixExpanded {
            change: change.to_string(),
            entries: planned.len(),
            memo_keys,
        });

        Ok(planned)
    }

    /// Plan, check every entry, and aggregate
    pub async fn run(&self, changes: &[String]) -> ServiceResult<RunReport> {
        let start = Instant::now();
        self.ctx.event_tx.send_event(ExecutionEvent::run_started(changes));

        let plan = self.plan(changes).await?;
        let cache: Arc<MemoCache<Arc<BuildArtifact>>> = Arc::new(MemoCache::new());
        let semaphore = Arc::new(Semaphore::new(self.ctx.config.max_parallel.max(1)));

        let mut executor = CheckExecutor::new(self.ctx.runner.clone())
            .with_config(ExecutorConfig::from(&self.ctx.config));
        if let Some(tx) = &self.ctx.event_tx {
            executor = executor.with_progress(tx.clone());
        }
        let executor = Arc::new(executor);

        // Every entry gets a result even if its task dies
        let mut results: Vec<CheckResult> = plan
            .entries
            .iter()
            .map(|p| CheckResult::failed(p.entry.clone(), "entry was not checked"))
            .collect();

        let mut tasks = JoinSet::new();
        for (index, planned) in plan.entries.iter().cloned().enumerate() {
            let cache = cache.clone();
            let semaphore = semaphore.clone();
            let executor = executor.clone();
            let builder = self.ctx.artifacts.clone();
            let event_tx = self.ctx.event_tx.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let label = planned.name.to_string();
                event_tx.send_event(ExecutionEvent::entry_started(&planned.name.group, &planned.name.name));

                let artifact = cache
                    .get_or_compute_key(planned.key.clone(), |key| {
                        prepare_artifact(builder, key, planned.entry.clone(), planned.snapshot.clone(), event_tx.clone())
                    })
                    .await;

                let result = executor.run(&label, &planned.entry, &artifact).await;
                event_tx.send_event(ExecutionEvent::entry_completed(
                    &planned.name.group,
                    &planned.name.name,
                    result.status,
                    result.duration,
                ));
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = result,
                Err(err) => tracing::error!(error = %err, "entry task failed"),
            }
        }

        let entries: Vec<MatrixEntry> = plan.entries.iter().map(|p| p.entry.clone()).collect();
        let results = self.aggregator.aggregate(&entries, results)?;

        let report = RunReport {
            computations: cache.computations(),
            results,
            resolution_failures: plan.resolution_failures,
            duration: start.elapsed(),
        };

        tracing::info!(
            entries = report.results.len(),
            failed = report.results.failed(),
            computations = report.computations,
            "run finished"
        );
        self.ctx.event_tx.send_event(ExecutionEvent::run_completed(
            report.success(),
            report.results.len(),
            report.results.failed(),
            report.duration,
        ));

        Ok(report)
    }
}

async fn prepare_artifact(
    builder: Arc<dyn ArtifactBuilder>,
    key: MemoKey,
    entry: MatrixEntry,
    snapshot: Arc<Snapshot>,
    event_tx: Option<ProgressSender>,
) -> Result<Arc<BuildArtifact>, ComputeError> {
    let start = Instant::now();
    event_tx.send_event(ExecutionEvent::ArtifactStarted { key: key.to_string() });

    let prepared = builder.prepare(&key, &entry, &snapshot).await;
    if let Err(err) = &prepared {
        tracing::warn!(key = %key, error = %err, "artifact preparation failed");
    }

    event_tx.send_event(ExecutionEvent::ArtifactCompleted {
        key: key.to_string(),
        success: prepared.is_ok(),
        duration: start.elapsed(),
    });
    prepared.map(Arc::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::artifact::LockfileStrategy;
    use crate::execution::checks::{CheckStatus, SubCheck};
    use crate::execution::events::progress_channel;
    use crate::runners::fake::ScriptedRunner;
    use crate::source::{CommitInfo, Manifest, WorkspaceMember};
    use crate::toolchain::{Channel, ToolchainHandle};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeCommits;

    #[async_trait::async_trait]
    impl CommitSource for FakeCommits {
        async fn list_commits(&self, change: &str) -> ServiceResult<Vec<CommitInfo>> {
            match change {
                "42" => Ok(vec![CommitInfo::new("c0ffee0000000000000000000000000000000042", true)]),
                "43" => Ok(vec![CommitInfo::new("badbadbad0000000000000000000000000000043", true)]),
                _ => Err(ServiceError::NotFound {
                    repo: "/src/repo".to_string(),
                    reference: change.to_string(),
                }),
            }
        }
    }

    struct FakeSnapshots;

    #[async_trait::async_trait]
    impl SnapshotFetcher for FakeSnapshots {
        async fn fetch(&self, commit: &CommitInfo) -> ServiceResult<Snapshot> {
            if commit.id.starts_with("bad") {
                return Err(ServiceError::MalformedManifest {
                    path: PathBuf::from("/w/Cargo.toml"),
                    message: "expected a table".to_string(),
                });
            }
            Ok(Snapshot {
                commit: commit.clone(),
                path: PathBuf::from("/w"),
                manifest: Manifest {
                    root: PathBuf::from("/w"),
                    members: vec![WorkspaceMember {
                        name: "core".to_string(),
                        version: "0.1.0".to_string(),
                        manifest_path: PathBuf::from("/w/Cargo.toml"),
                        features: vec!["std".to_string()],
                        rust_version: None,
                    }],
                },
                lint_config: None,
                toolchain_pin: Some("1.70.0".to_string()),
                fuzz_targets: Vec::new(),
            })
        }
    }

    struct TwoToolchains;

    #[async_trait::async_trait]
    impl ToolchainResolver for TwoToolchains {
        async fn resolve(&self, _pin: Option<&str>) -> ServiceResult<Vec<ToolchainHandle>> {
            Ok(vec![
                ToolchainHandle::new(Channel::Nightly, "nightly"),
                ToolchainHandle::new(Channel::Stable, "stable"),
            ])
        }
    }

    struct FallbackToolchain;

    #[async_trait::async_trait]
    impl ToolchainResolver for FallbackToolchain {
        async fn resolve(&self, _pin: Option<&str>) -> ServiceResult<Vec<ToolchainHandle>> {
            Ok(vec![
                ToolchainHandle::new(Channel::Stable, "stable"),
                ToolchainHandle {
                    pinned: false,
                    ..ToolchainHandle::new(Channel::Msrv, "1.56.0")
                },
            ])
        }
    }

    #[derive(Default)]
    struct CountingBuilder {
        prepared: AtomicUsize,
        fail_toolchain: Option<&'static str>,
    }

    #[async_trait::async_trait]
    impl ArtifactBuilder for CountingBuilder {
        async fn prepare(
            &self,
            key: &MemoKey,
            entry: &MatrixEntry,
            snapshot: &Snapshot,
        ) -> Result<BuildArtifact, ComputeError> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;

            let toolchain = entry.str(fields::TOOLCHAIN).unwrap_or_default().to_string();
            if self.fail_toolchain == Some(toolchain.as_str()) {
                return Err(ComputeError::new(format!("cargo +{} fetch: network down", toolchain)));
            }
            Ok(BuildArtifact {
                key: key.clone(),
                source_dir: snapshot.path.clone(),
                target_dir: snapshot.path.join("target").join(&toolchain),
                toolchain,
                lockfile: LockfileStrategy::Committed,
                fuzz_targets: snapshot.fuzz_targets.clone(),
                lint_config: Default::default(),
            })
        }
    }

    fn context(builder: Arc<CountingBuilder>, runner: Arc<ScriptedRunner>) -> RunContext {
        let config = RunConfig {
            lockfiles: vec![LockfileStrategy::Committed],
            max_parallel: 2,
            ..RunConfig::default()
        };
        RunContext {
            features: Arc::new(SampledFeatureSelector::new(config.features.clone())),
            config,
            commits: Arc::new(FakeCommits),
            snapshots: Arc::new(FakeSnapshots),
            toolchains: Arc::new(TwoToolchains),
            artifacts: builder,
            runner,
            event_tx: None,
        }
    }

    fn changes(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let builder = Arc::new(CountingBuilder::default());
        let runner = Arc::new(ScriptedRunner::new());
        let run = MatrixRun::new(context(builder.clone(), runner.clone()));

        let report = run.run(&changes(&["42"])).await.unwrap();

        // 2 toolchains x 2 feature sets, one commit, one lockfile
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.computations, 2);
        assert_eq!(builder.prepared.load(Ordering::SeqCst), 2);
        assert!(report.success());

        let group = report.results.group("42").unwrap();
        for toolchain in ["nightly", "stable"] {
            let paired: Vec<_> = group
                .values()
                .filter(|r| r.entry.str(fields::TOOLCHAIN) == Some(toolchain))
                .collect();
            assert_eq!(paired.len(), 2);
            assert!(group.keys().filter(|n| n.contains(&format!("-{}-", toolchain))).count() == 2);
        }

        assert_eq!(runner.count("cargo +nightly build"), 2);
        assert_eq!(runner.count("cargo +stable test"), 2);
    }

    #[tokio::test]
    async fn test_artifact_failure_fails_its_entries_only() {
        let builder = Arc::new(CountingBuilder {
            fail_toolchain: Some("stable"),
            ..CountingBuilder::default()
        });
        let runner = Arc::new(ScriptedRunner::new());
        let run = MatrixRun::new(context(builder.clone(), runner.clone()));

        let report = run.run(&changes(&["42"])).await.unwrap();

        assert_eq!(report.results.len(), 4);
        assert_eq!(report.results.failed(), 2);
        assert_eq!(builder.prepared.load(Ordering::SeqCst), 2);
        for (_, _, result) in report.results.iter() {
            if result.entry.str(fields::TOOLCHAIN) == Some("stable") {
                assert_eq!(result.status, CheckStatus::Failed);
                assert!(result.cause.as_deref().unwrap().contains("network down"));
                assert!(result.steps.is_empty());
            } else {
                assert!(result.success());
                assert!(result.step(SubCheck::Build).is_some());
            }
        }
        assert_eq!(runner.count("cargo +stable"), 0);
    }

    #[tokio::test]
    async fn test_unresolved_change_skips_its_group() {
        let builder = Arc::new(CountingBuilder::default());
        let (tx, mut rx) = progress_channel();
        let run = MatrixRun::new(context(builder, Arc::new(ScriptedRunner::new())).with_progress(tx));

        let report = run.run(&changes(&["404", "42"])).await.unwrap();

        assert_eq!(report.results.len(), 4);
        assert!(report.results.success());
        assert!(!report.success());
        assert!(report.resolution_failures["404"].contains("not found"));

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::ResolutionFailed { change, .. } = event {
                assert_eq!(change, "404");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_malformed_manifest_aborts_before_checks() {
        let builder = Arc::new(CountingBuilder::default());
        let runner = Arc::new(ScriptedRunner::new());
        let run = MatrixRun::new(context(builder.clone(), runner.clone()));

        let err = run.run(&changes(&["42", "43"])).await.unwrap_err();

        assert!(matches!(err, ServiceError::MalformedManifest { .. }));
        assert_eq!(builder.prepared.load(Ordering::SeqCst), 0);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_plan_names_and_keys() {
        let run = MatrixRun::new(context(Arc::new(CountingBuilder::default()), Arc::new(ScriptedRunner::new())));

        let plan = run.plan(&changes(&["42", "42"])).await.unwrap();

        assert_eq!(plan.entries.len(), 4);
        assert_eq!(plan.memo_keys(), 2);
        assert!(plan.entries.iter().all(|p| p.name.group == "42"));
        assert!(plan.entries.iter().all(|p| p.name.name.starts_with("c0ffee000000-")));
        assert!(plan.entries.iter().all(|p| p.name.name.contains("-core-committed-")));
        let unfeatured = plan
            .entries
            .iter()
            .filter(|p| p.name.name.ends_with("-nofeatures"))
            .count();
        assert_eq!(unfeatured, 2);
    }

    #[tokio::test]
    async fn test_fallback_toolchain_warns() {
        let (tx, mut rx) = progress_channel();
        let mut ctx = context(Arc::new(CountingBuilder::default()), Arc::new(ScriptedRunner::new()));
        ctx.toolchains = Arc::new(FallbackToolchain);
        let run = MatrixRun::new(ctx.with_progress(tx));

        run.plan(&changes(&["42"])).await.unwrap();

        let mut warnings = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::Log { message, .. } = event {
                warnings.push(message);
            }
        }
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("using 1.56.0"));
    }

    #[tokio::test]
    async fn test_write_report() {
        let out = tempfile::TempDir::new().unwrap();
        let run = MatrixRun::new(context(Arc::new(CountingBuilder::default()), Arc::new(ScriptedRunner::new())));

        let report = run.run(&changes(&["42", "404"])).await.unwrap();
        report.write_to_dir(out.path()).unwrap();

        assert!(out.path().join("summary.json").is_file());
        assert!(out.path().join("42").is_dir());
        let failures = fs::read_to_string(out.path().join("resolution_failures.json")).unwrap();
        assert!(failures.contains("404"));
    }
}

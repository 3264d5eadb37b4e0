// Standard Matrix
// Builds the field map for one change from its snapshots and toolchains

use crate::config::{RunConfig, WorkspaceOverride};
use crate::execution::artifact::LockfileStrategy;
use crate::features::{self, FeatureSelector, FeatureSource};
use crate::matrix::{Derived, FieldArgs, FieldMap, MatrixBuilder, MatrixEntry};
use crate::memo::KeyProjection;
use crate::source::Snapshot;
use crate::toolchain::{Channel, ToolchainHandle};
use crate::value::Value;

use std::collections::BTreeMap;
use std::sync::Arc;

/// Names of the standard matrix fields
pub mod fields {
    pub const CHANGE: &str = "change";
    pub const COMMIT: &str = "commit";
    pub const TIP: &str = "tip";
    pub const TOOLCHAIN: &str = "toolchain";
    pub const WORKSPACE: &str = "workspace";
    pub const LOCKFILE: &str = "lockfile";
    pub const FEATURES: &str = "features";
    pub const RELEASE: &str = "release";
    pub const CLIPPY: &str = "clippy";
    pub const DOC: &str = "doc";
    pub const FMT: &str = "fmt";
    pub const FUZZ: &str = "fuzz";
}

/// Fields an artifact depends on
pub fn memo_projection() -> KeyProjection {
    KeyProjection::new([fields::COMMIT, fields::LOCKFILE, fields::TOOLCHAIN])
}

/// Result name of a standard entry: commit, toolchain, workspace, lockfile,
/// and a fingerprint of the feature set
pub fn entry_name(entry: &MatrixEntry) -> Result<String, String> {
    let part = |name: &str| {
        entry
            .get(name)
            .map(Value::name_fragment)
            .ok_or_else(|| format!("entry has no field '{}'", name))
    };
    let commit = entry
        .str(fields::COMMIT)
        .ok_or_else(|| format!("entry has no field '{}'", fields::COMMIT))?;
    let features = entry
        .get(fields::FEATURES)
        .and_then(Value::as_string_list)
        .ok_or_else(|| format!("entry has no field '{}'", fields::FEATURES))?;

    Ok(format!(
        "{}-{}-{}-{}-{}",
        commit.chars().take(12).collect::<String>(),
        part(fields::TOOLCHAIN)?,
        part(fields::WORKSPACE)?,
        part(fields::LOCKFILE)?,
        features::feature_fingerprint(&features),
    ))
}

type DeriveResult = Result<Derived, String>;

/// What the derived fields know about one commit
#[derive(Debug, Clone)]
struct CommitTable {
    is_tip: bool,
    toolchains: Vec<ToolchainHandle>,
    members: Vec<String>,
    /// Feature sets per member, already selected
    feature_sets: BTreeMap<String, Vec<Vec<String>>>,
    designated: Option<String>,
    has_fuzz_targets: bool,
}

impl CommitTable {
    /// Toolchain for clippy and fmt: the configured channel, else the newest
    fn lint_toolchain(&self, channel: Option<Channel>) -> Option<&str> {
        match channel {
            Some(channel) => self
                .toolchains
                .iter()
                .find(|t| t.channel == channel)
                .map(|t| t.name.as_str()),
            None => self.newest_toolchain(),
        }
    }

    fn newest_toolchain(&self) -> Option<&str> {
        self.toolchains.first().map(|t| t.name.as_str())
    }

    fn nightly(&self) -> Option<&str> {
        self.toolchains
            .iter()
            .find(|t| t.channel == Channel::Nightly)
            .map(|t| t.name.as_str())
    }
}

#[derive(Debug, Default)]
struct Tables {
    commits: BTreeMap<String, CommitTable>,
    lint_channel: Option<Channel>,
    primary_lockfile: Option<LockfileStrategy>,
    overrides: BTreeMap<String, WorkspaceOverride>,
}

impl Tables {
    fn commit(&self, args: &FieldArgs<'_>) -> Result<&CommitTable, String> {
        let id = args.str(fields::COMMIT)?;
        self.commits
            .get(id)
            .ok_or_else(|| format!("no snapshot for commit {}", id))
    }

    fn workspace(&self, name: &str) -> WorkspaceOverride {
        self.overrides.get(name).cloned().unwrap_or_default()
    }

    /// Tip commit, designated member, primary lockfile
    fn is_primary(&self, table: &CommitTable, args: &FieldArgs<'_>) -> Result<bool, String> {
        let lockfile = args.str(fields::LOCKFILE)?;
        Ok(args.bool(fields::TIP)?
            && table.designated.as_deref() == Some(args.str(fields::WORKSPACE)?)
            && self.primary_lockfile.map(|l| l.as_str()) == Some(lockfile))
    }
}

/// Builder for the field map of one change.
///
/// Snapshot data is captured by the derived fields, so entries themselves
/// only carry small scalar values and feature lists.
pub struct StandardMatrix {
    change: String,
    commit_order: Vec<String>,
    lockfiles: Vec<LockfileStrategy>,
    designated_workspace: Option<String>,
    tables: Tables,
    selector: Arc<dyn FeatureSelector>,
}

impl StandardMatrix {
    pub fn new(change: impl Into<String>, config: &RunConfig, selector: Arc<dyn FeatureSelector>) -> Self {
        Self {
            change: change.into(),
            commit_order: Vec::new(),
            lockfiles: config.lockfiles.clone(),
            designated_workspace: config.designated_workspace.clone(),
            tables: Tables {
                commits: BTreeMap::new(),
                lint_channel: config.lint_channel,
                primary_lockfile: config.lockfiles.first().copied(),
                overrides: config.workspaces.clone(),
            },
            selector,
        }
    }

    /// Add a commit of the change with its resolved toolchains
    pub fn add_snapshot(&mut self, snapshot: &Snapshot, toolchains: Vec<ToolchainHandle>) {
        let members = snapshot.manifest.member_names();
        let designated = match &self.designated_workspace {
            Some(name) if members.contains(name) => Some(name.clone()),
            _ => members.first().cloned(),
        };

        let feature_sets = snapshot
            .manifest
            .members
            .iter()
            .map(|member| {
                let identity = format!("{}/{}", snapshot.commit.id, member.name);
                let sets = self.selector.select(&FeatureSource {
                    identity: &identity,
                    flags: &member.features,
                });
                (member.name.clone(), sets)
            })
            .collect();

        let id = snapshot.commit.id.clone();
        if !self.commit_order.contains(&id) {
            self.commit_order.push(id.clone());
        }
        self.tables.commits.insert(
            id,
            CommitTable {
                is_tip: snapshot.commit.is_tip,
                toolchains,
                members,
                feature_sets,
                designated,
                has_fuzz_targets: !snapshot.fuzz_targets.is_empty(),
            },
        );
    }

    pub fn change(&self) -> &str {
        &self.change
    }

    /// The field map; derived fields share the snapshot tables
    pub fn fields(self) -> FieldMap {
        let tables = Arc::new(self.tables);
        let lockfiles: Vec<&str> = self.lockfiles.iter().map(LockfileStrategy::as_str).collect();

        let t = tables.clone();
        let tip = move |args: &FieldArgs<'_>| -> DeriveResult {
            Ok(Value::Bool(t.commit(args)?.is_tip).into())
        };

        let t = tables.clone();
        let toolchain = move |args: &FieldArgs<'_>| -> DeriveResult {
            let table = t.commit(args)?;
            Ok(Derived::Many(
                table.toolchains.iter().map(|h| Value::from(&h.name)).collect(),
            ))
        };

        let t = tables.clone();
        let workspace = move |args: &FieldArgs<'_>| -> DeriveResult {
            let table = t.commit(args)?;
            Ok(Derived::Many(table.members.iter().map(Value::from).collect()))
        };

        let t = tables.clone();
        let features_field = move |args: &FieldArgs<'_>| -> DeriveResult {
            let table = t.commit(args)?;
            let member = args.str(fields::WORKSPACE)?;
            let sets = table
                .feature_sets
                .get(member)
                .ok_or_else(|| format!("unknown workspace member '{}'", member))?;
            Ok(Derived::Many(features::to_value(sets)))
        };

        let t = tables.clone();
        let release = move |args: &FieldArgs<'_>| -> DeriveResult {
            Ok(Value::Bool(t.workspace(args.str(fields::WORKSPACE)?).release).into())
        };

        let t = tables.clone();
        let clippy = move |args: &FieldArgs<'_>| -> DeriveResult {
            let table = t.commit(args)?;
            let enabled = t.is_primary(table, args)?
                && table.lint_toolchain(t.lint_channel) == Some(args.str(fields::TOOLCHAIN)?)
                && !t.workspace(args.str(fields::WORKSPACE)?).skip_clippy;
            Ok(Value::Bool(enabled).into())
        };

        let t = tables.clone();
        let doc = move |args: &FieldArgs<'_>| -> DeriveResult {
            let table = t.commit(args)?;
            let enabled = t.is_primary(table, args)?
                && table.newest_toolchain() == Some(args.str(fields::TOOLCHAIN)?)
                && !t.workspace(args.str(fields::WORKSPACE)?).skip_doc;
            Ok(Value::Bool(enabled).into())
        };

        // fmt and fuzz do not depend on features; run them on the empty set only
        let t = tables.clone();
        let fmt = move |args: &FieldArgs<'_>| -> DeriveResult {
            let table = t.commit(args)?;
            let no_features = args.get(fields::FEATURES)?.as_array().map_or(false, <[Value]>::is_empty);
            let enabled = t.is_primary(table, args)?
                && no_features
                && table.lint_toolchain(t.lint_channel) == Some(args.str(fields::TOOLCHAIN)?);
            Ok(Value::Bool(enabled).into())
        };

        let t = tables;
        let fuzz = move |args: &FieldArgs<'_>| -> DeriveResult {
            let table = t.commit(args)?;
            let no_features = args.get(fields::FEATURES)?.as_array().map_or(false, <[Value]>::is_empty);
            let enabled = t.is_primary(table, args)?
                && no_features
                && table.has_fuzz_targets
                && table.nightly() == Some(args.str(fields::TOOLCHAIN)?);
            Ok(Value::Bool(enabled).into())
        };

        let primary = [fields::COMMIT, fields::TIP, fields::WORKSPACE, fields::LOCKFILE];
        let with = |extra: &[&'static str]| -> Vec<&'static str> {
            primary.iter().chain(extra.iter()).copied().collect()
        };

        MatrixBuilder::new()
            .constant(fields::CHANGE, self.change.as_str())
            .enumerate(fields::COMMIT, self.commit_order.iter())
            .enumerate(fields::LOCKFILE, lockfiles)
            .derive(fields::TIP, &[fields::COMMIT], tip)
            .derive(fields::TOOLCHAIN, &[fields::COMMIT], toolchain)
            .derive(fields::WORKSPACE, &[fields::COMMIT], workspace)
            .derive(fields::FEATURES, &[fields::COMMIT, fields::WORKSPACE], features_field)
            .derive(fields::RELEASE, &[fields::WORKSPACE], release)
            .derive(fields::CLIPPY, &with(&[fields::TOOLCHAIN]), clippy)
            .derive(fields::DOC, &with(&[fields::TOOLCHAIN]), doc)
            .derive(fields::FMT, &with(&[fields::TOOLCHAIN, fields::FEATURES]), fmt)
            .derive(fields::FUZZ, &with(&[fields::TOOLCHAIN, fields::FEATURES]), fuzz)
            .build()
    }
}

// Manifest Reading
// Workspace members, features, and toolchain pins from cargo metadata and rust-toolchain files

use crate::error::{ServiceError, ServiceResult};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// What the matrix needs to know about a cargo workspace
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub root: PathBuf,
    /// Members in workspace order
    pub members: Vec<WorkspaceMember>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceMember {
    pub name: String,
    pub version: String,
    pub manifest_path: PathBuf,
    /// Declared feature names, sorted, including `default` when declared
    pub features: Vec<String>,
    pub rust_version: Option<String>,
}

impl Manifest {
    pub fn member(&self, name: &str) -> Option<&WorkspaceMember> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name.clone()).collect()
    }

    /// Highest `rust-version` declared by any member
    pub fn rust_version(&self) -> Option<&str> {
        self.members
            .iter()
            .filter_map(|m| m.rust_version.as_deref())
            .max_by(|a, b| compare_versions(a, b))
    }
}

#[derive(Deserialize)]
struct Metadata {
    packages: Vec<Package>,
    workspace_members: Vec<String>,
    workspace_root: PathBuf,
}

#[derive(Deserialize)]
struct Package {
    id: String,
    name: String,
    version: String,
    manifest_path: PathBuf,
    #[serde(default)]
    features: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    rust_version: Option<String>,
}

/// Parse the output of `cargo metadata --no-deps --format-version 1`
pub fn parse_metadata(json: &str, manifest_path: &Path) -> ServiceResult<Manifest> {
    let malformed = |message: String| ServiceError::MalformedManifest {
        path: manifest_path.to_path_buf(),
        message,
    };

    let metadata: Metadata =
        serde_json::from_str(json).map_err(|e| malformed(format!("invalid metadata: {}", e)))?;

    let members = metadata
        .workspace_members
        .iter()
        .map(|id| {
            let package = metadata
                .packages
                .iter()
                .find(|p| &p.id == id)
                .ok_or_else(|| malformed(format!("workspace member '{}' has no package", id)))?;
            Ok(WorkspaceMember {
                name: package.name.clone(),
                version: package.version.clone(),
                manifest_path: package.manifest_path.clone(),
                features: package.features.keys().cloned().collect(),
                rust_version: package.rust_version.clone(),
            })
        })
        .collect::<ServiceResult<Vec<_>>>()?;

    if members.is_empty() {
        return Err(malformed("workspace has no members".to_string()));
    }

    Ok(Manifest {
        root: metadata.workspace_root,
        members,
    })
}

#[derive(Debug, Deserialize)]
struct ToolchainFile {
    toolchain: ToolchainSection,
}

#[derive(Debug, Deserialize)]
struct ToolchainSection {
    channel: Option<String>,
}

/// Toolchain named by `rust-toolchain.toml` or a legacy `rust-toolchain` file.
///
/// A legacy file holding a `[toolchain]` table is read as TOML too. An
/// unreadable TOML file pins nothing.
pub fn parse_toolchain_file(contents: &str, is_toml: bool) -> Option<String> {
    let first = contents
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))?;

    if !is_toml && !first.starts_with('[') {
        return Some(first.to_string());
    }

    match toml::from_str::<ToolchainFile>(contents) {
        Ok(file) => file
            .toolchain
            .channel
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()),
        Err(err) => {
            tracing::warn!(error = %err, "unreadable toolchain file");
            None
        }
    }
}

/// Numeric comparison of dotted versions ("1.70" < "1.70.1" < "1.71")
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    parse(a).cmp(&parse(b))
}

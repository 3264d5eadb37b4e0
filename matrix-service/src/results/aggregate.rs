// Result Aggregation
// Names each entry's result and collects them into grouped, addressable output

use crate::error::{ServiceError, ServiceResult};
use crate::execution::checks::{CheckResult, CheckStatus};
use crate::matrix::MatrixEntry;
use crate::utils::sanitize_name;
use crate::value::Value;

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Closure naming an entry within its group
pub type NameFn = Arc<dyn Fn(&MatrixEntry) -> Result<String, String> + Send + Sync>;

/// How an entry's name is derived from its fields
#[derive(Clone)]
pub enum Discriminator {
    /// Name fragments of these fields, joined with `-`
    Fields(Vec<String>),
    Custom(NameFn),
}

impl Discriminator {
    pub fn fields(names: &[&str]) -> Self {
        Discriminator::Fields(names.iter().map(|n| n.to_string()).collect())
    }

    pub fn custom<F>(name: F) -> Self
    where
        F: Fn(&MatrixEntry) -> Result<String, String> + Send + Sync + 'static,
    {
        Discriminator::Custom(Arc::new(name))
    }

    pub fn name(&self, entry: &MatrixEntry) -> ServiceResult<String> {
        let raw = match self {
            Discriminator::Fields(names) => names
                .iter()
                .map(|name| entry.require(name).map(Value::name_fragment))
                .collect::<ServiceResult<Vec<_>>>()?
                .join("-"),
            Discriminator::Custom(name) => {
                name(entry).map_err(|e| ServiceError::Config(format!("cannot name entry {}: {}", entry, e)))?
            }
        };
        Ok(sanitize_name(&raw))
    }
}

impl fmt::Debug for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discriminator::Fields(names) => f.debug_tuple("Fields").field(names).finish(),
            Discriminator::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Address of a result: group, then name within the group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResultName {
    pub group: String,
    pub name: String,
}

impl fmt::Display for ResultName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// Assigns every entry a unique name inside its group
#[derive(Debug, Clone)]
pub struct Aggregator {
    group_by: String,
    discriminator: Discriminator,
}

impl Aggregator {
    pub fn new(group_by: impl Into<String>, discriminator: Discriminator) -> Self {
        Self {
            group_by: group_by.into(),
            discriminator,
        }
    }

    pub fn result_name(&self, entry: &MatrixEntry) -> ServiceResult<ResultName> {
        Ok(ResultName {
            group: entry.require(&self.group_by)?.name_fragment(),
            name: self.discriminator.name(entry)?,
        })
    }

    /// Names for all entries, in order. Two entries with the same name in one
    /// group is a `NamingCollision`.
    pub fn names(&self, entries: &[MatrixEntry]) -> ServiceResult<Vec<ResultName>> {
        let mut seen = std::collections::BTreeSet::new();
        entries
            .iter()
            .map(|entry| {
                let name = self.result_name(entry)?;
                if !seen.insert(name.clone()) {
                    return Err(ServiceError::NamingCollision {
                        group: name.group,
                        name: name.name,
                    });
                }
                Ok(name)
            })
            .collect()
    }

    /// Pair entries with their results (same order) into a result set
    pub fn aggregate(&self, entries: &[MatrixEntry], results: Vec<CheckResult>) -> ServiceResult<ResultSet> {
        if entries.len() != results.len() {
            return Err(ServiceError::Config(format!(
                "{} entries but {} results",
                entries.len(),
                results.len()
            )));
        }

        let names = self.names(entries)?;
        let mut set = ResultSet::default();
        for (name, mut result) in names.into_iter().zip(results) {
            result.name = Some(name.clone());
            set.groups
                .entry(name.group)
                .or_default()
                .insert(name.name, result);
        }
        Ok(set)
    }
}

/// Every attempted entry's result, by group and name
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    groups: BTreeMap<String, BTreeMap<String, CheckResult>>,
}

/// Counts and statuses written to `summary.json`
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub results: Vec<SummaryRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub group: String,
    pub name: String,
    pub status: CheckStatus,
    pub duration_ms: u64,
}

impl ResultSet {
    pub fn get(&self, group: &str, name: &str) -> Option<&CheckResult> {
        self.groups.get(group).and_then(|g| g.get(name))
    }

    pub fn group(&self, group: &str) -> Option<&BTreeMap<String, CheckResult>> {
        self.groups.get(group)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// All results as (group, name, result), ordered by group then name
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &CheckResult)> {
        self.groups.iter().flat_map(|(group, results)| {
            results
                .iter()
                .map(move |(name, result)| (group.as_str(), name.as_str(), result))
        })
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failed(&self) -> usize {
        self.iter().filter(|(_, _, r)| !r.success()).count()
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    pub fn summary(&self) -> Summary {
        let count = |status: CheckStatus| self.iter().filter(|(_, _, r)| r.status == status).count();
        Summary {
            total: self.len(),
            passed: self.iter().filter(|(_, _, r)| r.success()).count(),
            failed: count(CheckStatus::Failed),
            timed_out: count(CheckStatus::TimedOut),
            results: self
                .iter()
                .map(|(group, name, result)| SummaryRow {
                    group: group.to_string(),
                    name: name.to_string(),
                    status: result.status,
                    duration_ms: result.duration.as_millis() as u64,
                })
                .collect(),
        }
    }

    /// Write `<out>/<group>/<name>/{status,log.txt,result.json}` for every
    /// result and `<out>/summary.json`
    pub fn write_to_dir(&self, out: &Path) -> ServiceResult<Summary> {
        for (group, name, result) in self.iter() {
            let dir = out.join(group).join(name);
            fs::create_dir_all(&dir)?;
            fs::write(dir.join("status"), format!("{}\n", result.status))?;
            fs::write(dir.join("log.txt"), result.log())?;
            fs::write(dir.join("result.json"), serde_json::to_string_pretty(result)?)?;
        }

        let summary = self.summary();
        fs::create_dir_all(out)?;
        fs::write(out.join("summary.json"), serde_json::to_string_pretty(&summary)?)?;
        tracing::info!(dir = %out.display(), results = summary.total, "results written");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::checks::{SubCheck, SubCheckResult};
    use crate::matrix::{MatrixBuilder, MatrixExpander};
    use std::time::Duration;
    use tempfile::TempDir;

    fn entries() -> Vec<MatrixEntry> {
        let fields = MatrixBuilder::new()
            .enumerate("change", ["41", "42"])
            .enumerate("toolchain", ["stable", "nightly"])
            .enumerate("features", [Value::from(Vec::<String>::new()), Value::from(vec!["std"])])
            .build();
        MatrixExpander::expand(&fields).unwrap()
    }

    fn passed(entry: &MatrixEntry) -> CheckResult {
        CheckResult::from_steps(
            entry.clone(),
            vec![SubCheckResult {
                check: SubCheck::Build,
                status: CheckStatus::Passed,
                commands: vec!["cargo build".to_string()],
                exit_code: Some(0),
                duration: Duration::from_millis(10),
                log: "Compiling".to_string(),
                reason: None,
            }],
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_aggregate_every_entry() {
        let entries = entries();
        let aggregator = Aggregator::new("change", Discriminator::fields(&["toolchain", "features"]));
        let mut results: Vec<CheckResult> = entries.iter().map(passed).collect();
        results[1] = CheckResult::failed(entries[1].clone(), "fetch failed");

        let set = aggregator.aggregate(&entries, results).unwrap();

        assert_eq!(set.len(), 8);
        assert_eq!(set.group_names().collect::<Vec<_>>(), vec!["41", "42"]);
        assert_eq!(set.group("41").unwrap().len(), 4);
        assert_eq!(set.failed(), 1);
        assert!(!set.success());

        let name = aggregator.result_name(&entries[1]).unwrap();
        let failed = set.get(&name.group, &name.name).unwrap();
        assert_eq!(failed.cause.as_deref(), Some("fetch failed"));
        assert_eq!(failed.name.as_ref(), Some(&name));
        for (group, key, result) in set.iter() {
            let display = result.name.as_ref().map(ToString::to_string);
            assert_eq!(display, Some(format!("{}/{}", group, key)));
        }
    }

    #[test]
    fn test_collision_is_fatal() {
        let entries = entries();
        // Dropping features from the name makes pairs of entries collide
        let aggregator = Aggregator::new("change", Discriminator::fields(&["toolchain"]));
        let results = entries.iter().map(passed).collect();

        let err = aggregator.aggregate(&entries, results).unwrap_err();
        assert!(matches!(err, ServiceError::NamingCollision { ref group, .. } if group == "41"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_custom_discriminator() {
        let entries = entries();
        let aggregator = Aggregator::new(
            "change",
            Discriminator::custom(|entry| {
                let toolchain = entry.str("toolchain").ok_or("no toolchain")?;
                let features = entry.get("features").map(Value::name_fragment).unwrap_or_default();
                Ok(format!("{toolchain} {features}"))
            }),
        );

        let names = aggregator.names(&entries).unwrap();
        assert!(names.iter().all(|n| n.name.starts_with("stable_") || n.name.starts_with("nightly_")));
    }

    #[test]
    fn test_length_mismatch() {
        let entries = entries();
        let aggregator = Aggregator::new("change", Discriminator::fields(&["toolchain", "features"]));
        assert!(aggregator.aggregate(&entries, Vec::new()).is_err());
    }

    #[test]
    fn test_write_to_dir() {
        let out = TempDir::new().unwrap();
        let entries = entries();
        let aggregator = Aggregator::new("change", Discriminator::fields(&["toolchain", "features"]));
        let mut results: Vec<CheckResult> = entries.iter().map(passed).collect();
        results[0] = CheckResult::failed(entries[0].clone(), "cargo fetch failed");
        let first = aggregator.result_name(&entries[0]).unwrap();
        let second = aggregator.result_name(&entries[2]).unwrap();

        let summary = aggregator
            .aggregate(&entries, results)
            .unwrap()
            .write_to_dir(out.path())
            .unwrap();

        assert_eq!(summary.total, 8);
        assert_eq!(summary.failed, 1);

        let dir = out.path().join(&first.group).join(&first.name);
        assert_eq!(fs::read_to_string(dir.join("status")).unwrap(), "failed\n");
        assert!(fs::read_to_string(dir.join("log.txt")).unwrap().contains("cargo fetch failed"));

        let dir = out.path().join(&second.group).join(&second.name);
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("result.json")).unwrap()).unwrap();
        assert_eq!(json["status"], "passed");
        assert_eq!(json["entry"]["toolchain"], "stable");
        assert_eq!(json["name"]["group"], second.group.as_str());
        assert_eq!(json["name"]["name"], second.name.as_str());

        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.path().join("summary.json")).unwrap()).unwrap();
        assert_eq!(summary["results"].as_array().unwrap().len(), 8);
    }
}

// Feature Selection
// Chooses the feature-flag combinations tested for a source snapshot

use crate::value::{fingerprint, Value};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use std::collections::BTreeSet;

/// A set of feature flags, kept sorted
pub type FeatureSet = Vec<String>;

/// Cargo's implicit feature; never treated as an ordinary flag
const DEFAULT_FEATURE: &str = "default";

/// The inputs a selector may look at: the snapshot's identity and the flags
/// its manifest declares
#[derive(Debug, Clone, Copy)]
pub struct FeatureSource<'a> {
    /// Stable identity of the source (commit id, optionally with a member name)
    pub identity: &'a str,
    /// Flags declared in the manifest
    pub flags: &'a [String],
}

/// Pluggable policy producing the feature combinations to test
pub trait FeatureSelector: Send + Sync {
    fn select(&self, source: &FeatureSource<'_>) -> Vec<FeatureSet>;
}

/// Overrides applied on top of the mandatory combinations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FeaturePolicy {
    /// Flags never drawn into the sampled combination. They are still
    /// tested alone and as part of the full set.
    pub skip_sampling: BTreeSet<String>,
    /// Additional combinations to test
    pub extra: Vec<FeatureSet>,
    /// Combinations to drop from the sampled and extra part
    pub exclude: Vec<FeatureSet>,
}

/// Default selector: none, all, each flag alone, one hash-sampled subset, and
/// the policy's extra combinations.
#[derive(Debug, Clone, Default)]
pub struct SampledFeatureSelector {
    policy: FeaturePolicy,
}

impl SampledFeatureSelector {
    pub fn new(policy: FeaturePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FeaturePolicy {
        &self.policy
    }

    fn is_excluded(&self, set: &FeatureSet) -> bool {
        self.policy
            .exclude
            .iter()
            .any(|excluded| normalize(excluded) == *set)
    }
}

impl FeatureSelector for SampledFeatureSelector {
    fn select(&self, source: &FeatureSource<'_>) -> Vec<FeatureSet> {
        let flags: Vec<String> = normalize(source.flags)
            .into_iter()
            .filter(|f| f != DEFAULT_FEATURE)
            .collect();

        let mut selection: Vec<FeatureSet> = Vec::new();
        let mut push = |set: FeatureSet| {
            if !selection.contains(&set) {
                selection.push(set);
            }
        };

        push(Vec::new());
        push(flags.clone());
        for flag in &flags {
            push(vec![flag.clone()]);
        }

        let sample: FeatureSet = flags
            .iter()
            .filter(|f| !self.policy.skip_sampling.contains(*f))
            .filter(|f| is_sampled(source.identity, f))
            .cloned()
            .collect();
        if !self.is_excluded(&sample) {
            push(sample);
        }

        for extra in &self.policy.extra {
            let extra = normalize(extra);
            if !self.is_excluded(&extra) {
                push(extra);
            }
        }

        selection
    }
}

/// Whether `flag` belongs to the sampled subset for `identity`.
///
/// The first hex character of `sha256(identity + flag)` decides: `0`-`7` is
/// in, `8`-`f` is out. The same snapshot always samples the same flags.
pub fn is_sampled(identity: &str, flag: &str) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(flag.as_bytes());
    let digest = hasher.finalize();
    // High nibble of the first byte is the first hex character.
    (digest[0] >> 4) < 8
}

/// Short stable name for a feature set, used in result names
pub fn feature_fingerprint(set: &[String]) -> String {
    if set.is_empty() {
        return "nofeatures".to_string();
    }
    fingerprint(&normalize(set).join(","))
}

/// Matrix value for a list of feature sets
pub fn to_value(sets: &[FeatureSet]) -> Vec<Value> {
    sets.iter()
        .map(|set| Value::Array(set.iter().map(Value::from).collect()))
        .collect()
}

fn normalize(set: &[String]) -> FeatureSet {
    let sorted: BTreeSet<&String> = set.iter().collect();
    sorted.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn set(names: &[&str]) -> FeatureSet {
        flags(names)
    }

    #[test]
    fn test_mandatory_combinations_present() {
        let selector = SampledFeatureSelector::default();
        let manifest_flags = flags(&["serde", "async", "default", "std"]);

        for identity in ["aaaa", "bbbb", "0123456789abcdef"] {
            let selection = selector.select(&FeatureSource {
                identity,
                flags: &manifest_flags,
            });

            assert_eq!(selection[0], set(&[]));
            assert_eq!(selection[1], set(&["async", "serde", "std"]));
            assert!(selection.contains(&set(&["async"])));
            assert!(selection.contains(&set(&["serde"])));
            assert!(selection.contains(&set(&["std"])));
            assert!(!selection.iter().any(|s| s.contains(&"default".to_string())));
        }
    }

    #[test]
    fn test_selection_is_deterministic() {
        let selector = SampledFeatureSelector::default();
        let manifest_flags = flags(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        let source = FeatureSource {
            identity: "9fceb02d0ae598e95dc970b74767f19372d61af8",
            flags: &manifest_flags,
        };

        assert_eq!(selector.select(&source), selector.select(&source));
    }

    #[test]
    fn test_sampling_depends_on_identity() {
        let manifest_flags: Vec<String> = (0..16).map(|i| format!("f{i}")).collect();
        let samples: BTreeSet<Vec<bool>> = (0..8)
            .map(|i| {
                let identity = format!("commit-{i}");
                manifest_flags
                    .iter()
                    .map(|f| is_sampled(&identity, f))
                    .collect()
            })
            .collect();

        assert!(samples.len() > 1);
    }

    #[test]
    fn test_no_duplicates() {
        let selector = SampledFeatureSelector::new(FeaturePolicy {
            extra: vec![set(&["only"]), set(&[])],
            ..Default::default()
        });
        let manifest_flags = flags(&["only"]);
        let selection = selector.select(&FeatureSource {
            identity: "x",
            flags: &manifest_flags,
        });

        assert_eq!(selection, vec![set(&[]), set(&["only"])]);
    }

    #[test]
    fn test_skip_sampling_keeps_individual_test() {
        let manifest_flags = flags(&["a", "b", "c", "d", "e", "f", "g", "h", "heavy"]);
        let selector = SampledFeatureSelector::new(FeaturePolicy {
            skip_sampling: ["heavy".to_string()].into_iter().collect(),
            ..Default::default()
        });

        for i in 0..16 {
            let identity = format!("rev{i}");
            let selection = selector.select(&FeatureSource {
                identity: &identity,
                flags: &manifest_flags,
            });

            assert!(selection.contains(&set(&["heavy"])));
            assert!(selection[1].contains(&"heavy".to_string()));
            // Beyond none, all, and singletons, no combination carries the flag.
            for combo in &selection[2 + manifest_flags.len()..] {
                assert!(!combo.contains(&"heavy".to_string()));
            }
        }
    }

    #[test]
    fn test_extra_and_exclude() {
        let manifest_flags = flags(&["a", "b", "c"]);
        let selector = SampledFeatureSelector::new(FeaturePolicy {
            extra: vec![set(&["c", "a"]), set(&["b", "c"])],
            exclude: vec![set(&["c", "b"]), set(&["a"])],
            ..Default::default()
        });

        let selection = selector.select(&FeatureSource {
            identity: "rev",
            flags: &manifest_flags,
        });

        assert!(selection.contains(&set(&["a", "c"])));
        assert!(!selection.contains(&set(&["b", "c"])));
        // Singletons are mandatory even when excluded.
        assert!(selection.contains(&set(&["a"])));
    }

    #[test]
    fn test_feature_fingerprint() {
        assert_eq!(feature_fingerprint(&[]), "nofeatures");
        assert_eq!(
            feature_fingerprint(&set(&["b", "a"])),
            feature_fingerprint(&set(&["a", "b"]))
        );
        assert_ne!(
            feature_fingerprint(&set(&["a"])),
            feature_fingerprint(&set(&["b"]))
        );
    }
}

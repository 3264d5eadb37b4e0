// Matrix Expansion
// Resolves a field map into concrete matrix entries in dependency order

use crate::error::{ServiceError, ServiceResult};
use crate::matrix::entry::MatrixEntry;
use crate::matrix::field::{FieldArgs, FieldMap, FieldSpec};
use crate::value::Value;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Matrix expander for field maps
pub struct MatrixExpander;

impl MatrixExpander {
    /// Order in which fields can be resolved.
    ///
    /// A field becomes ready once everything it reads is resolved; among ready
    /// fields the lexicographically smallest name goes first, which keeps the
    /// enumeration order of `expand` reproducible.
    pub fn evaluation_order(fields: &FieldMap) -> ServiceResult<Vec<String>> {
        for (name, spec) in fields {
            for read in spec.reads() {
                if !fields.contains_key(read) {
                    return Err(ServiceError::UnresolvedReference {
                        field: name.clone(),
                        reference: read.clone(),
                    });
                }
            }
        }

        let mut resolved: BTreeSet<String> = BTreeSet::new();
        let mut order = Vec::with_capacity(fields.len());

        while order.len() < fields.len() {
            let next = fields.iter().find(|(name, spec)| {
                !resolved.contains(*name) && spec.reads().iter().all(|r| resolved.contains(r))
            });

            match next {
                Some((name, _)) => {
                    resolved.insert(name.clone());
                    order.push(name.clone());
                }
                None => {
                    return Err(ServiceError::CyclicDependency {
                        cycle: Self::find_cycle(fields, &resolved),
                    });
                }
            }
        }

        Ok(order)
    }

    /// Expand a field map into every combination of its values.
    ///
    /// Enumerations and list-valued derived fields branch (cartesian product);
    /// an empty candidate list removes the branch, so an empty enumeration
    /// yields no entries at all. A derived function runs once per distinct
    /// combination of the fields it reads.
    pub fn expand(fields: &FieldMap) -> ServiceResult<Vec<MatrixEntry>> {
        let order = Self::evaluation_order(fields)?;
        tracing::debug!(order = ?order, "matrix evaluation order");

        let mut partials: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];

        for name in &order {
            let spec = &fields[name];
            let mut derived_cache: HashMap<String, Vec<Value>> = HashMap::new();
            let mut next = Vec::new();

            for partial in partials {
                let candidates = match spec {
                    FieldSpec::Constant(value) => vec![value.clone()],
                    FieldSpec::Enumeration(values) => values.clone(),
                    FieldSpec::Derived { reads, derive } => {
                        let inputs = reads
                            .iter()
                            .map(|r| format!("{}={}", r, partial[r].canonical()))
                            .collect::<Vec<_>>()
                            .join(";");

                        match derived_cache.get(&inputs) {
                            Some(values) => values.clone(),
                            None => {
                                let args = FieldArgs::new(name, reads, &partial);
                                let values = derive(&args)
                                    .map_err(|message| ServiceError::DerivationFailed {
                                        field: name.clone(),
                                        message,
                                    })?
                                    .into_candidates();
                                derived_cache.insert(inputs, values.clone());
                                values
                            }
                        }
                    }
                };

                for value in candidates {
                    let mut bindings = partial.clone();
                    bindings.insert(name.clone(), value);
                    next.push(bindings);
                }
            }

            partials = next;
            if partials.is_empty() {
                tracing::debug!(field = %name, "field produced no candidates; matrix is empty");
                break;
            }
        }

        Ok(partials.into_iter().map(MatrixEntry::from_bindings).collect())
    }

    /// Locate a dependency cycle among the fields that could not be resolved
    fn find_cycle(fields: &FieldMap, resolved: &BTreeSet<String>) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for name in fields.keys() {
            if resolved.contains(name) || visited.contains(name.as_str()) {
                continue;
            }
            if let Some(cycle) = Self::dfs_cycle(fields, name, resolved, &mut visited, &mut stack)
            {
                return cycle;
            }
        }

        // Unreachable for a map that failed ordering; report the stuck fields.
        fields
            .keys()
            .filter(|name| !resolved.contains(*name))
            .cloned()
            .collect()
    }

    fn dfs_cycle<'a>(
        fields: &'a FieldMap,
        node: &'a str,
        resolved: &BTreeSet<String>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        stack.push(node);

        for dep in fields.get(node).map(FieldSpec::reads).unwrap_or(&[]) {
            if resolved.contains(dep) {
                continue;
            }
            if let Some(pos) = stack.iter().position(|n| *n == dep.as_str()) {
                let mut cycle: Vec<String> = stack[pos..].iter().map(|n| n.to_string()).collect();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep.as_str()) {
                if let Some(cycle) = Self::dfs_cycle(fields, dep, resolved, visited, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::field::{Derived, MatrixBuilder};

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn values(entries: &[MatrixEntry], names: &[&str]) -> Vec<Vec<Value>> {
        entries
            .iter()
            .map(|e| names.iter().map(|n| e.get(n).cloned().unwrap()).collect())
            .collect()
    }

    #[test]
    fn test_cartesian_expansion() {
        let fields = MatrixBuilder::new()
            .enumerate("a", [1, 2])
            .enumerate("b", ["x", "y"])
            .build();

        let entries = MatrixExpander::expand(&fields).unwrap();
        assert_eq!(entries.len(), 4);

        let mut combos = values(&entries, &["a", "b"]);
        combos.dedup();
        assert_eq!(combos.len(), 4);
        for a in [1, 2] {
            for b in ["x", "y"] {
                let combo = vec![Value::from(a), Value::from(b)];
                assert_eq!(combos.iter().filter(|c| **c == combo).count(), 1);
            }
        }
    }

    #[test]
    fn test_derived_sees_resolved_dependencies() {
        let fields = MatrixBuilder::new()
            .enumerate("a", [1, 2])
            .enumerate("b", [10])
            .derive("c", &["a", "b"], |args| {
                Ok(Value::from(args.number("a")? + args.number("b")?).into())
            })
            .build();

        let entries = MatrixExpander::expand(&fields).unwrap();
        assert_eq!(
            values(&entries, &["a", "b", "c"]),
            vec![
                vec![Value::from(1), Value::from(10), Value::from(11)],
                vec![Value::from(2), Value::from(10), Value::from(12)],
            ]
        );
    }

    #[test]
    fn test_derived_chain_orders_before_lexicographic_name() {
        // "a" sorts first but depends on "z", which must resolve before it.
        let fields = MatrixBuilder::new()
            .derive("a", &["z"], |args| {
                Ok(Value::from(format!("{}!", args.str("z")?)).into())
            })
            .enumerate("z", ["p", "q"])
            .build();

        assert_eq!(MatrixExpander::evaluation_order(&fields).unwrap(), vec!["z", "a"]);
        let entries = MatrixExpander::expand(&fields).unwrap();
        assert_eq!(entries[0].str("a"), Some("p!"));
        assert_eq!(entries[1].str("a"), Some("q!"));
    }

    #[test]
    fn test_cycle_detection() {
        let fields = MatrixBuilder::new()
            .derive("p", &["q"], |_| Ok(Value::Null.into()))
            .derive("q", &["p"], |_| Ok(Value::Null.into()))
            .enumerate("r", [1])
            .build();

        let err = MatrixExpander::expand(&fields).unwrap_err();
        match err {
            ServiceError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["p", "q", "p"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let fields = MatrixBuilder::new()
            .derive("loop", &["loop"], |_| Ok(Value::Null.into()))
            .build();

        let err = MatrixExpander::evaluation_order(&fields).unwrap_err();
        assert!(matches!(err, ServiceError::CyclicDependency { ref cycle } if cycle == &["loop", "loop"]));
    }

    #[test]
    fn test_cycle_rejected_before_any_derivation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let fields = MatrixBuilder::new()
            .enumerate("a", [1])
            .derive("b", &["a"], move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null.into())
            })
            .derive("p", &["q"], |_| Ok(Value::Null.into()))
            .derive("q", &["p"], |_| Ok(Value::Null.into()))
            .build();

        assert!(MatrixExpander::expand(&fields).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unresolved_reference() {
        let fields = MatrixBuilder::new()
            .derive("c", &["missing"], |_| Ok(Value::Null.into()))
            .build();

        let err = MatrixExpander::expand(&fields).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::UnresolvedReference { ref field, ref reference }
                if field == "c" && reference == "missing"
        ));
    }

    #[test]
    fn test_empty_enumeration_yields_no_entries() {
        let fields = MatrixBuilder::new()
            .enumerate("a", [1, 2, 3])
            .enumerate("b", Vec::<Value>::new())
            .build();

        assert!(MatrixExpander::expand(&fields).unwrap().is_empty());
    }

    #[test]
    fn test_derived_list_branches_and_empty_list_prunes() {
        let fields = MatrixBuilder::new()
            .enumerate("n", [0, 1, 2])
            .derive("k", &["n"], |args| {
                let n = args.number("n")? as i64;
                Ok(Derived::Many((0..n).map(Value::from).collect()))
            })
            .build();

        let entries = MatrixExpander::expand(&fields).unwrap();
        assert_eq!(
            values(&entries, &["n", "k"]),
            vec![
                vec![Value::from(1), Value::from(0)],
                vec![Value::from(2), Value::from(0)],
                vec![Value::from(2), Value::from(1)],
            ]
        );
    }

    #[test]
    fn test_derived_runs_once_per_input_combination() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let fields = MatrixBuilder::new()
            .enumerate("commit", ["c1", "c2"])
            .enumerate("toolchain", ["nightly", "stable", "beta"])
            .derive("features", &["commit"], move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Derived::Many(vec![
                    Value::Array(vec![]),
                    Value::from(vec![args.str("commit")?]),
                ]))
            })
            .build();

        let entries = MatrixExpander::expand(&fields).unwrap();
        assert_eq!(entries.len(), 12);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_derivation_error_aborts() {
        let fields = MatrixBuilder::new()
            .enumerate("a", [1])
            .derive("b", &["a"], |args| {
                args.str("a")?;
                Ok(Value::Null.into())
            })
            .build();

        let err = MatrixExpander::expand(&fields).unwrap_err();
        assert!(matches!(err, ServiceError::DerivationFailed { ref field, .. } if field == "b"));
    }

    #[test]
    fn test_enumeration_order_is_stable() {
        let build = || {
            MatrixBuilder::new()
                .enumerate("toolchain", ["nightly", "stable"])
                .enumerate("features", [Value::Array(vec![]), Value::from(vec!["foo"])])
                .constant("lockfile", "committed")
                .build()
        };

        let first: Vec<String> = MatrixExpander::expand(&build())
            .unwrap()
            .iter()
            .map(|e| e.to_string())
            .collect();
        let second: Vec<String> = MatrixExpander::expand(&build())
            .unwrap()
            .iter()
            .map(|e| e.to_string())
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }
}

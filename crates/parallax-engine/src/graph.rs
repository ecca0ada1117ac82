//! Build ordering.
//!
//! Modules build in topologically sorted groups; everything within one group
//! is independent and may build in parallel. Dependencies on modules outside
//! the graph impose no ordering here; the engine checks that each one
//! actually resolves (builtin or a known remote schema) before building.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{EngineError, EngineResult};

/// Sort the dependency graph into build groups. Each group is sorted by
/// module name and only depends on earlier groups.
pub fn topological_groups(graph: &HashMap<String, Vec<String>>) -> EngineResult<Vec<Vec<String>>> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = graph
        .iter()
        .map(|(module, deps)| {
            let deps = deps
                .iter()
                .filter(|dep| graph.contains_key(*dep))
                .map(String::as_str)
                .collect();
            (module.as_str(), deps)
        })
        .collect();

    let mut groups = Vec::new();
    while !remaining.is_empty() {
        let group: Vec<String> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(module, _)| (*module).to_owned())
            .collect();
        if group.is_empty() {
            return Err(EngineError::Cycle {
                unsorted: remaining.keys().map(|m| (*m).to_owned()).collect(),
            });
        }
        for module in &group {
            remaining.remove(module.as_str());
        }
        for deps in remaining.values_mut() {
            for module in &group {
                deps.remove(module.as_str());
            }
        }
        groups.push(group);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(m, deps)| {
                (
                    (*m).to_owned(),
                    deps.iter().map(|d| (*d).to_owned()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn groups_follow_dependency_order() {
        let graph = graph(&[
            ("alpha", &["beta", "gamma"]),
            ("beta", &["kappa"]),
            ("gamma", &["kappa"]),
            ("kappa", &[]),
        ]);
        let groups = topological_groups(&graph).unwrap();
        assert_eq!(
            groups,
            vec![
                vec!["kappa".to_owned()],
                vec!["beta".to_owned(), "gamma".to_owned()],
                vec!["alpha".to_owned()],
            ],
        );
    }

    #[test]
    fn cycles_name_the_unsorted_modules() {
        let graph = graph(&[
            ("alpha", &["beta"]),
            ("beta", &["alpha"]),
            ("kappa", &[]),
        ]);
        let err = topological_groups(&graph).unwrap_err();
        match err {
            EngineError::Cycle { unsorted } => {
                assert_eq!(unsorted, vec!["alpha".to_owned(), "beta".to_owned()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn external_dependencies_are_satisfied() {
        let graph = graph(&[("alpha", &["builtin", "remote"])]);
        let groups = topological_groups(&graph).unwrap();
        assert_eq!(groups, vec![vec!["alpha".to_owned()]]);
    }
}

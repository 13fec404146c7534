//! Layered topological sort over the included part of a [`DependencyGraph`].

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::{ReleaseError, ReleaseResult};
use crate::graph::DependencyGraph;

/// Group the repositories accepted by `include` into release levels.
///
/// Level 0 holds included repositories with no included dependency; level k
/// holds those whose included dependencies all sit below k. A dependency that
/// is not itself included is looked through, so `top -> mid -> base` with only
/// `top` and `base` included still places `base` before `top`.
///
/// Within a level, repositories keep discovery order.
pub fn compute_levels<F>(graph: &DependencyGraph, include: F) -> ReleaseResult<Vec<Vec<String>>>
where
    F: Fn(&str) -> bool,
{
    let included: Vec<&str> = graph
        .nodes()
        .iter()
        .map(|n| n.name.as_str())
        .filter(|name| include(name))
        .collect();
    let included_set: HashSet<&str> = included.iter().copied().collect();

    let deps: BTreeMap<&str, BTreeSet<&str>> = included
        .iter()
        .map(|&name| (name, effective_dependencies(graph, name, &included_set)))
        .collect();

    let mut placed: HashSet<&str> = HashSet::with_capacity(included.len());
    let mut levels: Vec<Vec<String>> = Vec::new();

    while placed.len() < included.len() {
        let ready: Vec<&str> = included
            .iter()
            .copied()
            .filter(|name| !placed.contains(name))
            .filter(|name| deps[name].iter().all(|d| placed.contains(d)))
            .collect();

        if ready.is_empty() {
            let remaining: Vec<&str> = included
                .iter()
                .copied()
                .filter(|name| !placed.contains(name))
                .collect();
            return Err(ReleaseError::Cycle {
                cycle: cycle_among(&remaining, &deps),
            });
        }

        placed.extend(ready.iter().copied());
        levels.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(levels)
}

/// Included repositories reachable from `name` through dependency edges,
/// stopping at the first included repository on each path.
fn effective_dependencies<'a>(
    graph: &'a DependencyGraph,
    name: &'a str,
    included: &HashSet<&'a str>,
) -> BTreeSet<&'a str> {
    let mut out = BTreeSet::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = graph.dependencies_of(name).iter().map(String::as_str).collect();

    while let Some(dep) = stack.pop() {
        if !seen.insert(dep) || dep == name {
            continue;
        }
        if included.contains(dep) {
            out.insert(dep);
        } else {
            stack.extend(graph.dependencies_of(dep).iter().map(String::as_str));
        }
    }
    out
}

/// Walk dependencies from the first stuck repository until a name repeats.
fn cycle_among(remaining: &[&str], deps: &BTreeMap<&str, BTreeSet<&str>>) -> Vec<String> {
    let stuck: HashSet<&str> = remaining.iter().copied().collect();
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = vec![start];
    let mut cur = start;
    loop {
        // Every stuck node waits on at least one other stuck node.
        let Some(&next) = deps[cur].iter().find(|d| stuck.contains(*d)) else {
            return remaining.iter().map(|s| s.to_string()).collect();
        };
        if let Some(pos) = path.iter().position(|p| *p == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
        cur = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use proptest::prelude::*;

    use crate::graph::RepositoryNode;
    use crate::types::ProjectType;

    fn node(name: &str, deps: &[String]) -> RepositoryNode {
        RepositoryNode {
            name: name.to_string(),
            dir: PathBuf::from(name),
            project_type: ProjectType::Go,
            module_path: Some(format!("m/{name}")),
            declared_dependencies: deps.iter().map(|d| format!("m/{d}")).collect(),
        }
    }

    fn graph(spec: &[(&str, &[&str])]) -> DependencyGraph {
        DependencyGraph::from_nodes(
            spec.iter()
                .map(|(n, d)| node(n, &d.iter().map(|s| s.to_string()).collect::<Vec<_>>()))
                .collect(),
        )
        .expect("graph")
    }

    #[test]
    fn base_before_app() {
        let g = graph(&[("app", &["base"]), ("base", &[])]);
        let levels = compute_levels(&g, |_| true).expect("levels");
        assert_eq!(levels, vec![vec!["base"], vec!["app"]]);
    }

    #[test]
    fn independent_repos_share_a_level_in_discovery_order() {
        let g = graph(&[("zeta", &[]), ("alpha", &[]), ("mid", &["zeta", "alpha"])]);
        let levels = compute_levels(&g, |_| true).expect("levels");
        assert_eq!(levels, vec![vec!["zeta", "alpha"], vec!["mid"]]);
    }

    #[test]
    fn excluded_repos_are_omitted() {
        let g = graph(&[("base", &[]), ("app", &["base"]), ("tool", &[])]);
        let levels = compute_levels(&g, |n| n != "base").expect("levels");
        assert_eq!(levels, vec![vec!["app", "tool"]]);
    }

    #[test]
    fn ordering_holds_through_excluded_middle() {
        let g = graph(&[("base", &[]), ("mid", &["base"]), ("top", &["mid"])]);
        let levels = compute_levels(&g, |n| n != "mid").expect("levels");
        assert_eq!(levels, vec![vec!["base"], vec!["top"]]);
    }

    #[test]
    fn cycle_is_named() {
        let g = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let err = compute_levels(&g, |_| true).unwrap_err();
        match err {
            ReleaseError::Cycle { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
                assert!(!cycle.contains(&"c".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_selection_yields_no_levels() {
        let g = graph(&[("a", &[])]);
        assert!(compute_levels(&g, |_| false).expect("levels").is_empty());
    }

    #[test]
    fn repeated_runs_are_identical() {
        let g = graph(&[("c", &["a"]), ("b", &[]), ("a", &[]), ("d", &["b", "c"])]);
        let first = compute_levels(&g, |_| true).expect("levels");
        for _ in 0..10 {
            assert_eq!(compute_levels(&g, |_| true).expect("levels"), first);
        }
    }

    /// Random graphs: edges only point from higher to lower index, plus
    /// an optional back edge that may close a cycle.
    fn graph_strategy() -> impl Strategy<Value = (Vec<Vec<usize>>, Vec<bool>, Option<(usize, usize)>)> {
        (2usize..12).prop_flat_map(|n| {
            let deps = proptest::collection::vec(proptest::collection::vec(0..n, 0..4), n);
            let include = proptest::collection::vec(proptest::bool::ANY, n);
            let back = proptest::option::of((0..n, 0..n));
            (deps, include, back)
        })
    }

    proptest! {
        #[test]
        fn levels_are_a_partition_or_a_cycle((raw, include, back) in graph_strategy()) {
            let n = raw.len();
            let mut deps: Vec<Vec<String>> = raw
                .iter()
                .enumerate()
                .map(|(i, ds)| ds.iter().filter(|&&d| d < i).map(|d| format!("r{d}")).collect())
                .collect();
            if let Some((from, to)) = back && to > from {
                deps[from].push(format!("r{to}"));
            }

            let nodes: Vec<RepositoryNode> =
                (0..n).map(|i| node(&format!("r{i}"), &deps[i])).collect();
            let g = DependencyGraph::from_nodes(nodes).expect("graph");
            let included: BTreeSet<String> = (0..n)
                .filter(|&i| include[i])
                .map(|i| format!("r{i}"))
                .collect();

            match compute_levels(&g, |name| included.contains(name)) {
                Ok(levels) => {
                    let flat: Vec<&String> = levels.iter().flatten().collect();
                    let unique: BTreeSet<String> = flat.iter().map(|s| s.to_string()).collect();
                    prop_assert_eq!(flat.len(), unique.len());
                    prop_assert_eq!(&unique, &included);

                    let level_of = |name: &str| levels.iter().position(|l| l.iter().any(|x| x == name));
                    for name in &included {
                        for dep in g.dependencies_of(name) {
                            if included.contains(dep) {
                                prop_assert!(level_of(dep) < level_of(name));
                            }
                        }
                    }
                }
                Err(ReleaseError::Cycle { cycle }) => {
                    prop_assert!(g.find_cycle().is_some());
                    prop_assert!(cycle.len() >= 2);
                }
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }
    }
}
